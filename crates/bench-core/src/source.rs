//! Input record sources. A source is read sequentially by the producer and
//! is never restarted.

use serde::de::DeserializeOwned;
use std::io::BufRead;
use std::marker::PhantomData;

use crate::error::InputError;

/// A lazy, finite sequence of records.
pub trait RecordSource: Send + 'static {
    type Record: Send + 'static;

    /// Next record, `Ok(None)` at end of input.
    fn next_record(&mut self) -> Result<Option<Self::Record>, InputError>;
}

/// Newline-delimited text records. Blank lines are skipped.
pub struct LineSource<R> {
    reader: R,
    line: u64,
    buf: String,
}

impl<R: BufRead + Send + 'static> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// Read the next non-blank line, without its terminator.
    fn read_line(&mut self) -> Result<Option<&str>, InputError> {
        loop {
            self.buf.clear();
            self.line += 1;
            let n = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|source| InputError::Io {
                    line: self.line,
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.buf.trim_end_matches(['\n', '\r']);
            if !trimmed.trim().is_empty() {
                let len = trimmed.len();
                return Ok(Some(&self.buf[..len]));
            }
        }
    }
}

impl<R: BufRead + Send + 'static> RecordSource for LineSource<R> {
    type Record = String;

    fn next_record(&mut self) -> Result<Option<String>, InputError> {
        Ok(self.read_line()?.map(str::to_owned))
    }
}

/// One JSON document per line, decoded into `T`.
pub struct JsonLinesSource<R, T> {
    lines: LineSource<R>,
    _record: PhantomData<fn() -> T>,
}

impl<R: BufRead + Send + 'static, T> JsonLinesSource<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineSource::new(reader),
            _record: PhantomData,
        }
    }
}

impl<R, T> RecordSource for JsonLinesSource<R, T>
where
    R: BufRead + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Record = T;

    fn next_record(&mut self) -> Result<Option<T>, InputError> {
        let line = match self.lines.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let decoded = serde_json::from_str::<T>(line);
        decoded.map(Some).map_err(|e| InputError::Parse {
            line: self.lines.line,
            message: e.to_string(),
        })
    }
}

/// In-memory records, mostly for tests and generated workloads.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I, T> RecordSource for IterSource<I>
where
    I: Iterator<Item = Result<T, InputError>> + Send + 'static,
    T: Send + 'static,
{
    type Record = T;

    fn next_record(&mut self) -> Result<Option<T>, InputError> {
        self.iter.next().transpose()
    }
}
