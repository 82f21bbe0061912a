pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod producer;
pub mod rate_limiter;
pub mod report;
pub mod source;
pub mod stats;
pub mod worker;

pub use batch::*;
pub use bootstrap::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use pipeline::*;
pub use pool::*;
pub use processor::*;
pub use producer::*;
pub use rate_limiter::*;
pub use report::*;
pub use source::*;
pub use stats::*;
pub use worker::*;
