use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Label of the aggregate group every cold and warm measurement feeds.
pub const LABEL_ALL_REQUESTS: &str = "all requests";

/// Aggregates of all cold and all warm measurements, kept on warm runs.
pub const LABEL_COLD_REQUESTS: &str = "cold requests";
pub const LABEL_WARM_REQUESTS: &str = "warm requests";

/// Suffix appended to a label for warm-run measurements.
pub const WARM_SUFFIX: &str = "_warm";

/// One latency measurement emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatEvent {
    pub label: String,
    /// Latency in milliseconds
    pub value: f64,
    pub is_warm: bool,
}

impl StatEvent {
    pub fn cold(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
            is_warm: false,
        }
    }

    pub fn warm(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
            is_warm: true,
        }
    }

    /// Key of the group this event is merged into.
    pub fn group_key(&self) -> String {
        if self.is_warm {
            format!("{}{}", self.label, WARM_SUFFIX)
        } else {
            self.label.clone()
        }
    }
}

/// Constant-memory streaming statistics over a series of values.
///
/// All fields are zero until the first [`StatGroup::push`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatGroup {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum: f64,
    pub count: u64,
}

impl StatGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
        self.mean = self.sum / self.count as f64;
    }

    /// Fold another group into this one. Equivalent to pushing every value
    /// the other group saw.
    pub fn merge(&mut self, other: &StatGroup) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        self.mean = self.sum / self.count as f64;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for StatGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min: {:8.2}ms, max: {:8.2}ms, mean: {:8.2}ms, count: {}, sum: {:5.1}sec",
            self.min,
            self.max,
            self.mean,
            self.count,
            self.sum / 1e3
        )
    }
}

/// A labeled group as it appears in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledGroup {
    pub label: String,
    #[serde(flatten)]
    pub stats: StatGroup,
}

/// Per-label groups in first-seen order plus the global group.
///
/// Owned by exactly one task; events reach it through a channel.
#[derive(Debug, Clone)]
pub struct StatAggregator {
    groups: Vec<LabeledGroup>,
    index: HashMap<String, usize>,
    all: StatGroup,
    cold: Option<StatGroup>,
    warm: Option<StatGroup>,
    burn_in: u64,
    burned_cold: u64,
    burned_warm: u64,
    events: u64,
}

impl StatAggregator {
    pub fn new(burn_in: u64) -> Self {
        Self {
            groups: Vec::new(),
            index: HashMap::new(),
            all: StatGroup::new(),
            cold: None,
            warm: None,
            burn_in,
            burned_cold: 0,
            burned_warm: 0,
            events: 0,
        }
    }

    /// Also keep separate cold and warm aggregates.
    pub fn with_warm_split(mut self, enabled: bool) -> Self {
        if enabled {
            self.cold = Some(StatGroup::new());
            self.warm = Some(StatGroup::new());
        } else {
            self.cold = None;
            self.warm = None;
        }
        self
    }

    /// Merge one event. Returns false when the event was discarded as burn-in.
    ///
    /// The first `burn_in` events of each kind are discarded, so a cold run
    /// and its warm re-run are dropped together.
    pub fn record(&mut self, event: &StatEvent) -> bool {
        let burned = if event.is_warm {
            &mut self.burned_warm
        } else {
            &mut self.burned_cold
        };
        if *burned < self.burn_in {
            *burned += 1;
            return false;
        }

        let key = event.group_key();
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                self.groups.push(LabeledGroup {
                    label: key.clone(),
                    stats: StatGroup::new(),
                });
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        self.groups[idx].stats.push(event.value);
        self.all.push(event.value);
        let split = if event.is_warm {
            self.warm.as_mut()
        } else {
            self.cold.as_mut()
        };
        if let Some(group) = split {
            group.push(event.value);
        }
        self.events += 1;
        true
    }

    pub fn get(&self, label: &str) -> Option<&StatGroup> {
        self.index.get(label).map(|&idx| &self.groups[idx].stats)
    }

    pub fn all(&self) -> &StatGroup {
        &self.all
    }

    /// Number of events merged (burn-in excluded).
    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn summary(&self) -> StatSummary {
        StatSummary {
            groups: self.groups.clone(),
            all: self.all,
            cold: self.cold,
            warm: self.warm,
            events: self.events,
            burned_in: self.burned_cold,
        }
    }

    pub fn into_summary(self) -> StatSummary {
        StatSummary {
            groups: self.groups,
            all: self.all,
            cold: self.cold,
            warm: self.warm,
            events: self.events,
            burned_in: self.burned_cold,
        }
    }
}

/// Final result of the stat processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub groups: Vec<LabeledGroup>,
    pub all: StatGroup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold: Option<StatGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<StatGroup>,
    pub events: u64,
    /// Cold measurements discarded as burn-in
    pub burned_in: u64,
}

impl StatSummary {
    pub fn group(&self, label: &str) -> Option<&StatGroup> {
        self.groups
            .iter()
            .find(|g| g.label == label)
            .map(|g| &g.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_stat_group_single_value() {
        let mut group = StatGroup::new();
        assert!(group.is_empty());

        group.push(4.5);
        assert_eq!(group.min, 4.5);
        assert_eq!(group.max, 4.5);
        assert_eq!(group.mean, 4.5);
        assert_eq!(group.sum, 4.5);
        assert_eq!(group.count, 1);
    }

    #[test]
    fn test_stat_group_basic() {
        let mut group = StatGroup::new();
        for v in [10.0, 2.0, 6.0] {
            group.push(v);
        }

        assert_eq!(group.min, 2.0);
        assert_eq!(group.max, 10.0);
        assert_eq!(group.count, 3);
        assert!((group.sum - 18.0).abs() < EPS);
        assert!((group.mean - 6.0).abs() < EPS);
    }

    #[test]
    fn test_push_order_does_not_matter() {
        let orders = [
            [1.0, 5.0, 3.0],
            [1.0, 3.0, 5.0],
            [3.0, 1.0, 5.0],
            [3.0, 5.0, 1.0],
            [5.0, 1.0, 3.0],
            [5.0, 3.0, 1.0],
        ];
        let mut first: Option<StatGroup> = None;
        for order in orders {
            let mut group = StatGroup::new();
            for v in order {
                group.push(v);
            }
            match first {
                None => first = Some(group),
                Some(expected) => assert_eq!(group, expected),
            }
        }
        let group = first.unwrap();
        assert_eq!((group.min, group.max, group.mean, group.count), (1.0, 5.0, 3.0, 3));
    }

    #[test]
    fn test_merge_matches_push() {
        let mut a = StatGroup::new();
        let mut b = StatGroup::new();
        let mut both = StatGroup::new();
        for v in [1.0, 9.0] {
            a.push(v);
            both.push(v);
        }
        for v in [4.0, 0.5, 7.0] {
            b.push(v);
            both.push(v);
        }

        a.merge(&b);
        assert_eq!(a.min, both.min);
        assert_eq!(a.max, both.max);
        assert_eq!(a.count, both.count);
        assert!((a.mean - both.mean).abs() < EPS);

        let mut empty = StatGroup::new();
        empty.merge(&StatGroup::new());
        assert!(empty.is_empty());
        empty.merge(&b);
        assert_eq!(empty, b);
    }

    #[test]
    fn test_aggregator_groups_by_label_in_first_seen_order() {
        let mut agg = StatAggregator::new(0);
        agg.record(&StatEvent::cold("lastpoint", 3.0));
        agg.record(&StatEvent::cold("groupby", 8.0));
        agg.record(&StatEvent::warm("lastpoint", 1.0));
        agg.record(&StatEvent::cold("lastpoint", 5.0));

        let summary = agg.summary();
        let labels: Vec<&str> = summary.groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["lastpoint", "groupby", "lastpoint_warm"]);

        let cold = summary.group("lastpoint").unwrap();
        assert_eq!(cold.count, 2);
        assert_eq!(cold.mean, 4.0);

        let warm = summary.group("lastpoint_warm").unwrap();
        assert_eq!(warm.count, 1);
        assert_eq!(warm.max, 1.0);

        assert_eq!(summary.all.count, 4);
        assert_eq!(summary.all.min, 1.0);
        assert_eq!(summary.all.max, 8.0);
        assert_eq!(summary.events, 4);
    }

    #[test]
    fn test_aggregator_burn_in() {
        let mut agg = StatAggregator::new(2);
        assert!(!agg.record(&StatEvent::cold("q", 100.0)));
        assert!(!agg.record(&StatEvent::cold("q", 80.0)));
        assert!(agg.record(&StatEvent::cold("q", 2.0)));
        assert!(agg.record(&StatEvent::cold("q", 3.0)));

        let summary = agg.into_summary();
        assert_eq!(summary.burned_in, 2);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.group("q").unwrap().max, 3.0);
        assert_eq!(summary.all.max, 3.0);
    }

    #[test]
    fn test_burn_in_drops_warm_reruns_with_their_cold_runs() {
        let mut agg = StatAggregator::new(2);
        let mut kept = Vec::new();
        for (cold, warm) in [(100.0, 90.0), (80.0, 70.0), (5.0, 1.0), (6.0, 2.0)] {
            kept.push(agg.record(&StatEvent::cold("q", cold)));
            kept.push(agg.record(&StatEvent::warm("q", warm)));
        }
        assert_eq!(kept, vec![false, false, false, false, true, true, true, true]);

        let summary = agg.into_summary();
        let labels: Vec<&str> = summary.groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["q", "q_warm"]);
        assert_eq!(summary.group("q").unwrap().count, 2);
        assert_eq!(summary.group("q_warm").unwrap().count, 2);
        assert_eq!(summary.group("q_warm").unwrap().max, 2.0);
        assert_eq!(summary.burned_in, 2);
    }

    #[test]
    fn test_warm_split_groups() {
        let mut agg = StatAggregator::new(0).with_warm_split(true);
        agg.record(&StatEvent::cold("a", 10.0));
        agg.record(&StatEvent::warm("a", 1.0));
        agg.record(&StatEvent::cold("b", 20.0));
        agg.record(&StatEvent::warm("b", 3.0));

        let summary = agg.into_summary();
        let cold = summary.cold.unwrap();
        let warm = summary.warm.unwrap();
        assert_eq!((cold.count, cold.min, cold.max), (2, 10.0, 20.0));
        assert_eq!((warm.count, warm.min, warm.max), (2, 1.0, 3.0));
        assert_eq!(summary.all.count, 4);

        let plain = StatAggregator::new(0).into_summary();
        assert!(plain.cold.is_none() && plain.warm.is_none());
    }

    #[test]
    fn test_display_format() {
        let mut group = StatGroup::new();
        group.push(1500.0);
        let s = group.to_string();
        assert!(s.contains("count: 1"), "{s}");
        assert!(s.contains("sum:   1.5sec"), "{s}");
    }

    proptest! {
        #[test]
        fn prop_stat_group_tracks_extremes(values in proptest::collection::vec(0.0f64..10_000.0, 1..200)) {
            let mut group = StatGroup::new();
            for &v in &values {
                group.push(v);
            }

            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = values.iter().sum();

            prop_assert_eq!(group.count, values.len() as u64);
            prop_assert_eq!(group.min, min);
            prop_assert_eq!(group.max, max);
            prop_assert!((group.sum - sum).abs() <= 1e-6 * sum.max(1.0));
            prop_assert!((group.mean - sum / values.len() as f64).abs() <= 1e-6 * group.mean.max(1.0));
            prop_assert!(group.min <= group.mean + 1e-9 && group.mean <= group.max + 1e-9);
        }

        #[test]
        fn prop_reversed_order_yields_same_group(values in proptest::collection::vec(0u32..1000, 1..100)) {
            let mut forward = StatGroup::new();
            let mut backward = StatGroup::new();
            for &v in &values {
                forward.push(v as f64);
            }
            for &v in values.iter().rev() {
                backward.push(v as f64);
            }
            prop_assert_eq!(forward, backward);
        }
    }
}
