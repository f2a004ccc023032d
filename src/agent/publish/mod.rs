//! Publishing of observed table values into monotonic counters.
//!
//! The table holds cumulative values which may be read any number of times
//! and may go backwards if the datapath re-creates the table. Published
//! counters must never decrease, so each observation is reconciled against
//! the value already published for the same labels and only the positive
//! difference is added.

mod registry;

pub use registry::Registry;

use crate::agent::classify::Classification;
use ringlog::*;

use std::fmt;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BackendError {
    #[error("{family} already has {limit} label combinations")]
    Cardinality { family: &'static str, limit: usize },
    #[error("{family} expects labels {expected:?}, got {got:?}")]
    Labels {
        family: &'static str,
        expected: &'static [&'static str],
        got: Vec<&'static str>,
    },
}

/// A metric family. Each family holds one counter per label combination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    DropCount,
    DropBytes,
    ForwardCount,
    ForwardBytes,
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DropCount => "dpmetrics_drop_count_total",
            Self::DropBytes => "dpmetrics_drop_bytes_total",
            Self::ForwardCount => "dpmetrics_forward_count_total",
            Self::ForwardBytes => "dpmetrics_forward_bytes_total",
        }
    }

    /// The family name without the `_total` suffix, which the encoder adds
    /// to every counter sample.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::DropCount => "dpmetrics_drop_count",
            Self::DropBytes => "dpmetrics_drop_bytes",
            Self::ForwardCount => "dpmetrics_forward_count",
            Self::ForwardBytes => "dpmetrics_forward_bytes",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::DropCount => "Total dropped packets, tagged by drop reason and direction",
            Self::DropBytes => "Total dropped bytes, tagged by drop reason and direction",
            Self::ForwardCount => "Total forwarded packets, tagged by direction",
            Self::ForwardBytes => "Total forwarded bytes, tagged by direction",
        }
    }

    /// The label names every counter in this family carries, in order.
    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            Self::DropCount | Self::DropBytes => &["reason", "direction"],
            Self::ForwardCount | Self::ForwardBytes => &["direction"],
        }
    }

    /// Returns the `(count, bytes)` families for a classification.
    pub fn for_class(class: &Classification) -> (Family, Family) {
        if class.is_drop() {
            (Family::DropCount, Family::DropBytes)
        } else {
            (Family::ForwardCount, Family::ForwardBytes)
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An ordered set of label name/value pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(&'static str, &'static str)>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: &'static str) -> Self {
        self.0.push((name, value));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, &'static str)> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|(name, _)| *name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&'static str> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

impl From<&Classification> for Labels {
    fn from(class: &Classification) -> Self {
        match class {
            Classification::Drop { reason, direction } => Labels::new()
                .with("reason", *reason)
                .with("direction", direction.as_str()),
            Classification::Forward { direction } => {
                Labels::new().with("direction", direction.as_str())
            }
        }
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{name}=\"{value}\"")?;
        }
        Ok(())
    }
}

/// A handle to one published counter.
pub trait CounterHandle {
    fn value(&self) -> u64;

    fn add(&self, delta: u64);
}

impl CounterHandle for prometheus_client::metrics::counter::Counter {
    fn value(&self) -> u64 {
        self.get()
    }

    fn add(&self, delta: u64) {
        self.inc_by(delta);
    }
}

impl<T: CounterHandle + ?Sized> CounterHandle for Arc<T> {
    fn value(&self) -> u64 {
        (**self).value()
    }

    fn add(&self, delta: u64) {
        (**self).add(delta)
    }
}

/// Something that owns published counters and hands out handles to them,
/// creating a counter on first use of a label combination.
pub trait MetricsBackend {
    type Counter: CounterHandle;

    fn counter(&self, family: Family, labels: &Labels) -> Result<Self::Counter, BackendError>;
}

impl<T: MetricsBackend + ?Sized> MetricsBackend for Arc<T> {
    type Counter = T::Counter;

    fn counter(&self, family: Family, labels: &Labels) -> Result<Self::Counter, BackendError> {
        (**self).counter(family, labels)
    }
}

/// What a single publish did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The counter was increased by this amount.
    Increased(u64),
    /// The observation was not ahead of the published value.
    Unchanged,
    /// The backend could not provide a counter for these labels.
    Skipped,
}

/// Reconciles an observed cumulative value with the published counter for
/// `family` and `labels`, increasing the counter only if the observation is
/// ahead of it.
///
/// If the source goes backwards (eg: the table was re-created) the counter
/// holds its value until the source passes the previous high-water mark.
pub fn publish<B: MetricsBackend + ?Sized>(
    backend: &B,
    family: Family,
    labels: &Labels,
    observed: u64,
) -> Outcome {
    let counter = match backend.counter(family, labels) {
        Ok(counter) => counter,
        Err(e) => {
            warn!("failed to update {family}{{{labels}}}: {e}");
            return Outcome::Skipped;
        }
    };

    let published = counter.value();

    if observed > published {
        let delta = observed - published;
        counter.add(delta);
        Outcome::Increased(delta)
    } else {
        Outcome::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::classify::Direction;

    fn ingress() -> Labels {
        Labels::from(&Classification::Forward {
            direction: Direction::Ingress,
        })
    }

    #[test]
    fn test_publish_increases_by_delta() {
        let registry = Registry::new(16);
        let labels = ingress();

        assert_eq!(
            publish(&registry, Family::ForwardCount, &labels, 10),
            Outcome::Increased(10)
        );
        assert_eq!(
            publish(&registry, Family::ForwardCount, &labels, 15),
            Outcome::Increased(5)
        );
        assert_eq!(registry.value(Family::ForwardCount, &labels), Some(15));
    }

    #[test]
    fn test_publish_is_monotonic() {
        let registry = Registry::new(16);
        let labels = ingress();

        let observations = [5, 9, 9, 0, 3, 8, 12, 1, 20];
        let mut last = 0;

        for observed in observations {
            publish(&registry, Family::ForwardBytes, &labels, observed);
            let value = registry.value(Family::ForwardBytes, &labels).unwrap();
            assert!(value >= last, "counter went from {last} to {value}");
            last = value;
        }

        assert_eq!(last, 20);
    }

    #[test]
    fn test_publish_after_reset() {
        let registry = Registry::new(16);
        let labels = ingress();

        publish(&registry, Family::ForwardCount, &labels, 100);

        // the source was re-created and starts again from zero
        assert_eq!(
            publish(&registry, Family::ForwardCount, &labels, 40),
            Outcome::Unchanged
        );
        assert_eq!(registry.value(Family::ForwardCount, &labels), Some(100));

        assert_eq!(
            publish(&registry, Family::ForwardCount, &labels, 130),
            Outcome::Increased(30)
        );
    }

    #[test]
    fn test_publish_skips_on_backend_error() {
        let registry = Registry::new(1);
        let a = ingress();
        let b = Labels::from(&Classification::Forward {
            direction: Direction::Egress,
        });

        assert_eq!(
            publish(&registry, Family::ForwardCount, &a, 1),
            Outcome::Increased(1)
        );
        assert_eq!(
            publish(&registry, Family::ForwardCount, &b, 1),
            Outcome::Skipped
        );
        assert_eq!(registry.value(Family::ForwardCount, &b), None);
    }

    #[test]
    fn test_labels() {
        let labels = Labels::from(&Classification::Drop {
            reason: "Policy denied",
            direction: Direction::Egress,
        });

        assert_eq!(labels.names(), vec!["reason", "direction"]);
        assert_eq!(labels.get("reason"), Some("Policy denied"));
        assert_eq!(labels.to_string(), "reason=\"Policy denied\",direction=\"EGRESS\"");
    }
}
