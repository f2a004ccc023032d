use super::*;

use metriken::Value;
use parking_lot::RwLock;
use prometheus_client::encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric};
use prometheus_client::metrics::counter::{ConstCounter, Counter};
use prometheus_client::metrics::family::Family as LabeledFamily;

use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DropLabels {
    reason: String,
    direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ForwardLabels {
    direction: String,
}

/// The default metrics backend.
///
/// Holds one counter per family and label combination in a Prometheus
/// registry. Counters are created on first use and live as long as the
/// registry. The number of label combinations per family is bounded.
pub struct Registry {
    limit: usize,
    created: RwLock<BTreeMap<Family, BTreeSet<Labels>>>,
    inner: prometheus_client::registry::Registry,
    drop_count: LabeledFamily<DropLabels, Counter>,
    drop_bytes: LabeledFamily<DropLabels, Counter>,
    forward_count: LabeledFamily<ForwardLabels, Counter>,
    forward_bytes: LabeledFamily<ForwardLabels, Counter>,
}

impl Registry {
    pub fn new(limit: usize) -> Self {
        let mut inner = prometheus_client::registry::Registry::default();

        let drop_count = LabeledFamily::<DropLabels, Counter>::default();
        let drop_bytes = LabeledFamily::<DropLabels, Counter>::default();
        let forward_count = LabeledFamily::<ForwardLabels, Counter>::default();
        let forward_bytes = LabeledFamily::<ForwardLabels, Counter>::default();

        for (family, metric) in [
            (Family::DropCount, &drop_count),
            (Family::DropBytes, &drop_bytes),
        ] {
            inner.register(family.metric_name(), family.description(), metric.clone());
        }

        for (family, metric) in [
            (Family::ForwardCount, &forward_count),
            (Family::ForwardBytes, &forward_bytes),
        ] {
            inner.register(family.metric_name(), family.description(), metric.clone());
        }

        inner.register_collector(Box::new(AgentStats));

        Self {
            limit,
            created: RwLock::new(BTreeMap::new()),
            inner,
            drop_count,
            drop_bytes,
            forward_count,
            forward_bytes,
        }
    }

    /// Encodes every counter, including the agent's own stats, in the text
    /// exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner)?;
        Ok(buffer)
    }

    /// Current value of a counter, if it has been created.
    #[cfg(test)]
    pub fn value(&self, family: Family, labels: &Labels) -> Option<u64> {
        if !self.created.read().get(&family)?.contains(labels) {
            return None;
        }
        self.counter(family, labels)
            .ok()
            .map(|counter| counter.get())
    }

    /// Number of label combinations created for a family.
    #[cfg(test)]
    pub fn len(&self, family: Family) -> usize {
        self.created
            .read()
            .get(&family)
            .map(|created| created.len())
            .unwrap_or(0)
    }

    fn reserve(&self, family: Family, labels: &Labels) -> Result<(), BackendError> {
        if self
            .created
            .read()
            .get(&family)
            .is_some_and(|created| created.contains(labels))
        {
            return Ok(());
        }

        let mut created = self.created.write();
        let created = created.entry(family).or_default();

        if !created.contains(labels) && created.len() >= self.limit {
            return Err(BackendError::Cardinality {
                family: family.name(),
                limit: self.limit,
            });
        }

        created.insert(labels.clone());
        Ok(())
    }
}

impl MetricsBackend for Registry {
    type Counter = Counter;

    fn counter(&self, family: Family, labels: &Labels) -> Result<Self::Counter, BackendError> {
        let mismatch = || BackendError::Labels {
            family: family.name(),
            expected: family.label_names(),
            got: labels.names(),
        };

        if labels.names() != family.label_names() {
            return Err(mismatch());
        }

        self.reserve(family, labels)?;

        let direction = labels.get("direction").ok_or_else(mismatch)?.to_string();

        let counter = match family {
            Family::DropCount | Family::DropBytes => {
                let labels = DropLabels {
                    reason: labels.get("reason").ok_or_else(mismatch)?.to_string(),
                    direction,
                };
                let metric = if family == Family::DropCount {
                    &self.drop_count
                } else {
                    &self.drop_bytes
                };
                metric.get_or_create(&labels).clone()
            }
            Family::ForwardCount | Family::ForwardBytes => {
                let labels = ForwardLabels { direction };
                let metric = if family == Family::ForwardCount {
                    &self.forward_count
                } else {
                    &self.forward_bytes
                };
                metric.get_or_create(&labels).clone()
            }
        };

        Ok(counter)
    }
}

/// Exports the agent's own `metriken` counters, as registered by the
/// `#[metric]` statics, on every scrape.
#[derive(Debug)]
struct AgentStats;

impl prometheus_client::collector::Collector for AgentStats {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        for metric in metriken::metrics().iter() {
            let Some(Value::Counter(value)) = metric.value() else {
                continue;
            };

            let counter = ConstCounter::new(value);
            let metric_encoder = encoder.encode_descriptor(
                metric.name(),
                metric.description().unwrap_or_default(),
                None,
                counter.metric_type(),
            )?;
            counter.encode(metric_encoder)?;
        }

        Ok(())
    }
}
