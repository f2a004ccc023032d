use super::classify::Classification;
use super::publish::{publish, Family, Labels, MetricsBackend, Outcome};
use super::stats::*;
use super::table::{CounterTable, TableError, Value};

use ringlog::*;

use std::collections::HashMap;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("error dumping contents of metrics map: {0}")]
    Walk(#[from] TableError),
    #[error("deadline exceeded after {entries} entries")]
    Deadline { entries: usize },
}

/// Summary of one completed sync cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Table entries read.
    pub entries: usize,
    /// Counters that were increased.
    pub increased: usize,
    /// Counters whose observation was not ahead of the published value.
    pub unchanged: usize,
    /// Counter updates skipped because the backend rejected the labels.
    pub skipped: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Increased(_) => self.increased += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Harvests a metrics table into a metrics backend.
///
/// Both collaborators are injected and owned for the lifetime of the
/// harvester. The harvester holds no state of its own between cycles: the
/// published values in the backend are the only record of prior walks.
pub struct Harvester<T, B> {
    table: T,
    backend: B,
}

impl<T: CounterTable, B: MetricsBackend> Harvester<T, B> {
    pub fn new(table: T, backend: B) -> Self {
        Self { table, backend }
    }

    #[cfg(test)]
    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs one sync cycle.
    ///
    /// Walks the whole table, sums the per-CPU shards of every entry and
    /// totals them by classification. Only once the walk has completed are the
    /// totals published, so a walk that fails or runs past `deadline`
    /// publishes nothing. Entries not seen are picked up by the next cycle.
    ///
    /// A cycle is all or nothing. A single entry that never decodes, or a
    /// deadline that always expires, therefore holds back every counter until
    /// it clears; each such cycle is logged and counted in
    /// `dpmetrics_sync_failures`.
    pub fn sync(&self, deadline: Option<Instant>) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        SYNC_RUNS.increment();

        let result = self.walk(deadline).map(|totals| self.publish(totals));

        SYNC_DURATION.add(start.elapsed().as_nanos() as u64);

        match result {
            Ok(report) => {
                SYNC_ENTRIES.add(report.entries as u64);
                SYNC_SKIPPED.add(report.skipped as u64);
                debug!(
                    "synced {} entries: {} increased, {} unchanged, {} skipped",
                    report.entries, report.increased, report.unchanged, report.skipped
                );
                Ok(report)
            }
            Err(e) => {
                SYNC_FAILURES.increment();
                Err(e)
            }
        }
    }

    fn walk(&self, deadline: Option<Instant>) -> Result<Totals, SyncError> {
        let mut totals = Totals::default();

        for entry in self.table.walk()? {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(SyncError::Deadline {
                    entries: totals.entries,
                });
            }

            let (key, values) = entry?;
            let value = values.sum();

            trace!("{key} => {value}");

            totals.add(key.classify(), value);
        }

        Ok(totals)
    }

    fn publish(&self, totals: Totals) -> SyncReport {
        let mut report = SyncReport {
            entries: totals.entries,
            ..Default::default()
        };

        for (class, value) in totals.by_class {
            let labels = Labels::from(&class);
            let (count, bytes) = Family::for_class(&class);

            report.record(publish(&self.backend, count, &labels, value.count));
            report.record(publish(&self.backend, bytes, &labels, value.bytes));
        }

        report
    }
}

/// Per-classification totals gathered during a walk.
///
/// Several reason codes can share a label (eg: every unnamed reason is
/// reported as unknown) so entries are summed per label combination before
/// publishing. Each counter is then published at most once per walk.
#[derive(Default)]
struct Totals {
    entries: usize,
    by_class: HashMap<Classification, Value>,
}

impl Totals {
    fn add(&mut self, class: Classification, value: Value) {
        self.entries += 1;

        let total = self.by_class.entry(class).or_default();
        total.count = total.count.saturating_add(value.count);
        total.bytes = total.bytes.saturating_add(value.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::classify::UNKNOWN_REASON;
    use crate::agent::publish::{BackendError, Registry};
    use crate::agent::table::{Key, MemoryTable, RawEntry, Walk};

    use std::sync::Arc;
    use std::time::Duration;

    fn forward(direction: &'static str) -> Labels {
        Labels::new().with("direction", direction)
    }

    fn dropped(reason: &'static str, direction: &'static str) -> Labels {
        Labels::new()
            .with("reason", reason)
            .with("direction", direction)
    }

    /// Encoded lines of the published families, without the agent's own
    /// stats which change on every cycle.
    fn published(registry: &Registry) -> Vec<String> {
        registry
            .encode()
            .unwrap()
            .lines()
            .filter(|line| !line.contains("dpmetrics_sync_"))
            .map(String::from)
            .collect()
    }

    fn harvester(cpus: usize) -> Harvester<Arc<MemoryTable>, Arc<Registry>> {
        Harvester::new(Arc::new(MemoryTable::new(cpus)), Arc::new(Registry::new(1024)))
    }

    #[test]
    fn test_forward_scenario() {
        let harvester = harvester(1);
        let table = harvester.table();
        let registry = harvester.backend();
        let ingress = forward("INGRESS");

        table.set(Key::new(0, 1), &[Value::new(10, 1000)]).unwrap();
        harvester.sync(None).unwrap();

        assert_eq!(registry.value(Family::ForwardCount, &ingress), Some(10));
        assert_eq!(registry.value(Family::ForwardBytes, &ingress), Some(1000));

        table.set(Key::new(0, 1), &[Value::new(15, 1500)]).unwrap();
        let report = harvester.sync(None).unwrap();

        assert_eq!(report.increased, 2);
        assert_eq!(registry.value(Family::ForwardCount, &ingress), Some(15));
        assert_eq!(registry.value(Family::ForwardBytes, &ingress), Some(1500));
    }

    #[test]
    fn test_drop_scenario() {
        let harvester = harvester(2);
        let registry = harvester.backend();

        harvester
            .table()
            .set(Key::new(200, 2), &[Value::new(3, 300), Value::new(4, 400)])
            .unwrap();

        let report = harvester.sync(None).unwrap();
        assert_eq!(report.entries, 1);

        let labels = dropped(UNKNOWN_REASON, "EGRESS");
        assert_eq!(registry.value(Family::DropCount, &labels), Some(7));
        assert_eq!(registry.value(Family::DropBytes, &labels), Some(700));
        assert_eq!(registry.len(Family::ForwardCount), 0);
    }

    #[test]
    fn test_rewalk_is_idempotent() {
        let harvester = harvester(4);
        let table = harvester.table();

        table.set(Key::new(0, 1), &[Value::new(1, 64)]).unwrap();
        table
            .set(Key::new(133, 2), &[Value::new(2, 128), Value::new(5, 9)])
            .unwrap();
        table.set(Key::new(2, 0), &[Value::new(8, 800)]).unwrap();

        let first = harvester.sync(None).unwrap();
        assert_eq!(first.increased, 6);

        let before = published(harvester.backend());

        let second = harvester.sync(None).unwrap();
        assert_eq!(second.increased, 0);
        assert_eq!(second.unchanged, 6);

        assert_eq!(before, published(harvester.backend()));
    }

    #[test]
    fn test_table_reset_never_decreases() {
        let harvester = harvester(1);
        let table = harvester.table();
        let registry = harvester.backend();
        let egress = forward("EGRESS");

        table.set(Key::new(0, 2), &[Value::new(50, 5000)]).unwrap();
        harvester.sync(None).unwrap();

        table.clear();
        table.set(Key::new(0, 2), &[Value::new(5, 500)]).unwrap();
        harvester.sync(None).unwrap();

        assert_eq!(registry.value(Family::ForwardCount, &egress), Some(50));
        assert_eq!(registry.value(Family::ForwardBytes, &egress), Some(5000));

        table.set(Key::new(0, 2), &[Value::new(60, 4000)]).unwrap();
        harvester.sync(None).unwrap();

        // count and bytes are reconciled independently
        assert_eq!(registry.value(Family::ForwardCount, &egress), Some(60));
        assert_eq!(registry.value(Family::ForwardBytes, &egress), Some(5000));
    }

    #[test]
    fn test_unknown_direction() {
        let harvester = harvester(1);

        let table = harvester.table();

        table.set(Key::new(0, 3), &[Value::new(1, 1)]).unwrap();
        table.set(Key::new(0, 0), &[Value::new(2, 2)]).unwrap();
        harvester.sync(None).unwrap();

        // both keys resolve to the same labels and are summed
        assert_eq!(
            harvester
                .backend()
                .value(Family::ForwardCount, &forward("UNKNOWN")),
            Some(3)
        );
    }

    #[test]
    fn test_shared_labels_are_summed() {
        let harvester = harvester(1);
        let table = harvester.table();
        let labels = dropped(UNKNOWN_REASON, "INGRESS");

        table.set(Key::new(200, 1), &[Value::new(5, 50)]).unwrap();
        table.set(Key::new(201, 1), &[Value::new(3, 30)]).unwrap();

        let report = harvester.sync(None).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.increased, 2);
        assert_eq!(harvester.backend().value(Family::DropCount, &labels), Some(8));

        table.set(Key::new(201, 1), &[Value::new(4, 40)]).unwrap();
        harvester.sync(None).unwrap();
        assert_eq!(harvester.backend().value(Family::DropCount, &labels), Some(9));
        assert_eq!(harvester.backend().value(Family::DropBytes, &labels), Some(90));
    }

    /// A backend that refuses one label combination.
    struct Picky {
        registry: Registry,
        reject: Labels,
    }

    impl MetricsBackend for Picky {
        type Counter = <Registry as MetricsBackend>::Counter;

        fn counter(&self, family: Family, labels: &Labels) -> Result<Self::Counter, BackendError> {
            if *labels == self.reject {
                return Err(BackendError::Cardinality {
                    family: family.name(),
                    limit: 0,
                });
            }
            self.registry.counter(family, labels)
        }
    }

    #[test]
    fn test_partial_failure_isolation() {
        let table = MemoryTable::new(1);
        table.set(Key::new(0, 1), &[Value::new(10, 1000)]).unwrap();
        table.set(Key::new(133, 1), &[Value::new(4, 400)]).unwrap();
        table.set(Key::new(0, 2), &[Value::new(6, 600)]).unwrap();

        let backend = Picky {
            registry: Registry::new(1024),
            reject: dropped("Policy denied", "INGRESS"),
        };

        let harvester = Harvester::new(table, backend);
        let report = harvester.sync(None).unwrap();

        assert_eq!(report.entries, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.increased, 4);

        let registry = &harvester.backend().registry;
        assert_eq!(registry.value(Family::ForwardCount, &forward("INGRESS")), Some(10));
        assert_eq!(registry.value(Family::ForwardBytes, &forward("EGRESS")), Some(600));
        assert_eq!(registry.len(Family::DropCount), 0);
    }

    /// A table whose enumeration breaks part way through.
    struct Broken;

    impl CounterTable for Broken {
        fn walk(&self) -> Result<Walk<'_>, TableError> {
            let entries: Vec<Result<RawEntry, TableError>> = vec![
                Ok((
                    Key::new(0, 1).encode().to_vec(),
                    vec![Value::new(1, 1).encode().to_vec()],
                )),
                Err(TableError::Enumerate("map went away".into())),
            ];
            Ok(Walk::new(entries.into_iter()))
        }
    }

    struct Unreadable;

    impl CounterTable for Unreadable {
        fn walk(&self) -> Result<Walk<'_>, TableError> {
            Err(TableError::Enumerate("permission denied".into()))
        }
    }

    #[test]
    fn test_enumeration_failure() {
        let harvester = Harvester::new(Broken, Registry::new(1024));

        let err = harvester.sync(None).unwrap_err();
        assert!(matches!(err, SyncError::Walk(TableError::Enumerate(_))));
        assert!(err.to_string().starts_with("error dumping contents of metrics map"));

        // nothing from the failed walk is published
        assert_eq!(harvester.backend().len(Family::ForwardCount), 0);

        let harvester = Harvester::new(Unreadable, Registry::new(1024));
        assert!(matches!(
            harvester.sync(None),
            Err(SyncError::Walk(TableError::Enumerate(_)))
        ));
    }

    #[test]
    fn test_decode_failure_fails_walk() {
        let table = MemoryTable::new(1);
        table.insert_raw(Key::new(0, 1).encode().to_vec(), vec![vec![0; 4]]);

        let harvester = Harvester::new(table, Registry::new(1024));
        assert!(matches!(
            harvester.sync(None),
            Err(SyncError::Walk(TableError::ValueSize { .. }))
        ));
    }

    #[test]
    fn test_malformed_entry_holds_back_cycle() {
        let harvester = harvester(1);
        let table = harvester.table();

        table.set(Key::new(0, 1), &[Value::new(10, 1000)]).unwrap();
        table.insert_raw(Key::new(0, 2).encode().to_vec(), vec![vec![0; 4]]);

        // the good entry is held back for as long as the bad one is present
        for _ in 0..3 {
            assert!(harvester.sync(None).is_err());
            assert_eq!(harvester.backend().len(Family::ForwardCount), 0);
        }

        table.clear();
        table.set(Key::new(0, 1), &[Value::new(10, 1000)]).unwrap();
        harvester.sync(None).unwrap();

        assert_eq!(
            harvester.backend().value(Family::ForwardCount, &forward("INGRESS")),
            Some(10)
        );
    }

    #[test]
    fn test_deadline() {
        let harvester = harvester(1);
        harvester
            .table()
            .set(Key::new(0, 1), &[Value::new(1, 1)])
            .unwrap();

        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            harvester.sync(Some(past)),
            Err(SyncError::Deadline { entries: 0 })
        ));
        assert_eq!(harvester.backend().len(Family::ForwardCount), 0);

        let future = Instant::now() + Duration::from_secs(60);
        assert!(harvester.sync(Some(future)).is_ok());
        assert_eq!(harvester.backend().len(Family::ForwardCount), 1);
    }

    #[test]
    fn test_empty_table() {
        let harvester = harvester(8);
        assert_eq!(harvester.sync(None).unwrap(), SyncReport::default());
    }
}
