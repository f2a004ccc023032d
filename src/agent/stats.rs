use metriken::*;

#[metric(
    name = "dpmetrics_sync_runs",
    description = "The number of sync cycles that have been run"
)]
pub static SYNC_RUNS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "dpmetrics_sync_failures",
    description = "The number of sync cycles that failed to walk the table"
)]
pub static SYNC_FAILURES: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "dpmetrics_sync_entries",
    description = "The number of table entries read by successful sync cycles"
)]
pub static SYNC_ENTRIES: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "dpmetrics_sync_skipped",
    description = "The number of counter updates skipped because the backend rejected the labels"
)]
pub static SYNC_SKIPPED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "dpmetrics_sync_duration",
    description = "The amount of time spent in sync cycles, in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static SYNC_DURATION: LazyCounter = LazyCounter::new(Counter::default);
