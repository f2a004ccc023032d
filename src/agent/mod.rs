//! The harvesting agent: reads the datapath metrics table and publishes its
//! contents as monotonic counters.

pub mod classify;
pub mod publish;
pub mod stats;
pub mod table;

mod sync;

pub use sync::{Harvester, SyncError, SyncReport};
