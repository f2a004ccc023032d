//! Synthetic datapath for running without a pinned metrics map.
//!
//! A background thread plays the role of the datapath and records a fixed
//! mix of forwards and drops into a [`MemoryTable`], one CPU shard at a time.

use crate::agent::table::{Key, MemoryTable, TableError};

use ringlog::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `(reason, dir, packet size)` for each simulated flow.
const FLOWS: &[(u8, u8, u64)] = &[
    (0, 1, 1500),
    (0, 2, 576),
    (0, 0, 64),
    (2, 1, 40),
    (133, 1, 60),
    (133, 2, 60),
    (151, 2, 1500),
    (169, 2, 128),
    (200, 1, 90),
];

/// Records one round of traffic: every flow once on each CPU, with drops
/// only seen on every other CPU.
pub fn round(table: &MemoryTable, round: u64) -> Result<(), TableError> {
    for cpu in 0..table.cpus() {
        for (i, (reason, dir, size)) in FLOWS.iter().enumerate() {
            let key = Key::new(*reason, *dir);

            if key.is_drop() && (cpu as u64 + round + i as u64) % 2 == 1 {
                continue;
            }

            table.record(cpu, key, *size)?;
        }
    }

    Ok(())
}

/// Spawns the synthetic datapath. It runs until `running` is cleared.
pub fn spawn(
    table: Arc<MemoryTable>,
    period: Duration,
    running: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("simulate".to_string())
        .spawn(move || {
            let mut n = 0;

            while running.load(Ordering::Relaxed) {
                if let Err(e) = round(&table, n) {
                    error!("simulated datapath stopped: {e}");
                    return;
                }

                n += 1;
                std::thread::sleep(period);
            }
        })
}
