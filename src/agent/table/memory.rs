use super::*;

use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-process metrics table.
///
/// Stores entries in their encoded form so that walks exercise the same
/// decoding path as a kernel-resident table. Writers update a single CPU
/// shard at a time, the way the datapath does.
pub struct MemoryTable {
    cpus: usize,
    entries: RwLock<HashMap<[u8; KEY_SIZE], Vec<Vec<u8>>>>,
}

impl MemoryTable {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Replaces all shards for a key. Missing trailing shards are zeroed and
    /// extra shards beyond the CPU count are ignored.
    pub fn set(&self, key: Key, values: &[Value]) -> Result<(), TableError> {
        let mut shards = vec![Value::default().encode().to_vec(); self.cpus];
        for (shard, value) in shards.iter_mut().zip(values) {
            *shard = value.encode().to_vec();
        }

        let mut entries = self.entries.write();
        let encoded = key.encode();

        if !entries.contains_key(&encoded) && entries.len() >= MAX_ENTRIES as usize {
            return Err(TableError::Full);
        }

        entries.insert(encoded, shards);
        Ok(())
    }

    /// Adds a single event of `bytes` length to the shard for `cpu`.
    pub fn record(&self, cpu: usize, key: Key, bytes: u64) -> Result<(), TableError> {
        if cpu >= self.cpus {
            return Err(TableError::Geometry(format!(
                "cpu {cpu} out of range for {} cpus",
                self.cpus
            )));
        }

        let mut entries = self.entries.write();
        let encoded = key.encode();

        if !entries.contains_key(&encoded) && entries.len() >= MAX_ENTRIES as usize {
            return Err(TableError::Full);
        }

        let shards = entries
            .entry(encoded)
            .or_insert_with(|| vec![Value::default().encode().to_vec(); self.cpus]);

        let current = Value::decode(&shards[cpu]).unwrap_or_default();
        let next = Value {
            count: current.count.wrapping_add(1),
            bytes: current.bytes.wrapping_add(bytes),
        };
        shards[cpu] = next.encode().to_vec();

        Ok(())
    }

    /// Stores raw bytes for an entry without any validation.
    #[cfg(test)]
    pub fn insert_raw(&self, key: Vec<u8>, shards: Vec<Vec<u8>>) {
        let mut buf = [0; KEY_SIZE];
        let len = key.len().min(KEY_SIZE);
        buf[..len].copy_from_slice(&key[..len]);
        self.entries.write().insert(buf, shards);
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl CounterTable for MemoryTable {
    fn walk(&self) -> Result<Walk<'_>, TableError> {
        // take a snapshot so that writers are never blocked for the length of
        // a walk
        let snapshot: Vec<Result<RawEntry, TableError>> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| Ok((k.to_vec(), v.clone())))
            .collect();

        Ok(Walk::new(snapshot.into_iter()))
    }
}
