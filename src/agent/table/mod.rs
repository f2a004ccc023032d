//! The datapath metrics table.
//!
//! The table is a per-CPU hash map owned by the datapath. Each key is a
//! `(reason, dir)` pair and each value is a `(count, bytes)` pair replicated
//! once per possible CPU. This module describes the binary layout of both and
//! exposes a read-only walk over the table contents.
//!
//! Layout (native byte order, matching `struct metrics_key` and
//! `struct metrics_value` in the datapath):
//!
//! ```text
//! key:   | reason: u8 | dir: u8 | reserved: [u16; 3] |   8 bytes
//! value: | count: u64 | bytes: u64 |                     16 bytes per CPU
//! ```

mod memory;
#[cfg(target_os = "linux")]
mod pinned;

pub use memory::MemoryTable;
#[cfg(target_os = "linux")]
pub use pinned::PinnedTable;

use core::fmt;

/// Size of an encoded key in bytes.
pub const KEY_SIZE: usize = 8;

/// Size of a single per-CPU value shard in bytes.
pub const VALUE_SIZE: usize = 16;

/// Maximum number of entries the table can hold.
///
/// Only 2 bits of `dir` are ever used by the datapath (unknown, ingress or
/// egress), so the key space is 2^8 reasons times 2^2 directions.
pub const MAX_ENTRIES: u32 = 1024;

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("failed to open table at {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("table geometry mismatch: {0}")]
    Geometry(String),
    #[error("key is {0} bytes, expected {KEY_SIZE}")]
    KeySize(usize),
    #[error("value shard {cpu} is {len} bytes, expected {VALUE_SIZE}")]
    ValueSize { cpu: usize, len: usize },
    #[error("table is full ({MAX_ENTRIES} entries)")]
    Full,
    #[error("failed to enumerate table: {0}")]
    Enumerate(String),
}

/// The declared shape of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub key_size: usize,
    pub value_size: usize,
    pub max_entries: u32,
}

impl TableSpec {
    pub const METRICS: TableSpec = TableSpec {
        key_size: KEY_SIZE,
        value_size: VALUE_SIZE,
        max_entries: MAX_ENTRIES,
    };

    /// Checks that a table declared with the given geometry matches this
    /// shape. A mismatch means the datapath and the harvester disagree on the
    /// layout and nothing read from the table can be trusted.
    pub fn validate(
        &self,
        key_size: usize,
        value_size: usize,
        max_entries: u32,
    ) -> Result<(), TableError> {
        if key_size != self.key_size {
            return Err(TableError::Geometry(format!(
                "key size {key_size} != {}",
                self.key_size
            )));
        }

        if value_size != self.value_size {
            return Err(TableError::Geometry(format!(
                "value size {value_size} != {}",
                self.value_size
            )));
        }

        if max_entries < self.max_entries {
            return Err(TableError::Geometry(format!(
                "max entries {max_entries} cannot hold {} keys",
                self.max_entries
            )));
        }

        Ok(())
    }
}

/// A logical key identifying one counter bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub reason: u8,
    pub dir: u8,
}

impl Key {
    pub fn new(reason: u8, dir: u8) -> Self {
        Self { reason, dir }
    }

    pub fn encode(&self) -> [u8; KEY_SIZE] {
        let mut buf = [0; KEY_SIZE];
        buf[0] = self.reason;
        buf[1] = self.dir;
        buf
    }

    /// Decodes a key. The reserved padding is not interpreted.
    pub fn decode(data: &[u8]) -> Result<Self, TableError> {
        if data.len() != KEY_SIZE {
            return Err(TableError::KeySize(data.len()));
        }

        Ok(Self {
            reason: data[0],
            dir: data[1],
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reason:{} dir:{}", self.reason, self.dir)
    }
}

/// One per-CPU shard of a value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Value {
    pub count: u64,
    pub bytes: u64,
}

impl Value {
    pub fn new(count: u64, bytes: u64) -> Self {
        Self { count, bytes }
    }

    pub fn encode(&self) -> [u8; VALUE_SIZE] {
        let mut buf = [0; VALUE_SIZE];
        buf[0..8].copy_from_slice(&self.count.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.bytes.to_ne_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != VALUE_SIZE {
            return None;
        }

        let count = u64::from_ne_bytes(data[0..8].try_into().ok()?);
        let bytes = u64::from_ne_bytes(data[8..16].try_into().ok()?);

        Some(Self { count, bytes })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count:{} bytes:{}", self.count, self.bytes)
    }
}

/// The full value for a key: one shard per possible CPU, in CPU order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values(pub Vec<Value>);

impl Values {
    pub fn decode<T: AsRef<[u8]>>(shards: &[T]) -> Result<Self, TableError> {
        let mut values = Vec::with_capacity(shards.len());

        for (cpu, shard) in shards.iter().enumerate() {
            let shard = shard.as_ref();
            let value = Value::decode(shard).ok_or(TableError::ValueSize {
                cpu,
                len: shard.len(),
            })?;
            values.push(value);
        }

        Ok(Self(values))
    }

    /// Collapses the per-CPU shards into a single logical value.
    ///
    /// Whatever shards are present are summed. A sparse CPU topology may
    /// leave fewer shards than CPUs and that is not an error.
    pub fn sum(&self) -> Value {
        self.0.iter().fold(Value::default(), |acc, v| Value {
            count: acc.count.saturating_add(v.count),
            bytes: acc.bytes.saturating_add(v.bytes),
        })
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.sum().fmt(f)
    }
}

/// A raw entry as read from the table, before decoding.
pub type RawEntry = (Vec<u8>, Vec<Vec<u8>>);

/// A single pass over the table.
///
/// The walk is finite and cannot be restarted. Entries are decoded as they
/// are pulled and a malformed entry is yielded as an error.
pub struct Walk<'a> {
    inner: Box<dyn Iterator<Item = Result<RawEntry, TableError>> + 'a>,
}

impl<'a> Walk<'a> {
    pub fn new<I>(inner: I) -> Self
    where
        I: Iterator<Item = Result<RawEntry, TableError>> + 'a,
    {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<(Key, Values), TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };

        let (key, shards) = entry;

        Some(Key::decode(&key).and_then(|key| Ok((key, Values::decode(&shards)?))))
    }
}

/// Read-only access to a metrics table.
pub trait CounterTable {
    /// Starts a walk over every entry currently in the table. Ordering is
    /// arbitrary.
    fn walk(&self) -> Result<Walk<'_>, TableError>;
}

impl<T: CounterTable + ?Sized> CounterTable for std::sync::Arc<T> {
    fn walk(&self) -> Result<Walk<'_>, TableError> {
        (**self).walk()
    }
}

impl<T: CounterTable + ?Sized> CounterTable for Box<T> {
    fn walk(&self) -> Result<Walk<'_>, TableError> {
        (**self).walk()
    }
}

/// Returns the number of possible CPUs, which is the number of shards in
/// every value.
#[cfg(target_os = "linux")]
pub fn possible_cpus() -> Result<usize, TableError> {
    libbpf_rs::num_possible_cpus().map_err(|e| TableError::Open {
        path: "/sys/devices/system/cpu/possible".to_string(),
        reason: e.to_string(),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn possible_cpus() -> Result<usize, TableError> {
    Ok(std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1))
}
