use super::*;

use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType};
use ringlog::*;
use std::path::{Path, PathBuf};

/// A metrics table pinned in bpffs by the datapath loader.
///
/// The map is opened once and never re-created. Its type and geometry are
/// checked on open so that every later walk can trust the layout.
pub struct PinnedTable {
    path: PathBuf,
    map: MapHandle,
}

impl PinnedTable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();

        let map = MapHandle::from_pinned_path(&path).map_err(|e| TableError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        if map.map_type() != MapType::PercpuHash {
            return Err(TableError::Geometry(format!(
                "{} is a {:?} map, expected a per-CPU hash",
                path.display(),
                map.map_type()
            )));
        }

        TableSpec::METRICS.validate(
            map.key_size() as usize,
            map.value_size() as usize,
            map.max_entries(),
        )?;

        debug!(
            "opened metrics table {} ({} max entries)",
            path.display(),
            map.max_entries()
        );

        Ok(Self { path, map })
    }
}

impl CounterTable for PinnedTable {
    fn walk(&self) -> Result<Walk<'_>, TableError> {
        let entries = self.map.keys().filter_map(move |key| {
            match self.map.lookup_percpu(&key, MapFlags::ANY) {
                Ok(Some(shards)) => Some(Ok((key, shards))),
                // the key was deleted between listing and lookup
                Ok(None) => None,
                Err(e) => Some(Err(TableError::Enumerate(format!(
                    "lookup of {key:?} in {} failed: {e}",
                    self.path.display()
                )))),
            }
        });

        Ok(Walk::new(entries))
    }
}
