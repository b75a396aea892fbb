//! # Hot Index Registry
//!
//! While a binlog file is open for writing, its index exists partly on disk
//! (sealed pages) and partly in the writer's memory (the one open node per
//! tree level). A reader resolving a position on the *currently active*
//! binlog must be able to see that in-memory tail, otherwise it could only
//! answer queries about already-rotated files.
//!
//! The registry is the rendezvous point: every live [`GtidIndexWriter`]
//! registers itself here under its index filename, and a hot-capable
//! [`GtidIndexReader`] looks the filename up at search time. Writers hold a
//! strong reference to their shared core; the registry holds only a weak one,
//! so a writer that is dropped without a clean close can never be resurrected
//! through the map.
//!
//! ## Locking
//!
//! The registry mutex guards the filename map and nothing else; it is never
//! held across file I/O or while a writer's node buffers are inspected.
//! Synchronization of the buffers themselves is the writer core mutex (see
//! `writer.rs`).
//!
//! ## One Writer Per File
//!
//! The index format relies on the root node being the physically last node of
//! the file, which only holds if exactly one writer appends to a given index
//! file at a time. [`HotIndexRegistry::register`] turns that assumption into
//! a checked error instead of silent corruption.
//!
//! [`GtidIndexWriter`]: super::writer::GtidIndexWriter
//! [`GtidIndexReader`]: super::reader::GtidIndexReader

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::writer::WriterShared;

/// Process-wide map from index filename to the live writer building it.
#[derive(Default)]
pub struct HotIndexRegistry {
    writers: Mutex<HashMap<PathBuf, Weak<WriterShared>>>,
}

impl HotIndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        index_file_name: &Path,
        shared: &Arc<WriterShared>,
    ) -> Result<()> {
        let mut writers = self.writers.lock();
        if let Some(existing) = writers.get(index_file_name) {
            ensure!(
                existing.upgrade().is_none(),
                "GTID index {:?} already has an active writer",
                index_file_name
            );
        }
        writers.insert(index_file_name.to_path_buf(), Arc::downgrade(shared));
        Ok(())
    }

    pub(crate) fn deregister(&self, index_file_name: &Path) {
        self.writers.lock().remove(index_file_name);
    }

    /// Look up the live writer for an index file, if any. Dead entries
    /// (writer dropped without deregistering) are pruned on the way.
    pub(crate) fn find(&self, index_file_name: &Path) -> Option<Arc<WriterShared>> {
        let mut writers = self.writers.lock();
        match writers.get(index_file_name) {
            Some(weak) => match weak.upgrade() {
                Some(shared) => Some(shared),
                None => {
                    writers.remove(index_file_name);
                    None
                }
            },
            None => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.writers.lock().len()
    }
}
