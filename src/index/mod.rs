//! # Binlog GTID Index
//!
//! An on-disk index over one binlog file, mapping GTID positions and byte
//! offsets to seek positions. Replicas connect with a GTID position; without
//! the index, finding the right start point means scanning the binlog from
//! the beginning. With it, the lookup is a B+-tree descent plus a short
//! forward scan.
//!
//! The index lives next to its binlog as `<binlog_name>.idx` and is built
//! incrementally while the binlog is written ([`writer`]), searched either
//! from disk alone or combined with the writer's in-memory tail ([`reader`]),
//! and wired together by the [`registry`] that lets readers find live
//! writers. The binary layout is defined in [`format`].
//!
//! The index is strictly an optimization: every error path degrades to a
//! sequential binlog scan, and deleting an `.idx` file is always safe.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

pub mod format;
pub mod reader;
pub mod registry;
pub mod writer;

pub use reader::{GtidIndexReader, SearchResult};
pub use registry::HotIndexRegistry;
pub use writer::{GtidBatch, GtidIndexWriter};

/// The index file name for a binlog file: the binlog name with `.idx`
/// appended (not substituted, so `binlog.000007` maps to
/// `binlog.000007.idx`).
pub fn make_gtid_index_file_name(binlog_filename: &Path) -> PathBuf {
    let mut name = OsString::from(binlog_filename.as_os_str());
    name.push(".idx");
    PathBuf::from(name)
}

/// Delete the index file belonging to a binlog file, for use when the
/// binlog itself is purged. A missing index file is not an error (binlogs
/// from before the index feature have none).
pub fn remove_index_file(binlog_filename: &Path) -> Result<()> {
    let index_file_name = make_gtid_index_file_name(binlog_filename);
    match std::fs::remove_file(&index_file_name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .wrap_err_with(|| format!("failed to remove GTID index file {:?}", index_file_name)),
    }
}
