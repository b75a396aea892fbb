//! # gtid-index - Binlog GTID Index
//!
//! An on-disk index over MariaDB-style binlog files, mapping replication
//! GTID positions and binlog byte offsets to seek positions. Without it, a
//! replica connecting at a GTID position forces a sequential scan of the
//! binlog from the start; with it, the lookup is a B+-tree descent.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gtid_index::{
//!     BinlogState, GtidIndexConfig, GtidIndexReader, GtidIndexWriter,
//!     HotIndexRegistry, SearchResult,
//! };
//!
//! let registry = Arc::new(HotIndexRegistry::new());
//!
//! // While writing the binlog:
//! let writer = GtidIndexWriter::new(
//!     registry.clone(),
//!     "binlog.000001".as_ref(),
//!     initial_offset,
//!     &BinlogState::new(),
//!     GtidIndexConfig::default(),
//! )?;
//! writer.process_gtid(event_offset, &gtid)?;
//! writer.close()?;
//!
//! // When a replica connects:
//! let mut reader = GtidIndexReader::new_hot(registry);
//! reader.open_index_file("binlog.000001".as_ref())?;
//! if let SearchResult::Found { offset, .. } = reader.search_gtid_pos(&pos)? {
//!     // Seek the binlog to `offset` and scan forward from there.
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │   GtidIndexWriter    │      │   GtidIndexReader    │
//! │  (one per binlog,    │      │  (cold: file only;   │
//! │   appends pages)     │      │   hot: + writer mem) │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │ registers                   │ looks up
//!            ▼                             ▼
//!          ┌─────────────────────────────────┐
//!          │        HotIndexRegistry         │
//!          └─────────────────────────────────┘
//!                           │
//!                           ▼
//!            binlog.000001.idx (append-only B+-tree,
//!            CRC-checked pages, root written last)
//! ```
//!
//! The tree is built by pure appending: leaf records arrive in binlog
//! offset order, nodes seal when full, and the root is written last on
//! close. Keys are delta-compressed GTID state snapshots; a search replays
//! the keys it accepts on the way down to reconstruct the full state at the
//! answer position.
//!
//! ## Fallback Semantics
//!
//! The index is an optimization over a scan, never a source of truth. Any
//! error on either side degrades to the sequential scan: the writer latches
//! a sticky error state and keeps the valid prefix on disk, the reader
//! reports the error and lets the caller scan. No fsync is issued; after a
//! crash the index is rebuilt from the binlog.
//!
//! ## Module Overview
//!
//! - [`gtid`]: GTID triples, binlog state snapshots, position comparison
//! - [`index`]: the index proper (format, writer, reader, hot registry)
//! - [`config`]: page size and index sparseness tunables

pub mod config;
pub mod gtid;
pub mod index;

pub use config::GtidIndexConfig;
pub use gtid::{BinlogState, Gtid, GtidList, SlaveConnectionState};
pub use index::{
    make_gtid_index_file_name, remove_index_file, GtidBatch, GtidIndexReader, GtidIndexWriter,
    HotIndexRegistry, SearchResult,
};
