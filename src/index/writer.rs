//! # Index Writer
//!
//! Incremental builder for the on-disk GTID index. Records arrive one at a
//! time in strictly increasing binlog-offset order, and the writer grows a
//! B+-tree bottom-up by pure appending: it never inserts into the middle of
//! a node and never rebalances.
//!
//! ## Incremental Tree Building
//!
//! The writer owns exactly one partially-filled node per tree level (level 0
//! is the leaves). A new record goes into the level-0 node; when a node has
//! no room left, it is sealed (its pages get their final flags and CRC and
//! are appended to the index file) and a child pointer to it is added to
//! the node one level up, which may itself seal, and so on. The tree grows a
//! new top level the first time the old top seals. On `close()` every level
//! is flushed from the bottom up, so the root node is always the physically
//! last node of the file.
//!
//! ```text
//!   level 2:            [open]                       <- becomes the root
//!   level 1:   [sealed] [sealed] [open]
//!   level 0: [s] [s] [s] [s] [s] [s] [s] [open]
//!            ------- on disk --------- in memory
//! ```
//!
//! ## Delta Compression
//!
//! A record carries only the GTIDs accumulated since the previous indexed
//! record (the commit path drains the pending state per batch), so keys are
//! naturally delta-compressed. Each node tracks the running state of
//! everything inserted into it since the node began; when the node seals,
//! that accumulated state becomes both the separator key handed to the
//! parent and the first key of the replacement node. A reader descending
//! the tree replays every key it accepts into its own running state, and
//! the double bookkeeping means the first key of a node it descends into is
//! exactly the separator it just accepted, so reconstruction stays exact
//! across node boundaries.
//!
//! ## Two-Stage Updates
//!
//! `process_gtid_check_batch` runs on the committing transaction's thread:
//! it only merges into the pending state and applies the `span_min`
//! sparseness rule, with no file I/O the commit has to wait for.
//! `async_update` runs on one dedicated background thread per binlog file
//! and does the actual tree insertion. The two stages share nothing but the
//! small `pending` mutex.
//!
//! ## Hot Reads
//!
//! The writer registers in the [`HotIndexRegistry`] so a concurrent reader
//! can snapshot the open nodes (under the `core` mutex) and search the index
//! before it is finished. Sealed pages are immutable once appended, and page
//! appends happen under the same mutex as the child-pointer bookkeeping, so
//! a snapshot plus the file behind it is always a consistent tree prefix.
//!
//! ## Failure Model
//!
//! The index is an optimization, never a correctness requirement: on the
//! first allocation or I/O error the writer latches `error_state`, logs one
//! warning, and turns every later update into a no-op. Whatever prefix of
//! the index reached the disk stays valid; readers that miss simply fall
//! back to a sequential binlog scan. No fsync is ever issued; a crash can
//! lose the index tail, and recovery rebuilds the index from the binlog.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::GtidIndexConfig;
use crate::gtid::{BinlogState, Gtid, GtidList};
use crate::index::format::{
    page_header_offset, store_page_checksum, FileHeader, CHECKSUM_SIZE, CHILD_PTR_SIZE,
    FILE_HEADER_SIZE, GTID_ENTRY_SIZE, KEY_PREFIX_SIZE, PAGE_FLAG_IS_CONT, PAGE_FLAG_IS_LEAF,
    PAGE_FLAG_LAST, PAGE_FLAG_ROOT, PAGE_HEADER_SIZE,
};
use crate::index::registry::HotIndexRegistry;
use crate::index::make_gtid_index_file_name;

use zerocopy::IntoBytes;

/// One batch captured by the commit path, to be applied by `async_update`.
#[derive(Debug, Clone)]
pub struct GtidBatch {
    pub offset: u32,
    pub gtid_list: GtidList,
}

/// The one open (partially filled) node of a tree level.
pub(crate) struct IndexNode {
    level: u32,
    /// Zero-filled page buffers; the zero tail doubles as the end-of-node
    /// sentinel for readers (gtid_count+1 == 0).
    pub(crate) pages: Vec<Vec<u8>>,
    /// Write offset within the last page.
    used: usize,
    /// Running full state of every record inserted into this node.
    state: BinlogState,
    num_records: u32,
    force_spill_page: bool,
}

impl IndexNode {
    fn new(level: u32) -> Self {
        Self {
            level,
            pages: Vec::new(),
            used: 0,
            state: BinlogState::new(),
            num_records: 0,
            force_spill_page: false,
        }
    }

    fn reset(&mut self) {
        self.pages.clear();
        self.used = 0;
        self.state.reset();
        self.num_records = 0;
        self.force_spill_page = false;
    }
}

pub(crate) struct WriterCore {
    file: File,
    page_size: usize,
    pub(crate) nodes: Vec<IndexNode>,
    /// Pages appended to the file so far; the next sealed node starts at
    /// 1-based page number `pages_written + 1`.
    pub(crate) pages_written: u32,
    file_header_written: bool,
    pub(crate) error_state: bool,
    pub(crate) closed: bool,
}

/// The part of a writer that hot readers reach through the registry.
pub(crate) struct WriterShared {
    pub(crate) core: Mutex<WriterCore>,
}

/// A consistent copy of a writer's in-memory state, taken under the core
/// mutex and searched lock-free afterwards.
pub(crate) struct HotSnapshot {
    pub(crate) page_size: usize,
    pub(crate) pages_written: u32,
    /// Cloned page buffers of the open node at each level, index = level.
    pub(crate) levels: Vec<Vec<Vec<u8>>>,
}

impl WriterShared {
    /// Copy out the open nodes for a hot search. `Ok(None)` means the writer
    /// has already been closed and the reader should use the cold path;
    /// `Err` means the writer hit an error and the index is unusable.
    pub(crate) fn snapshot(&self) -> Result<Option<HotSnapshot>> {
        let core = self.core.lock();
        if core.closed {
            return Ok(None);
        }
        eyre::ensure!(!core.error_state, "cannot access hot index after writer error");
        Ok(Some(HotSnapshot {
            page_size: core.page_size,
            pages_written: core.pages_written,
            levels: core.nodes.iter().map(|n| n.pages.clone()).collect(),
        }))
    }
}

struct PendingBatch {
    state: BinlogState,
    previous_offset: u32,
}

pub struct GtidIndexWriter {
    index_file_name: PathBuf,
    registry: Arc<HotIndexRegistry>,
    shared: Arc<WriterShared>,
    span_min: u64,
    pending: Mutex<PendingBatch>,
}

impl GtidIndexWriter {
    /// Create the index file for a binlog that was just opened for writing,
    /// write the initial key for the binlog-start state at `offset`, and
    /// register as the hot writer for this file.
    pub fn new(
        registry: Arc<HotIndexRegistry>,
        binlog_filename: &Path,
        offset: u32,
        initial_state: &BinlogState,
        config: GtidIndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let index_file_name = make_gtid_index_file_name(binlog_filename);
        eyre::ensure!(
            registry.find(&index_file_name).is_none(),
            "GTID index {:?} already has an active writer",
            index_file_name
        );

        // Stale index files are removed by binlog purge, so finding one
        // means an external copy or an unclean shutdown. Start over.
        if index_file_name.exists() {
            warn!(file = ?index_file_name, "old GTID index file found, deleting");
            let _ = std::fs::remove_file(&index_file_name);
        }
        let file = File::create(&index_file_name)
            .wrap_err_with(|| format!("failed to create GTID index file {:?}", index_file_name))?;

        let shared = Arc::new(WriterShared {
            core: Mutex::new(WriterCore {
                file,
                page_size: config.page_size as usize,
                nodes: Vec::new(),
                pages_written: 0,
                file_header_written: false,
                error_state: false,
                closed: false,
            }),
        });

        registry.register(&index_file_name, &shared)?;

        let writer = Self {
            index_file_name,
            registry,
            shared,
            span_min: config.span_min,
            pending: Mutex::new(PendingBatch {
                state: BinlogState::new(),
                previous_offset: 0,
            }),
        };

        // Initial record: the GTID state at the very start of the binlog
        // (empty for a fresh binlog, the carried-over state after rotation).
        {
            let mut core = writer.shared.core.lock();
            let list = initial_state.gtid_list();
            if let Err(err) = core.write_record(offset, &list) {
                core.fail(&err);
            }
        }

        Ok(writer)
    }

    pub fn index_file_name(&self) -> &Path {
        &self.index_file_name
    }

    /// Commit-path entry point: record a GTID and apply the insertion
    /// immediately. Equivalent to `process_gtid_check_batch` followed by
    /// `async_update` on the same thread.
    pub fn process_gtid(&self, offset: u32, gtid: &Gtid) -> Result<()> {
        if let Some(batch) = self.process_gtid_check_batch(offset, gtid)? {
            self.async_update(batch)?;
        }
        Ok(())
    }

    /// Synchronous commit-path stage: merge `gtid` into the pending state
    /// and decide whether this offset produces an index record. Never does
    /// file I/O. Returns `None` while the batching threshold (`span_min`
    /// binlog bytes since the last indexed record) is not reached, or when
    /// the offset is not strictly increasing; the index is sparse by
    /// design, and readers scan the binlog forward from the nearest record.
    pub fn process_gtid_check_batch(&self, offset: u32, gtid: &Gtid) -> Result<Option<GtidBatch>> {
        let mut pending = self.pending.lock();
        pending.state.update(gtid);

        if offset <= pending.previous_offset
            || u64::from(offset - pending.previous_offset) < self.span_min
        {
            return Ok(None);
        }

        let gtid_list = pending.state.gtid_list();
        pending.state.reset();
        pending.previous_offset = offset;
        Ok(Some(GtidBatch { offset, gtid_list }))
    }

    /// Background-thread stage: insert a captured batch into the tree. At
    /// most one thread may call `async_update`/`close` per writer, and
    /// batches must arrive in the offset order they were captured in.
    pub fn async_update(&self, batch: GtidBatch) -> Result<()> {
        let mut core = self.shared.core.lock();
        match core.write_record(batch.offset, &batch.gtid_list) {
            Ok(()) => Ok(()),
            Err(err) => {
                core.fail(&err);
                Err(err)
            }
        }
    }

    /// Flush every open level (root last, flagged `PAGE_FLAG_ROOT`) and
    /// deregister from the hot index. Idempotent; writes after close are
    /// no-ops. No fsync is issued: a crash loses at most the index tail,
    /// and the index is rebuilt from the binlog on recovery.
    pub fn close(&self) -> Result<()> {
        let result = {
            let mut core = self.shared.core.lock();
            if core.closed {
                Ok(())
            } else {
                let result = if core.error_state {
                    Ok(())
                } else {
                    core.flush_all()
                };
                if let Err(ref err) = result {
                    core.fail(err);
                }
                core.closed = true;
                result
            }
        };
        self.registry.deregister(&self.index_file_name);
        result
    }

    #[cfg(test)]
    pub(crate) fn error_state(&self) -> bool {
        self.shared.core.lock().error_state
    }
}

impl Drop for GtidIndexWriter {
    fn drop(&mut self) {
        // Deregistration must happen on every exit path; close() is
        // idempotent so an explicit close earlier is fine.
        let _ = self.close();
    }
}

impl WriterCore {
    /// Insert one index record, sealing and promoting nodes as needed.
    ///
    /// The common case exits in the first loop iteration: there is room in
    /// the level-0 node and the record is appended. Otherwise the full node
    /// is sealed to disk, a child pointer is added one level up, the fresh
    /// node is re-anchored with the full running state, and the loop climbs
    /// to insert the separator key into the parent, possibly growing a new
    /// top level.
    fn write_record(&mut self, offset: u32, gtid_list: &[Gtid]) -> Result<()> {
        if self.error_state || self.closed {
            return Ok(());
        }

        let mut list: GtidList = gtid_list.iter().copied().collect();
        let mut level = 0usize;
        loop {
            self.alloc_level_if_missing(level);
            self.nodes[level].state.merge_list(&list);

            if self.check_room(level, list.len()) {
                return self.do_write_record(level, offset, &list);
            }

            let node_ptr = self.write_current_node(level, false)?;
            self.alloc_level_if_missing(level + 1);
            self.add_child_ptr(level + 1, node_ptr)?;

            let full = self.nodes[level].state.gtid_list();
            self.nodes[level].reset();
            if level == 0 {
                // The fresh leaf starts with the sealed node's accumulated
                // state, the same list promoted as the separator above.
                self.do_write_record(level, offset, &full)?;
            } else {
                // Interior nodes keep k-1 keys for k child pointers: the
                // separator moves up instead. Allocate the page now so hot
                // readers never see a page-less node.
                self.reserve_space(level, CHILD_PTR_SIZE)?;
            }
            list = full;
            level += 1;
        }
    }

    /// Flush all open levels bottom-up; the top level becomes the root.
    fn flush_all(&mut self) -> Result<()> {
        let max_level = self.nodes.len().saturating_sub(1);
        for level in 0..=max_level {
            let node_ptr = self.write_current_node(level, level == max_level)?;
            self.nodes[level].reset();
            if level >= max_level {
                break;
            }
            self.add_child_ptr(level + 1, node_ptr)?;
        }
        Ok(())
    }

    fn alloc_level_if_missing(&mut self, level: usize) {
        if self.nodes.len() <= level {
            debug_assert_eq!(level, self.nodes.len(), "levels grow one at a time");
            self.nodes.push(IndexNode::new(level as u32));
        }
    }

    /// Is there room for a record with `gtid_count` GTIDs in the current
    /// node, or should the node seal first? A node with a single record and
    /// less than half a page left forces continuation pages instead of
    /// sealing, so every node fills at least half a page.
    fn check_room(&mut self, level: usize, gtid_count: usize) -> bool {
        let page_size = self.page_size;
        let node = &mut self.nodes[level];
        // There is always room in an empty (to-be-allocated) node.
        if node.pages.is_empty() || node.num_records == 0 {
            return true;
        }
        let avail = page_size - CHECKSUM_SIZE - node.used;
        if node.num_records == 1 && avail < page_size / 2 {
            node.force_spill_page = true;
            return true;
        }
        if node.force_spill_page {
            return true;
        }
        let mut needed = KEY_PREFIX_SIZE + GTID_ENTRY_SIZE * gtid_count;
        if node.level > 0 {
            // Non-leaf nodes must keep room for the trailing child pointer.
            needed += CHILD_PTR_SIZE;
        }
        needed <= avail
    }

    /// Make sure `bytes` contiguous bytes fit in the node's current page,
    /// allocating a continuation page if not.
    fn reserve_space(&mut self, level: usize, bytes: usize) -> Result<()> {
        debug_assert!(bytes <= self.page_size - CHECKSUM_SIZE - PAGE_HEADER_SIZE);
        let page_size = self.page_size;
        {
            let node = &self.nodes[level];
            if !node.pages.is_empty() && node.used + bytes <= page_size - CHECKSUM_SIZE {
                return Ok(());
            }
        }

        let first_file_page = !self.file_header_written;
        let node = &mut self.nodes[level];
        node.force_spill_page = false;

        let mut page = vec![0u8; page_size];
        if first_file_page {
            page[..FILE_HEADER_SIZE].copy_from_slice(FileHeader::new(page_size as u32).as_bytes());
            self.file_header_written = true;
        }
        let header_offset = page_header_offset(first_file_page);
        let mut flags = 0u8;
        if node.level == 0 {
            flags |= PAGE_FLAG_IS_LEAF;
        }
        if !node.pages.is_empty() {
            flags |= PAGE_FLAG_IS_CONT;
        }
        page[header_offset] = flags;
        node.used = header_offset + PAGE_HEADER_SIZE;
        node.pages.push(page);
        Ok(())
    }

    fn append(&mut self, level: usize, bytes: &[u8]) {
        let node = &mut self.nodes[level];
        let page = node
            .pages
            .last_mut()
            .expect("reserve_space allocates a page before append");
        page[node.used..node.used + bytes.len()].copy_from_slice(bytes);
        node.used += bytes.len();
    }

    /// Append one record to the node at `level`, spilling into continuation
    /// pages mid-record if its encoding does not fit the current page.
    fn do_write_record(&mut self, level: usize, offset: u32, gtid_list: &[Gtid]) -> Result<()> {
        self.reserve_space(level, KEY_PREFIX_SIZE)?;
        // Count is stored +1 so that 0 can mean "no more records".
        self.append(level, &(gtid_list.len() as u32 + 1).to_le_bytes());
        self.append(level, &offset.to_le_bytes());
        for gtid in gtid_list {
            self.reserve_space(level, GTID_ENTRY_SIZE)?;
            self.append(
                level,
                crate::index::format::GtidRecord::from_gtid(gtid).as_bytes(),
            );
        }
        self.nodes[level].num_records += 1;
        Ok(())
    }

    /// Add a child page pointer to the interior node at `level`. Page
    /// numbers are 1-based so that 0 can denote "no child".
    fn add_child_ptr(&mut self, level: usize, node_ptr: u32) -> Result<()> {
        debug_assert!(node_ptr > 0);
        self.reserve_space(level, CHILD_PTR_SIZE)?;
        self.append(level, &node_ptr.to_le_bytes());
        Ok(())
    }

    /// Seal the node at `level` and append its pages to the index file.
    /// Returns the 1-based page number of the node's first page.
    fn write_current_node(&mut self, level: usize, is_root: bool) -> Result<u32> {
        let node_ptr = self.pages_written + 1;
        {
            let node = &mut self.nodes[level];
            debug_assert!(!node.pages.is_empty(), "sealing a node without pages");
            let page_count = node.pages.len();
            for (i, page) in node.pages.iter_mut().enumerate() {
                let header_offset = page_header_offset(node_ptr == 1 && i == 0);
                if is_root {
                    page[header_offset] |= PAGE_FLAG_ROOT;
                }
                if i + 1 == page_count {
                    page[header_offset] |= PAGE_FLAG_LAST;
                }
                store_page_checksum(page);
            }
        }
        for page in &self.nodes[level].pages {
            self.file
                .write_all(page)
                .wrap_err("error writing GTID index page")?;
            self.pages_written += 1;
        }
        Ok(node_ptr)
    }

    /// Latch the sticky error state; all further updates become no-ops and
    /// the prefix already on disk stays usable.
    fn fail(&mut self, err: &eyre::Report) {
        if !self.error_state {
            warn!(
                error = %err,
                "error during binlog GTID index creation, will fall back to \
                 slower sequential binlog scan"
            );
            self.error_state = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::format::{verify_page_checksum, GTID_INDEX_MAGIC};
    use tempfile::tempdir;

    fn test_config(page_size: u32, span_min: u64) -> GtidIndexConfig {
        GtidIndexConfig {
            page_size,
            span_min,
        }
    }

    #[test]
    fn writes_file_header_and_root_flag_on_close() {
        let dir = tempdir().unwrap();
        let binlog = dir.path().join("binlog.000001");
        let registry = Arc::new(HotIndexRegistry::new());

        let writer = GtidIndexWriter::new(
            registry.clone(),
            &binlog,
            0x100,
            &BinlogState::new(),
            test_config(64, 1),
        )
        .unwrap();
        writer.process_gtid(0x200, &Gtid::new(0, 1, 1)).unwrap();
        writer.close().unwrap();

        let data = std::fs::read(writer.index_file_name()).unwrap();
        assert!(!data.is_empty());
        assert_eq!(data.len() % 64, 0);
        assert_eq!(&data[..4], &GTID_INDEX_MAGIC);

        // Every page checksums clean, and the last one is a root page.
        for page in data.chunks(64) {
            assert!(verify_page_checksum(page));
        }
        let last_page = &data[data.len() - 64..];
        let flags = if data.len() == 64 {
            last_page[FILE_HEADER_SIZE]
        } else {
            last_page[0]
        };
        assert_eq!(flags & (PAGE_FLAG_ROOT | PAGE_FLAG_LAST), PAGE_FLAG_ROOT | PAGE_FLAG_LAST);
    }

    #[test]
    fn batching_respects_span_min() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(HotIndexRegistry::new());
        let writer = GtidIndexWriter::new(
            registry,
            &dir.path().join("binlog.000001"),
            0,
            &BinlogState::new(),
            test_config(4096, 1000),
        )
        .unwrap();

        // Below the span threshold: absorbed into pending state.
        assert!(writer
            .process_gtid_check_batch(500, &Gtid::new(0, 1, 1))
            .unwrap()
            .is_none());
        assert!(writer
            .process_gtid_check_batch(999, &Gtid::new(0, 1, 2))
            .unwrap()
            .is_none());

        // Crossing it: the batch carries everything accumulated so far.
        let batch = writer
            .process_gtid_check_batch(2000, &Gtid::new(1, 1, 1))
            .unwrap()
            .expect("span threshold crossed");
        assert_eq!(batch.offset, 2000);
        assert_eq!(batch.gtid_list.len(), 2);

        // Not strictly increasing: ignored, not an error.
        assert!(writer
            .process_gtid_check_batch(2000, &Gtid::new(0, 1, 3))
            .unwrap()
            .is_none());
        assert!(writer
            .process_gtid_check_batch(1500, &Gtid::new(0, 1, 4))
            .unwrap()
            .is_none());
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(HotIndexRegistry::new());
        let writer = GtidIndexWriter::new(
            registry.clone(),
            &dir.path().join("binlog.000001"),
            0x11d,
            &BinlogState::new(),
            test_config(64, 1),
        )
        .unwrap();
        writer.process_gtid(0x20e, &Gtid::new(0, 1, 1)).unwrap();
        writer.close().unwrap();
        let len_after_close = std::fs::metadata(writer.index_file_name()).unwrap().len();

        // Further updates and closes are no-ops.
        writer.process_gtid(0x400, &Gtid::new(0, 1, 2)).unwrap();
        writer.close().unwrap();
        assert_eq!(
            std::fs::metadata(writer.index_file_name()).unwrap().len(),
            len_after_close
        );
        assert!(!writer.error_state());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn registry_guards_duplicate_writers() {
        let dir = tempdir().unwrap();
        let binlog = dir.path().join("binlog.000001");
        let registry = Arc::new(HotIndexRegistry::new());
        let _writer = GtidIndexWriter::new(
            registry.clone(),
            &binlog,
            0,
            &BinlogState::new(),
            test_config(4096, 1),
        )
        .unwrap();

        let second = GtidIndexWriter::new(
            registry.clone(),
            &binlog,
            0,
            &BinlogState::new(),
            test_config(4096, 1),
        );
        assert!(second.is_err());
    }

    #[test]
    fn dropped_writer_leaves_registry() {
        let dir = tempdir().unwrap();
        let binlog = dir.path().join("binlog.000001");
        let registry = Arc::new(HotIndexRegistry::new());
        {
            let _writer = GtidIndexWriter::new(
                registry.clone(),
                &binlog,
                0,
                &BinlogState::new(),
                test_config(4096, 1),
            )
            .unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn multi_page_node_marks_continuation_pages() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(HotIndexRegistry::new());
        let writer = GtidIndexWriter::new(
            registry,
            &dir.path().join("binlog.000001"),
            0,
            &BinlogState::new(),
            test_config(64, 1),
        )
        .unwrap();

        // A record with many domains cannot fit one 64-byte page and must
        // spill mid-record into continuation pages.
        for seq in 1..=4u64 {
            let batch = GtidBatch {
                offset: (seq as u32) * 0x1000,
                gtid_list: (0..6u32).map(|domain| Gtid::new(domain, 1, seq)).collect(),
            };
            writer.async_update(batch).unwrap();
        }
        writer.close().unwrap();
        assert!(!writer.error_state());

        let data = std::fs::read(writer.index_file_name()).unwrap();
        let mut cont_pages = 0;
        for (i, page) in data.chunks(64).enumerate() {
            assert!(verify_page_checksum(page));
            let flags = if i == 0 { page[FILE_HEADER_SIZE] } else { page[0] };
            if flags & PAGE_FLAG_IS_CONT != 0 {
                cont_pages += 1;
            }
        }
        assert!(cont_pages > 0, "expected spilled continuation pages");
    }
}
