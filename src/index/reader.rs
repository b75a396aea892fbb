//! # Index Reader
//!
//! Lookup side of the GTID index: given a binlog byte offset or a replica's
//! GTID position, find the last indexed record at or before that point. The
//! caller seeks the binlog to the returned offset and scans forward from
//! there, so an earlier-than-optimal answer costs time but never
//! correctness.
//!
//! ## Search
//!
//! A search walks root-to-leaf. Interior nodes alternate child pointers and
//! separator keys; the reader scans keys left to right, maintaining two
//! states: `current_state`, the reconstructed full GTID state of the last
//! key known to be at-or-before the target, and `compare_state`, the trial
//! state for the key being examined. The first key that compares after the
//! target stops the scan and the search descends into the child to its
//! left. Every key, interior or leaf, is a delta to replay on top of the
//! keys accepted before it; the first key of a descended-into node repeats
//! the separator that led here, so it is skipped once any separator has
//! been accepted.
//!
//! End-of-node needs no explicit marker: node pages are zero-filled at
//! allocation, and a zero in the count field (which stores count+1) reads
//! as "no more records".
//!
//! ## Cold and Hot Modes
//!
//! A cold reader works purely from the file: the root node is found by
//! walking pages backward from the end of the file (the root is always
//! written last), and child pointers seek directly to 1-based page numbers.
//!
//! A hot-capable reader additionally consults the [`HotIndexRegistry`]. If
//! a writer is still building this index, the reader takes a snapshot of
//! the writer's open nodes (a memcpy under the writer's core mutex, no file
//! I/O) and starts the search at the snapshot's top level. A zero child
//! pointer inside a snapshot node means "the child is the writer's open
//! node one level down"; a nonzero pointer leads into the already-sealed,
//! immutable part of the file, and the search drops the snapshot and
//! continues cold. The snapshot plus the file prefix behind it is a
//! consistent tree because pages are sealed and appended under the same
//! mutex the snapshot is taken under.
//!
//! ## Corruption Handling
//!
//! Every page is checksum-verified when read. Any inconsistency (bad magic,
//! torn tail, missing root, short node, failed checksum) surfaces as an
//! error from the search; the caller falls back to a sequential scan of the
//! binlog from the beginning, which is always correct.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::info;
use zerocopy::FromBytes;

use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::gtid::{BinlogState, Gtid, GtidList, SlaveConnectionState};
use crate::index::format::{
    page_data_start, verify_page_checksum, FileHeader, GtidRecord, CHECKSUM_SIZE, CHILD_PTR_SIZE,
    FILE_HEADER_SIZE, GTID_ENTRY_SIZE, KEY_PREFIX_SIZE, PAGE_FLAG_IS_CONT, PAGE_FLAG_IS_LEAF,
    PAGE_FLAG_LAST, PAGE_FLAG_ROOT, PAGE_HEADER_SIZE,
};
use crate::index::registry::HotIndexRegistry;
use crate::index::writer::HotSnapshot;
use crate::index::make_gtid_index_file_name;

/// Outcome of an index search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The last indexed record at or before the target. `offset` is the
    /// binlog byte position to seek to; the full GTID state there has
    /// `gtid_count` entries, available from
    /// [`GtidIndexReader::search_gtid_list`].
    Found { offset: u32, gtid_count: u32 },
    /// The target lies before the first indexed record.
    NotFound,
}

enum SearchTarget<'a> {
    Offset(u32),
    GtidPos(&'a SlaveConnectionState),
}

impl SearchTarget<'_> {
    /// Is the record at `offset` with full state `state` at or before the
    /// target position?
    fn matches(&self, offset: u32, state: &BinlogState) -> bool {
        match self {
            SearchTarget::Offset(target) => offset <= *target,
            SearchTarget::GtidPos(pos) => state.is_before_pos(pos),
        }
    }
}

/// One page of the node currently being scanned.
struct PageView {
    buf: Vec<u8>,
    /// Offset of the first record byte; the first physical file page also
    /// carries the file header before its page header.
    data_start: usize,
}

impl PageView {
    fn flags(&self) -> u8 {
        self.buf[self.data_start - PAGE_HEADER_SIZE]
    }
}

#[derive(Default)]
struct NodeView {
    pages: Vec<PageView>,
}

impl NodeView {
    fn is_leaf(&self) -> bool {
        self.pages
            .first()
            .map(|p| p.flags() & PAGE_FLAG_IS_LEAF != 0)
            .unwrap_or(false)
    }
}

pub struct GtidIndexReader {
    /// Present for hot-capable readers, absent for cold-only ones.
    registry: Option<Arc<HotIndexRegistry>>,
    index_file_name: PathBuf,
    file: Option<File>,
    page_size: usize,
    version_major: u8,
    version_minor: u8,
    index_valid: bool,
    has_root_node: bool,

    /// Snapshot of a live writer's open nodes; `Some` only while a search
    /// is walking the in-memory part of a hot index.
    hot: Option<HotSnapshot>,
    hot_level: usize,

    node: NodeView,
    read_page: usize,
    read_pos: usize,
    current_state: BinlogState,
    compare_state: BinlogState,
    current_offset: u32,
    scratch: GtidList,
    gtid_buffer: Vec<Gtid>,
}

impl GtidIndexReader {
    /// A cold reader: searches only the on-disk index, suitable for
    /// already-rotated binlog files.
    pub fn new() -> Self {
        Self::with_registry(None)
    }

    /// A hot-capable reader: consults `registry` at search time so it can
    /// also resolve positions in the binlog file currently being written.
    pub fn new_hot(registry: Arc<HotIndexRegistry>) -> Self {
        Self::with_registry(Some(registry))
    }

    fn with_registry(registry: Option<Arc<HotIndexRegistry>>) -> Self {
        Self {
            registry,
            index_file_name: PathBuf::new(),
            file: None,
            page_size: 0,
            version_major: 0,
            version_minor: 0,
            index_valid: false,
            has_root_node: false,
            hot: None,
            hot_level: 0,
            node: NodeView::default(),
            read_page: 0,
            read_pos: 0,
            current_state: BinlogState::new(),
            compare_state: BinlogState::new(),
            current_offset: 0,
            scratch: GtidList::new(),
            gtid_buffer: Vec::new(),
        }
    }

    /// Open the index belonging to `binlog_filename` and validate its
    /// header. A missing index file is an error the caller handles by
    /// sequential scan (old binlogs from before the index existed have
    /// none).
    pub fn open_index_file(&mut self, binlog_filename: &Path) -> Result<()> {
        self.close_index_file();
        self.index_file_name = make_gtid_index_file_name(binlog_filename);
        let file = File::open(&self.index_file_name).wrap_err_with(|| {
            format!("failed to open GTID index file {:?}", self.index_file_name)
        })?;
        self.file = Some(file);
        self.read_file_header()
    }

    pub fn close_index_file(&mut self) {
        self.file = None;
        self.index_valid = false;
        self.has_root_node = false;
        self.hot = None;
        self.node = NodeView::default();
    }

    pub fn version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }

    /// Find the last indexed record whose binlog offset is `<= offset`.
    pub fn search_offset(&mut self, offset: u32) -> Result<SearchResult> {
        self.run_search(&SearchTarget::Offset(offset))
    }

    /// Find the last indexed record whose GTID state lies at or before the
    /// replica position `pos` in every domain.
    pub fn search_gtid_pos(&mut self, pos: &SlaveConnectionState) -> Result<SearchResult> {
        self.run_search(&SearchTarget::GtidPos(pos))
    }

    /// The full GTID state at the offset of the last successful search.
    pub fn search_gtid_list(&self) -> &[Gtid] {
        &self.gtid_buffer
    }

    fn run_search(&mut self, target: &SearchTarget) -> Result<SearchResult> {
        let result = self.do_index_search(target);
        // The snapshot is per-search; the next search takes a fresh one.
        self.hot = None;
        if let Err(err) = &result {
            info!(
                error = %err,
                "error reading binlog GTID index, will fall back to slower \
                 sequential binlog scan"
            );
        }
        result
    }

    fn do_index_search(&mut self, target: &SearchTarget) -> Result<SearchResult> {
        if let Some(registry) = self.registry.clone() {
            self.hot = match registry.find(&self.index_file_name) {
                Some(shared) => shared.snapshot()?,
                None => None,
            };
            if self.hot.is_none() && !self.has_root_node {
                // The index may have been hot when opened and completed
                // since; re-examine the file end for a root node.
                self.read_file_header()?;
            }
        }
        ensure!(self.index_valid, "GTID index file not open");
        if self.hot.is_none() {
            ensure!(self.has_root_node, "GTID index incomplete, no root node");
        }
        self.do_index_search_root(target)
    }

    fn do_index_search_root(&mut self, target: &SearchTarget) -> Result<SearchResult> {
        self.current_state.reset();
        self.compare_state.reset();
        // Becomes true once any separator key has been folded into
        // current_state; until then the leaf's first key supplies the
        // initial full state.
        let mut current_state_updated = false;

        self.read_root_node()?;
        while !self.node.is_leaf() {
            self.compare_state.load(&self.current_state);
            let mut child_ptr = self.get_child_ptr()?;
            loop {
                let Some((offset, gtid_count)) = self.get_offset_count()? else {
                    // No more keys: follow the right-most child pointer.
                    self.read_node(child_ptr)?;
                    break;
                };
                self.read_gtid_list(gtid_count)?;
                let next_child_ptr = self.get_child_ptr()?;
                self.compare_state.merge_list(&self.scratch);
                if !target.matches(offset, &self.compare_state) {
                    // This key is past the target; descend to its left.
                    self.read_node(child_ptr)?;
                    break;
                }
                self.current_state.merge_list(&self.scratch);
                current_state_updated = true;
                self.current_offset = offset;
                child_ptr = next_child_ptr;
            }
        }
        self.do_index_search_leaf(current_state_updated, target)
    }

    fn do_index_search_leaf(
        &mut self,
        current_state_updated: bool,
        target: &SearchTarget,
    ) -> Result<SearchResult> {
        let Some((offset, gtid_count)) = self.get_offset_count()? else {
            bail!("corrupt index, empty leaf node");
        };
        self.read_gtid_list(gtid_count)?;
        // The leaf's first key repeats the separator that led here, so it
        // is skipped unless no separator was taken (leftmost leaf).
        if !current_state_updated {
            self.current_state.merge_list(&self.scratch);
        }
        self.current_offset = offset;
        self.compare_state.load(&self.current_state);
        if !target.matches(offset, &self.compare_state) {
            // Target lies before the first record of the index.
            return Ok(SearchResult::NotFound);
        }

        loop {
            let Some((offset, gtid_count)) = self.get_offset_count()? else {
                // End of leaf: the last accepted key is the answer.
                break;
            };
            self.read_gtid_list(gtid_count)?;
            self.compare_state.merge_list(&self.scratch);
            if !target.matches(offset, &self.compare_state) {
                break;
            }
            self.current_state.merge_list(&self.scratch);
            self.current_offset = offset;
        }

        self.gtid_buffer = self.current_state.gtid_list().into_vec();
        Ok(SearchResult::Found {
            offset: self.current_offset,
            gtid_count: self.current_state.count(),
        })
    }

    /// Parse the file header, verify the first page's checksum, and decide
    /// whether the file ends in a complete root node. In hot mode with no
    /// pages flushed yet the header only exists in the writer's memory.
    fn read_file_header(&mut self) -> Result<()> {
        if let Some(registry) = self.registry.clone() {
            if let Some(shared) = registry.find(&self.index_file_name) {
                if let Some(snapshot) = shared.snapshot()? {
                    if snapshot.pages_written == 0 {
                        let first_page = snapshot
                            .levels
                            .first()
                            .and_then(|pages| pages.first())
                            .ok_or_else(|| eyre::eyre!("hot index has no pages"))?;
                        let header = *FileHeader::from_bytes(first_page)?;
                        self.apply_header(header)?;
                        self.has_root_node = false;
                        self.index_valid = true;
                        return Ok(());
                    }
                }
            }
        }

        let Some(file) = self.file.as_mut() else {
            bail!("GTID index file not open");
        };
        file.seek(SeekFrom::Start(0))
            .wrap_err("error seeking index file")?;
        let mut head = [0u8; FILE_HEADER_SIZE + PAGE_HEADER_SIZE];
        file.read_exact(&mut head)
            .wrap_err("error reading header page from index file")?;
        let header = *FileHeader::from_bytes(&head)?;
        self.apply_header(header)?;

        // Re-read the whole first page to verify its checksum, covering the
        // page size and version fields just parsed.
        let first_page = self.read_page_at(0)?;
        let first_flags = first_page[FILE_HEADER_SIZE];

        if first_flags & (PAGE_FLAG_ROOT | PAGE_FLAG_LAST) == PAGE_FLAG_ROOT | PAGE_FLAG_LAST {
            // Single-page index: the first page is the whole root node.
            self.has_root_node = true;
        } else {
            let file_len = self.file_len()?;
            let page_size = self.page_size as u64;
            // A file that is not whole pages was torn mid-write; it has no
            // usable root regardless of what the tail bytes say.
            if file_len % page_size == 0 && file_len >= page_size {
                // Only the flags byte is inspected here; the page checksum
                // is verified by read_root_node() when the root is loaded.
                let Some(file) = self.file.as_mut() else {
                    bail!("GTID index file not open");
                };
                file.seek(SeekFrom::Start(file_len - page_size))
                    .wrap_err("error seeking index file")?;
                let mut tail = [0u8; PAGE_HEADER_SIZE];
                file.read_exact(&mut tail)
                    .wrap_err("error reading root page from index file")?;
                let flags = tail[0];
                self.has_root_node =
                    flags & (PAGE_FLAG_ROOT | PAGE_FLAG_LAST) == PAGE_FLAG_ROOT | PAGE_FLAG_LAST;
            } else {
                self.has_root_node = false;
            }
        }
        self.index_valid = true;
        Ok(())
    }

    fn apply_header(&mut self, header: FileHeader) -> Result<()> {
        let page_size = header.page_size();
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "corrupt index file, implausible page size {}",
            page_size
        );
        self.page_size = page_size as usize;
        self.version_major = header.version_major();
        self.version_minor = header.version_minor();
        Ok(())
    }

    fn file_len(&self) -> Result<u64> {
        let Some(file) = self.file.as_ref() else {
            bail!("GTID index file not open");
        };
        Ok(file.metadata().wrap_err("error reading index file metadata")?.len())
    }

    /// Read and checksum-verify one page at byte position `pos`.
    fn read_page_at(&mut self, pos: u64) -> Result<Vec<u8>> {
        let page_size = self.page_size;
        let Some(file) = self.file.as_mut() else {
            bail!("GTID index file not open");
        };
        file.seek(SeekFrom::Start(pos))
            .wrap_err("error seeking index file")?;
        let mut page = vec![0u8; page_size];
        file.read_exact(&mut page)
            .wrap_err("error reading page from index file")?;
        ensure!(verify_page_checksum(&page), "corrupt page, invalid checksum");
        Ok(page)
    }

    /// Load the node to scan next. In a hot search a zero child pointer
    /// descends into the writer's open node one level down; a nonzero
    /// pointer leads into the sealed part of the file, so the snapshot is
    /// dropped and reading continues cold.
    fn read_node(&mut self, page_ptr: u32) -> Result<()> {
        if self.hot.is_some() {
            if page_ptr == 0 {
                ensure!(
                    self.hot_level > 0,
                    "corrupt hot index, child pointer on leaf page"
                );
                self.hot_level -= 1;
                return self.load_hot_node();
            }
            self.hot = None;
        }
        ensure!(page_ptr != 0, "corrupt index, zero child page pointer");
        self.read_node_cold(page_ptr)
    }

    fn read_node_cold(&mut self, page_ptr: u32) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut pos = u64::from(page_ptr - 1) * page_size;
        let mut first_file_page = page_ptr == 1;
        let mut pages = Vec::new();
        loop {
            let buf = self.read_page_at(pos)?;
            let page = PageView {
                buf,
                data_start: page_data_start(first_file_page),
            };
            first_file_page = false;
            let flags = page.flags();
            pages.push(page);
            if flags & PAGE_FLAG_LAST != 0 {
                break;
            }
            pos += page_size;
        }
        self.set_node(pages)
    }

    /// Locate the root node: top snapshot level when hot, otherwise a
    /// backward page walk from the end of the file (the root is always the
    /// physically last node).
    fn read_root_node(&mut self) -> Result<()> {
        ensure!(self.index_valid, "GTID index file not open");
        if let Some(snapshot) = &self.hot {
            ensure!(!snapshot.levels.is_empty(), "hot index has no pages");
            self.hot_level = snapshot.levels.len() - 1;
            return self.load_hot_node();
        }
        ensure!(self.has_root_node, "GTID index incomplete, no root node");

        let page_size = self.page_size as u64;
        let file_len = self.file_len()?;
        ensure!(
            file_len >= page_size && file_len % page_size == 0,
            "corrupt or truncated index, no root node found"
        );
        let mut pos = file_len - page_size;
        let mut pages = Vec::new();
        loop {
            let buf = self.read_page_at(pos)?;
            let page = PageView {
                buf,
                data_start: page_data_start(pos == 0),
            };
            let flags = page.flags();
            pages.push(page);
            ensure!(
                flags & PAGE_FLAG_ROOT != 0,
                "corrupt or truncated index, no root node found"
            );
            if flags & PAGE_FLAG_IS_CONT == 0 {
                break;
            }
            ensure!(pos >= page_size, "corrupt index, root node start missing");
            pos -= page_size;
        }
        pages.reverse();
        self.set_node(pages)
    }

    /// Copy the snapshot node at `hot_level` into the scan cursor. The
    /// writer allocates a page for every open node, so an empty level means
    /// the snapshot is unusable.
    fn load_hot_node(&mut self) -> Result<()> {
        let level = self.hot_level;
        let Some(snapshot) = self.hot.as_mut() else {
            bail!("hot index snapshot missing");
        };
        let Some(level_pages) = snapshot.levels.get_mut(level) else {
            bail!("page not available in hot index");
        };
        ensure!(!level_pages.is_empty(), "page not available in hot index");
        // The file header lives in the very first page allocated, which is
        // still in memory only while nothing has been flushed.
        let header_in_memory = snapshot.pages_written == 0 && level == 0;
        let pages = std::mem::take(level_pages)
            .into_iter()
            .enumerate()
            .map(|(i, buf)| PageView {
                buf,
                data_start: page_data_start(header_in_memory && i == 0),
            })
            .collect();
        self.set_node(pages)
    }

    fn set_node(&mut self, pages: Vec<PageView>) -> Result<()> {
        ensure!(!pages.is_empty(), "corrupt index, node without pages");
        self.read_pos = pages[0].data_start;
        self.read_page = 0;
        self.node = NodeView { pages };
        Ok(())
    }

    /// Make `num_bytes` contiguous bytes available at the read cursor,
    /// advancing to the node's next page if needed. False means end of
    /// node.
    fn find_bytes(&mut self, num_bytes: usize) -> bool {
        if self.read_pos + num_bytes <= self.page_size - CHECKSUM_SIZE {
            return true;
        }
        if self.read_page + 1 >= self.node.pages.len() {
            return false;
        }
        self.read_page += 1;
        self.read_pos = self.node.pages[self.read_page].data_start;
        true
    }

    fn take_bytes(&mut self, num_bytes: usize) -> &[u8] {
        let start = self.read_pos;
        self.read_pos += num_bytes;
        &self.node.pages[self.read_page].buf[start..start + num_bytes]
    }

    fn get_child_ptr(&mut self) -> Result<u32> {
        if !self.find_bytes(CHILD_PTR_SIZE) {
            // In a hot node a missing child pointer is simply not written
            // yet; zero tells read_node() to descend into the open node.
            if self.hot.is_some() {
                return Ok(0);
            }
            bail!("corrupt index, short index node");
        }
        let bytes = self.take_bytes(CHILD_PTR_SIZE);
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte child pointer")))
    }

    /// Read the fixed prefix of the next record. `None` means no more
    /// records in this node, either by running off the pages or by hitting
    /// the zero-filled tail (count is stored +1, so 0 is the sentinel).
    fn get_offset_count(&mut self) -> Result<Option<(u32, u32)>> {
        if !self.find_bytes(KEY_PREFIX_SIZE) {
            return Ok(None);
        }
        let bytes = self.take_bytes(KEY_PREFIX_SIZE);
        let count_plus_one = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte count"));
        if count_plus_one == 0 {
            return Ok(None);
        }
        let offset = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte offset"));
        Ok(Some((offset, count_plus_one - 1)))
    }

    /// Read `count` GTID entries of the current record into the scratch
    /// list.
    fn read_gtid_list(&mut self, count: u32) -> Result<()> {
        self.scratch.clear();
        for _ in 0..count {
            ensure!(
                self.find_bytes(GTID_ENTRY_SIZE),
                "corrupt index, short index node"
            );
            let bytes = self.take_bytes(GTID_ENTRY_SIZE);
            let record = GtidRecord::read_from_bytes(bytes)
                .map_err(|e| eyre::eyre!("failed to parse GTID entry: {:?}", e))?;
            self.scratch.push(record.to_gtid());
        }
        Ok(())
    }
}

impl Default for GtidIndexReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GtidIndexConfig;
    use crate::index::writer::GtidIndexWriter;
    use tempfile::tempdir;

    #[test]
    fn offset_target_is_inclusive() {
        let target = SearchTarget::Offset(100);
        let state = BinlogState::new();
        assert!(target.matches(100, &state));
        assert!(target.matches(99, &state));
        assert!(!target.matches(101, &state));
    }

    #[test]
    fn gtid_target_uses_domain_dominance() {
        let pos = SlaveConnectionState::from_gtid_list(&[Gtid::new(0, 1, 5)]);
        let target = SearchTarget::GtidPos(&pos);

        let mut before = BinlogState::new();
        before.update(&Gtid::new(0, 1, 3));
        assert!(target.matches(0, &before));

        let mut after = BinlogState::new();
        after.update(&Gtid::new(0, 1, 7));
        assert!(!target.matches(0, &after));
    }

    #[test]
    fn single_node_roundtrip() {
        let dir = tempdir().unwrap();
        let binlog = dir.path().join("binlog.000001");
        let registry = Arc::new(HotIndexRegistry::new());
        let writer = GtidIndexWriter::new(
            registry,
            &binlog,
            0x100,
            &BinlogState::new(),
            GtidIndexConfig {
                page_size: 4096,
                span_min: 1,
            },
        )
        .unwrap();
        writer.process_gtid(0x200, &Gtid::new(0, 1, 1)).unwrap();
        writer.process_gtid(0x300, &Gtid::new(0, 1, 2)).unwrap();
        writer.close().unwrap();

        let mut reader = GtidIndexReader::new();
        reader.open_index_file(&binlog).unwrap();

        assert_eq!(
            reader.search_offset(0x250).unwrap(),
            SearchResult::Found {
                offset: 0x200,
                gtid_count: 1
            }
        );
        assert_eq!(reader.search_gtid_list(), &[Gtid::new(0, 1, 1)]);

        assert_eq!(reader.search_offset(0x50).unwrap(), SearchResult::NotFound);
        assert_eq!(
            reader.search_offset(u32::MAX).unwrap(),
            SearchResult::Found {
                offset: 0x300,
                gtid_count: 1
            }
        );
        assert_eq!(reader.search_gtid_list(), &[Gtid::new(0, 1, 2)]);
    }

    #[test]
    fn missing_index_file_is_an_error() {
        let dir = tempdir().unwrap();
        let mut reader = GtidIndexReader::new();
        assert!(reader
            .open_index_file(&dir.path().join("binlog.000042"))
            .is_err());
    }
}
