//! # On-Disk Index Format
//!
//! Binary layout definitions for the GTID index file: the file header, the
//! per-page header and checksum trailer, and the wire encoding of index
//! records. Everything on disk is little-endian.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------+
//! | File header (12 bytes)   |  <- first page only
//! +--------------------------+
//! | Page header (4 bytes)    |
//! | Page body                |
//! | CRC32 trailer (4 bytes)  |
//! +--------------------------+
//! | Page header (4 bytes)    |  <- every subsequent page_size bytes
//! | ...                      |
//! +--------------------------+
//! ```
//!
//! ## File Header (12 bytes, first page only)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     Magic: 254, 254, 12, 1
//! 4       1     Major version (readers refuse anything newer)
//! 5       1     Minor version (forward-compatible extensions only)
//! 6       2     Padding, zero on write, ignored on read
//! 8       4     Page size for the whole file
//! ```
//!
//! ## Page Header (4 bytes) and Trailer
//!
//! One flag byte followed by 3 reserved bytes. The last 4 bytes of every
//! page hold a CRC32 (zlib polynomial) over all preceding bytes of that
//! page. Flags:
//!
//! - `IS_LEAF` (1): page belongs to a leaf node
//! - `IS_CONT` (2): page continues the node started on an earlier page
//! - `LAST` (4): last physical page of its node
//! - `ROOT` (8): page belongs to the root node
//!
//! A node may span several physical pages; the final one carries `LAST`.
//! The root node is always the physically last node of the file, so a file
//! whose final page lacks `ROOT` was torn mid-write and is unusable.
//!
//! ## Record Encoding
//!
//! An index record (key) inside a node body:
//!
//! ```text
//! u32  gtid_count + 1      0 means "no more records in this node"
//! u32  file_offset         byte position in the binlog file
//! then gtid_count entries of:
//!   u32 domain_id, u32 server_id, u64 seq_no   (16 bytes each)
//! ```
//!
//! Records may spill across a page boundary mid-entry; the reader follows
//! `IS_CONT` pages transparently. Interior node bodies alternate 4-byte
//! child page pointers with records, starting and ending with a pointer.
//! Page pointers are 1-based; 0 means absent (or, in a live in-memory node,
//! not yet written).

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::gtid::Gtid;

pub const GTID_INDEX_MAGIC: [u8; 4] = [254, 254, 12, 1];
pub const GTID_INDEX_VERSION_MAJOR: u8 = 1;
pub const GTID_INDEX_VERSION_MINOR: u8 = 0;

pub const FILE_HEADER_SIZE: usize = 12;
pub const PAGE_HEADER_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;

pub const PAGE_FLAG_IS_LEAF: u8 = 1;
pub const PAGE_FLAG_IS_CONT: u8 = 2;
pub const PAGE_FLAG_LAST: u8 = 4;
pub const PAGE_FLAG_ROOT: u8 = 8;

/// Size of the fixed record prefix: gtid_count+1 and file_offset.
pub const KEY_PREFIX_SIZE: usize = 8;
pub const GTID_ENTRY_SIZE: usize = 16;
pub const CHILD_PTR_SIZE: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 4],
    version_major: u8,
    version_minor: u8,
    padding: [u8; 2],
    page_size: U32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: GTID_INDEX_MAGIC,
            version_major: GTID_INDEX_VERSION_MAJOR,
            version_minor: GTID_INDEX_VERSION_MINOR,
            padding: [0; 2],
            page_size: U32::new(page_size),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for index file header: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse index file header: {:?}", e))?;

        ensure!(
            header.magic == GTID_INDEX_MAGIC,
            "not a GTID index file, magic not found in header"
        );
        ensure!(
            header.version_major <= GTID_INDEX_VERSION_MAJOR,
            "incompatible GTID index file, major version {} too high",
            header.version_major
        );

        Ok(header)
    }

    pub fn version_major(&self) -> u8 {
        self.version_major
    }

    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }
}

/// Wire form of one GTID entry inside a record.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct GtidRecord {
    domain_id: U32,
    server_id: U32,
    seq_no: U64,
}

const _: () = assert!(std::mem::size_of::<GtidRecord>() == GTID_ENTRY_SIZE);

impl GtidRecord {
    pub fn from_gtid(gtid: &Gtid) -> Self {
        Self {
            domain_id: U32::new(gtid.domain_id),
            server_id: U32::new(gtid.server_id),
            seq_no: U64::new(gtid.seq_no),
        }
    }

    pub fn to_gtid(self) -> Gtid {
        Gtid {
            domain_id: self.domain_id.get(),
            server_id: self.server_id.get(),
            seq_no: self.seq_no.get(),
        }
    }
}

/// Offset of the page header within a page buffer. The first physical page
/// of the file carries the file header before its page header.
pub fn page_header_offset(first_file_page: bool) -> usize {
    if first_file_page {
        FILE_HEADER_SIZE
    } else {
        0
    }
}

/// Offset of the first data byte within a page buffer.
pub fn page_data_start(first_file_page: bool) -> usize {
    page_header_offset(first_file_page) + PAGE_HEADER_SIZE
}

/// CRC32 over all page bytes except the trailing checksum field itself.
pub fn page_checksum(page: &[u8]) -> u32 {
    CRC32.checksum(&page[..page.len() - CHECKSUM_SIZE])
}

pub fn store_page_checksum(page: &mut [u8]) {
    let crc = page_checksum(page);
    let len = page.len();
    page[len - CHECKSUM_SIZE..].copy_from_slice(&crc.to_le_bytes());
}

pub fn verify_page_checksum(page: &[u8]) -> bool {
    let stored = u32::from_le_bytes(
        page[page.len() - CHECKSUM_SIZE..]
            .try_into()
            .expect("checksum trailer is 4 bytes"),
    );
    page_checksum(page) == stored
}
