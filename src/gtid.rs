//! # GTID State Tracking
//!
//! This module provides the replication state primitives the binlog GTID
//! index is built from: the GTID triple itself, the per-domain "last seen
//! GTID" state snapshot, and the target position a connecting replica
//! supplies when it asks where to start reading.
//!
//! ## GTID Ordering Model
//!
//! A GTID is the triple (domain_id, server_id, seq_no). Each domain is an
//! independent replication stream: seq_no totally orders transactions
//! *within* a domain, while different domains are unordered relative to each
//! other. server_id identifies the originating server and is carried in
//! state snapshots but never participates in ordering comparisons.
//!
//! ## Binlog State
//!
//! `BinlogState` records, for each domain, the most recent GTID seen at some
//! point in a binlog file. The index stores a sequence of such snapshots;
//! most of them are delta-compressed on disk (only the domains that changed
//! since the previous snapshot), so reconstructing a snapshot means replaying
//! deltas forward from the nearest full snapshot via [`BinlogState::merge_list`].
//!
//! ## Position Comparison
//!
//! `SlaveConnectionState` is the per-domain position a replica connects with.
//! [`BinlogState::is_before_pos`] answers "has the binlog, up to this point,
//! produced nothing the replica hasn't already seen?": TRUE iff every domain
//! present in the state is dominated by the target position. A state domain
//! the target knows nothing about means the binlog has already moved past the
//! replica's position, so the answer is FALSE. The empty state (the very
//! start of a binlog) is vacuously before every position.

use hashbrown::HashMap;
use smallvec::SmallVec;

/// Global transaction identifier: (domain_id, server_id, seq_no).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub seq_no: u64,
}

impl Gtid {
    pub fn new(domain_id: u32, server_id: u32, seq_no: u64) -> Self {
        Self {
            domain_id,
            server_id,
            seq_no,
        }
    }
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

/// GTID lists are almost always short (one entry per replication domain).
pub type GtidList = SmallVec<[Gtid; 8]>;

/// The last GTID seen in each replication domain at some point in a binlog.
#[derive(Debug, Clone, Default)]
pub struct BinlogState {
    by_domain: HashMap<u32, Gtid>,
}

impl BinlogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record GTID as the most recent one seen in its domain.
    pub fn update(&mut self, gtid: &Gtid) {
        self.by_domain.insert(gtid.domain_id, *gtid);
    }

    /// Replay a (possibly delta-compressed) GTID list into this state.
    pub fn merge_list(&mut self, gtid_list: &[Gtid]) {
        for gtid in gtid_list {
            self.update(gtid);
        }
    }

    /// Replace this state with a copy of another.
    pub fn load(&mut self, other: &BinlogState) {
        self.by_domain.clear();
        for (domain, gtid) in &other.by_domain {
            self.by_domain.insert(*domain, *gtid);
        }
    }

    pub fn reset(&mut self) {
        self.by_domain.clear();
    }

    pub fn count(&self) -> u32 {
        self.by_domain.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    pub fn get(&self, domain_id: u32) -> Option<&Gtid> {
        self.by_domain.get(&domain_id)
    }

    /// Materialize the state as a flat GTID list, sorted by domain so that
    /// serialized snapshots are deterministic.
    pub fn gtid_list(&self) -> GtidList {
        let mut list: GtidList = self.by_domain.values().copied().collect();
        list.sort_unstable_by_key(|g| g.domain_id);
        list
    }

    /// True if every domain in this state has reached at most the target
    /// position. A domain the target does not know about means the binlog
    /// has already moved past the target, so the state is not before it.
    pub fn is_before_pos(&self, pos: &SlaveConnectionState) -> bool {
        self.by_domain.values().all(|gtid| match pos.get(gtid.domain_id) {
            Some(target) => gtid.seq_no <= target.seq_no,
            None => false,
        })
    }
}

/// The GTID position a connecting replica reports: for each domain, the last
/// transaction it has already applied.
#[derive(Debug, Clone, Default)]
pub struct SlaveConnectionState {
    by_domain: HashMap<u32, Gtid>,
}

impl SlaveConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_gtid_list(gtid_list: &[Gtid]) -> Self {
        let mut state = Self::new();
        for gtid in gtid_list {
            state.update(gtid);
        }
        state
    }

    pub fn update(&mut self, gtid: &Gtid) {
        self.by_domain.insert(gtid.domain_id, *gtid);
    }

    pub fn get(&self, domain_id: u32) -> Option<&Gtid> {
        self.by_domain.get(&domain_id)
    }

    pub fn count(&self) -> u32 {
        self.by_domain.len() as u32
    }
}
