//! Lock blocks and the sharded lock-id table.
//!
//! A lock id is 32 bits: the low 16 bits name the id-table bucket, the high
//! 16 bits are a per-bucket sequence. Sequences roll over, so a fresh id is
//! always checked against the table before use.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;

use crate::flags;
use crate::message_types::{BlockingFn, CompletionFn, Status};
use crate::mode::Mode;

/// Which queue of its resource a lock currently sits on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum LkbState {
    Waiting = 1,
    Granted = 2,
    Convert = 3,
}

impl LkbState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<LkbState> {
        match raw {
            1 => Some(LkbState::Waiting),
            2 => Some(LkbState::Granted),
            3 => Some(LkbState::Convert),
            _ => None,
        }
    }
}

/// The remote operation a parked lock is waiting a reply for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitType {
    /// Directory lookup; the master is not known yet.
    Lookup,
    Request,
    Convert,
    Unlock,
    Cancel,
}

/// Range slot indices: granted interval then requested interval.
pub const GR_RANGE_START: usize = 0;
pub const GR_RANGE_END: usize = 1;
pub const RQ_RANGE_START: usize = 2;
pub const RQ_RANGE_END: usize = 3;

/// One lock request or holding.
///
/// Either caller-owned (a local lock, possibly a process copy of a remote
/// master's state) or a master copy (`IFL_MSTCPY`) representing a remote
/// holder; the two kinds never mix on one block.
pub struct Lkb {
    pub id: u32,
    /// Partner lock id on the other node, when there is one.
    pub remid: u32,
    /// Local lock: the master node (`Some(0)` when self-mastered, `None`
    /// while a directory lookup is in flight). Master copy: the node that
    /// holds the real lock.
    pub nodeid: Option<u32>,
    /// Queue membership; `None` while the lock is on no queue.
    pub state: Option<LkbState>,
    pub grmode: Mode,
    pub rqmode: Mode,
    /// Caller flags of the operation in progress.
    pub exflags: u32,
    /// `IFL_*` bits.
    pub iflags: u32,
    /// `SBF_*` bits reported with the next completion.
    pub sbflags: u8,
    /// Result reported with the next completion.
    pub retstatus: Status,
    /// Owning resource. Set as soon as the lock is bound to one.
    pub resource: Option<Arc<crate::rsb::Rsb>>,
    /// Lock value block. On a local lock this is the caller's buffer; on a
    /// master copy it is the holder's last sent value.
    pub lvb: Option<Vec<u8>>,
    pub lvbseq: u32,
    /// `[gr_start, gr_end, rq_start, rq_end]`; `None` covers everything.
    pub range: Option<[u64; 4]>,
    /// Highest mode a blocking notification was already sent for.
    pub highbast: Mode,
    /// Requested mode reported by the pending blocking notification.
    pub bastmode: Mode,
    /// Pending notification bits (`AST_COMP`/`AST_BAST`/`AST_DEL`).
    pub ast_pending: u8,
    /// Outstanding remote operation, if any.
    pub wait_type: Option<WaitType>,
    /// When the outstanding remote operation was sent.
    pub wait_stamp: Option<Instant>,
    /// When the queued conversion became due for deadlock checking.
    pub due_stamp: Option<Instant>,
    /// An inbound request on this master copy still needs its reply; a
    /// grant is folded into that reply instead of a separate message.
    pub reply_pending: bool,
    /// Notification kinds the remote owner of a master copy registered.
    pub remote_asts: u8,
    pub ast: Option<CompletionFn>,
    pub bast: Option<BlockingFn>,
}

impl Lkb {
    fn new(id: u32) -> Self {
        Self {
            id,
            remid: 0,
            nodeid: None,
            state: None,
            grmode: Mode::Iv,
            rqmode: Mode::Iv,
            exflags: 0,
            iflags: 0,
            sbflags: 0,
            retstatus: Status::Ok,
            resource: None,
            lvb: None,
            lvbseq: 0,
            range: None,
            highbast: Mode::Iv,
            bastmode: Mode::Iv,
            ast_pending: 0,
            wait_type: None,
            wait_stamp: None,
            due_stamp: None,
            reply_pending: false,
            remote_asts: 0,
            ast: None,
            bast: None,
        }
    }

    pub fn is_mstcpy(&self) -> bool {
        self.iflags & flags::IFL_MSTCPY != 0
    }

    /// Installs the requested interval, keeping any granted interval.
    pub fn set_range(&mut self, start: u64, end: u64) {
        let range = self.range.get_or_insert([0, u64::MAX, 0, u64::MAX]);
        range[RQ_RANGE_START] = start;
        range[RQ_RANGE_END] = end;
    }

    /// Copies the requested interval over the granted one on grant.
    pub fn promote_range(&mut self) {
        if let Some(range) = self.range.as_mut() {
            range[GR_RANGE_START] = range[RQ_RANGE_START];
            range[GR_RANGE_END] = range[RQ_RANGE_END];
        }
    }
}

pub type LkbRef = Arc<Mutex<Lkb>>;

/// Sharded id table owning every lock block of a lockspace.
pub struct LkbTable {
    locks: DashMap<u32, LkbRef>,
    counters: Vec<Mutex<u16>>,
    mask: u32,
}

impl LkbTable {
    /// `buckets` must be a power of two no larger than 65536.
    pub fn new(buckets: usize) -> Self {
        Self {
            locks: DashMap::new(),
            counters: (0..buckets).map(|_| Mutex::new(0)).collect(),
            mask: buckets as u32 - 1,
        }
    }

    /// Allocates a fresh lock block with a unique id.
    pub fn create(&self) -> (u32, LkbRef) {
        let mut rng = rand::rng();
        loop {
            let bucket = rng.random::<u32>() & self.mask;
            let lkid = {
                let mut counter = self.counters[bucket as usize]
                    .lock()
                    .expect("lkb counter poisoned");
                *counter = counter.wrapping_add(1);
                bucket | (u32::from(*counter) << 16)
            };
            if self.locks.contains_key(&lkid) {
                continue;
            }
            let lkb: LkbRef = Arc::new(Mutex::new(Lkb::new(lkid)));
            self.locks.insert(lkid, lkb.clone());
            return (lkid, lkb);
        }
    }

    pub fn get(&self, lkid: u32) -> Option<LkbRef> {
        self.locks.get(&lkid).map(|entry| entry.value().clone())
    }

    /// Unlinks the block from the table. The block itself lives on while
    /// anything still holds its `Arc` (the dispatcher during a final
    /// completion, for instance).
    pub fn remove(&self, lkid: u32) -> Option<LkbRef> {
        self.locks.remove(&lkid).map(|(_, lkb)| lkb)
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Snapshot of all ids currently in the table.
    pub fn ids(&self) -> Vec<u32> {
        self.locks.iter().map(|entry| *entry.key()).collect()
    }

    /// True if any block satisfies `pred`.
    pub fn any(&self, pred: impl Fn(&Lkb) -> bool) -> bool {
        self.locks
            .iter()
            .any(|entry| pred(&entry.value().lock().expect("lkb poisoned")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_encode_their_bucket() {
        let table = LkbTable::new(16);
        for _ in 0..100 {
            let (lkid, _) = table.create();
            assert!(lkid & 0xffff < 16);
            assert!(table.get(lkid).is_some());
        }
    }

    #[test]
    fn ids_are_unique() {
        let table = LkbTable::new(1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let (lkid, _) = table.create();
            assert!(seen.insert(lkid), "duplicate id {lkid:#x}");
        }
    }

    #[test]
    fn remove_unlinks() {
        let table = LkbTable::new(4);
        let (lkid, lkb) = table.create();
        assert!(!table.is_empty());
        let removed = table.remove(lkid).unwrap();
        assert!(Arc::ptr_eq(&lkb, &removed));
        assert!(table.get(lkid).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn range_promotion() {
        let mut lkb = Lkb::new(1);
        lkb.set_range(10, 20);
        assert_eq!(lkb.range.unwrap()[GR_RANGE_START], 0);
        assert_eq!(lkb.range.unwrap()[GR_RANGE_END], u64::MAX);
        lkb.promote_range();
        assert_eq!(lkb.range.unwrap()[GR_RANGE_START], 10);
        assert_eq!(lkb.range.unwrap()[GR_RANGE_END], 20);
    }
}
