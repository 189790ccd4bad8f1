//! Resource blocks: the named objects locks are taken against.
//!
//! A resource owns its three lock queues (by id; the id table owns the lock
//! blocks themselves) and is reference-counted by the locks and transient
//! holders pointing at it. When the count drops to zero the resource moves
//! to the toss list, where the scanner reclaims it after `toss_secs` unless
//! a new reference rescues it first.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashMap;

use crate::flags;
use crate::lkb::{Lkb, LkbState, LkbTable};
use crate::mode::Mode;

/// Who masters a resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MasterState {
    /// Not yet looked up in the directory.
    Unknown,
    /// This node is the master.
    Local,
    /// A remote node is the master.
    Remote(u32),
}

impl MasterState {
    pub fn is_local(self) -> bool {
        self == MasterState::Local
    }

    pub fn is_unknown(self) -> bool {
        self == MasterState::Unknown
    }

    /// The master nodeid as locks record it: `Some(0)` for self.
    pub fn lock_nodeid(self) -> Option<u32> {
        match self {
            MasterState::Unknown => None,
            MasterState::Local => Some(0),
            MasterState::Remote(nodeid) => Some(nodeid),
        }
    }

    /// Maps a directory answer to a master state.
    pub fn from_lookup(master: u32, us: u32) -> MasterState {
        if master == us {
            MasterState::Local
        } else {
            MasterState::Remote(master)
        }
    }
}

/// Mutable part of a resource, guarded by one mutex.
///
/// Lock order: a resource body may be held while individual lock blocks are
/// locked one at a time; never the other way round, and never two resource
/// bodies at once.
pub struct RsbBody {
    pub master: MasterState,
    /// `RSF_*` bits.
    pub flags: u32,
    /// Granted locks, ordered by granted mode descending.
    pub grant_queue: Vec<u32>,
    /// Converting locks; EXPEDITE at head, QUECVT at tail, the rest ordered
    /// by requested mode descending.
    pub convert_queue: Vec<u32>,
    /// Waiting new requests, FIFO.
    pub wait_queue: Vec<u32>,
    pub lvb: Option<Vec<u8>>,
    pub lvbseq: u32,
}

/// A named lock resource.
pub struct Rsb {
    pub name: Vec<u8>,
    refcount: AtomicU32,
    body: Mutex<RsbBody>,
}

impl Rsb {
    fn new(name: Vec<u8>) -> Self {
        Self {
            name,
            refcount: AtomicU32::new(0),
            body: Mutex::new(RsbBody {
                master: MasterState::Unknown,
                flags: 0,
                grant_queue: Vec::new(),
                convert_queue: Vec::new(),
                wait_queue: Vec::new(),
                lvb: None,
                lvbseq: 0,
            }),
        }
    }

    pub fn body(&self) -> MutexGuard<'_, RsbBody> {
        self.body.lock().expect("rsb poisoned")
    }

    pub fn hold(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    fn unhold(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

impl RsbBody {
    pub fn is_empty(&self) -> bool {
        self.grant_queue.is_empty() && self.convert_queue.is_empty() && self.wait_queue.is_empty()
    }

    fn queue_mut(&mut self, state: LkbState) -> &mut Vec<u32> {
        match state {
            LkbState::Waiting => &mut self.wait_queue,
            LkbState::Granted => &mut self.grant_queue,
            LkbState::Convert => &mut self.convert_queue,
        }
    }

    pub fn queue(&self, state: LkbState) -> &Vec<u32> {
        match state {
            LkbState::Waiting => &self.wait_queue,
            LkbState::Granted => &self.grant_queue,
            LkbState::Convert => &self.convert_queue,
        }
    }
}

/// Inserts `lkid` before the first queue member whose relevant mode is
/// weaker than `mode`.
fn insert_ordered(queue: &mut Vec<u32>, lkbs: &LkbTable, lkid: u32, mode: Mode, granted: bool) {
    let mut at = queue.len();
    for (i, other_id) in queue.iter().enumerate() {
        let Some(other) = lkbs.get(*other_id) else {
            continue;
        };
        let other = other.lock().expect("lkb poisoned");
        let other_mode = if granted { other.grmode } else { other.rqmode };
        if other_mode < mode {
            at = i;
            break;
        }
    }
    queue.insert(at, lkid);
}

/// Adds a lock to one of the resource's queues and stamps its state.
/// The resource body lock must already be held (it is the `body` argument).
pub fn lkb_enqueue(body: &mut RsbBody, lkbs: &LkbTable, lkb: &mut Lkb, state: LkbState) {
    debug_assert!(lkb.state.is_none(), "enqueue of a queued lock {:#x}", lkb.id);
    lkb.state = Some(state);
    match state {
        LkbState::Waiting => body.wait_queue.push(lkb.id),
        LkbState::Granted => {
            insert_ordered(&mut body.grant_queue, lkbs, lkb.id, lkb.grmode, true)
        }
        LkbState::Convert => {
            if lkb.exflags & flags::LKF_EXPEDITE != 0 {
                body.convert_queue.insert(0, lkb.id);
            } else if lkb.exflags & flags::LKF_QUECVT != 0 {
                body.convert_queue.push(lkb.id);
            } else {
                insert_ordered(&mut body.convert_queue, lkbs, lkb.id, lkb.rqmode, false)
            }
        }
    }
}

/// Removes a lock from whatever queue it is on; returns the old state.
pub fn lkb_dequeue(body: &mut RsbBody, lkb: &mut Lkb) -> Option<LkbState> {
    let state = lkb.state.take()?;
    body.queue_mut(state).retain(|id| *id != lkb.id);
    Some(state)
}

/// Dequeue-then-enqueue in one step.
pub fn lkb_swqueue(
    body: &mut RsbBody,
    lkbs: &LkbTable,
    lkb: &mut Lkb,
    state: LkbState,
) -> Option<LkbState> {
    let old = lkb_dequeue(body, lkb);
    lkb_enqueue(body, lkbs, lkb, state);
    old
}

/// The resource table plus the toss list of unreferenced resources.
pub struct RsbTable {
    resources: DashMap<Vec<u8>, Arc<Rsb>>,
    toss: Mutex<Vec<(Vec<u8>, Instant)>>,
}

impl RsbTable {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            toss: Mutex::new(Vec::new()),
        }
    }

    /// Looks a resource up, optionally creating it, and takes a reference.
    /// A resource fished off the toss list is rescued.
    pub fn find_or_create(&self, name: &[u8], create: bool) -> Option<Arc<Rsb>> {
        // The table guard must be gone before the toss list is locked; the
        // scanner takes the two the other way round.
        let existing = self.resources.get(name).map(|entry| entry.value().clone());
        if let Some(rsb) = existing {
            rsb.hold();
            self.untoss(name);
            return Some(rsb);
        }
        if !create {
            return None;
        }
        let rsb = self
            .resources
            .entry(name.to_vec())
            .or_insert_with(|| Arc::new(Rsb::new(name.to_vec())))
            .value()
            .clone();
        rsb.hold();
        self.untoss(name);
        Some(rsb)
    }

    fn untoss(&self, name: &[u8]) {
        let mut toss = self.toss.lock().expect("toss poisoned");
        toss.retain(|(tossed, _)| tossed != name);
    }

    /// Drops a reference; an unreferenced resource goes on the toss list.
    pub fn release(&self, rsb: &Arc<Rsb>) {
        if rsb.unhold() == 0 {
            let mut toss = self.toss.lock().expect("toss poisoned");
            toss.push((rsb.name.clone(), Instant::now()));
        }
    }

    /// Reclaims tossed resources older than `age_secs`, returning them so
    /// the caller can retire their directory records.
    pub fn scan(&self, age_secs: u64) -> Vec<Arc<Rsb>> {
        let now = Instant::now();
        let mut toss = self.toss.lock().expect("toss poisoned");
        let mut freed = Vec::new();
        toss.retain(|(name, stamp)| {
            if now.duration_since(*stamp).as_secs() < age_secs {
                return true;
            }
            if let Some(rsb) = self.resources.get(name).map(|entry| entry.value().clone()) {
                if rsb.refcount() > 0 {
                    // Re-referenced after its last release; keep it.
                    return false;
                }
                self.resources.remove(name);
                freed.push(rsb);
            }
            false
        });
        freed
    }

    pub fn get(&self, name: &[u8]) -> Option<Arc<Rsb>> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    /// All resources, for recovery sweeps.
    pub fn snapshot(&self) -> Vec<Arc<Rsb>> {
        self.resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.resources.clear();
        self.toss.lock().expect("toss poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{LKF_EXPEDITE, LKF_QUECVT};

    fn lkb_with_modes(lkbs: &LkbTable, grmode: Mode, rqmode: Mode, exflags: u32) -> u32 {
        let (lkid, lkb) = lkbs.create();
        let mut lkb = lkb.lock().unwrap();
        lkb.grmode = grmode;
        lkb.rqmode = rqmode;
        lkb.exflags = exflags;
        lkid
    }

    fn enqueue(rsb: &Rsb, lkbs: &LkbTable, lkid: u32, state: LkbState) {
        let lkb = lkbs.get(lkid).unwrap();
        let mut body = rsb.body();
        lkb_enqueue(&mut body, lkbs, &mut lkb.lock().unwrap(), state);
    }

    #[test]
    fn grant_queue_orders_by_mode_descending() {
        let lkbs = LkbTable::new(4);
        let rsb = Rsb::new(b"r".to_vec());
        let nl = lkb_with_modes(&lkbs, Mode::Nl, Mode::Iv, 0);
        let ex = lkb_with_modes(&lkbs, Mode::Ex, Mode::Iv, 0);
        let pr = lkb_with_modes(&lkbs, Mode::Pr, Mode::Iv, 0);
        enqueue(&rsb, &lkbs, nl, LkbState::Granted);
        enqueue(&rsb, &lkbs, ex, LkbState::Granted);
        enqueue(&rsb, &lkbs, pr, LkbState::Granted);
        assert_eq!(rsb.body().grant_queue, vec![ex, pr, nl]);
    }

    #[test]
    fn convert_queue_respects_expedite_and_quecvt() {
        let lkbs = LkbTable::new(4);
        let rsb = Rsb::new(b"r".to_vec());
        let plain = lkb_with_modes(&lkbs, Mode::Cr, Mode::Pw, 0);
        let quecvt = lkb_with_modes(&lkbs, Mode::Cr, Mode::Ex, LKF_QUECVT);
        let expedite = lkb_with_modes(&lkbs, Mode::Cr, Mode::Nl, LKF_EXPEDITE);
        enqueue(&rsb, &lkbs, plain, LkbState::Convert);
        enqueue(&rsb, &lkbs, quecvt, LkbState::Convert);
        enqueue(&rsb, &lkbs, expedite, LkbState::Convert);
        assert_eq!(rsb.body().convert_queue, vec![expedite, plain, quecvt]);
    }

    #[test]
    fn wait_queue_is_fifo() {
        let lkbs = LkbTable::new(4);
        let rsb = Rsb::new(b"r".to_vec());
        let a = lkb_with_modes(&lkbs, Mode::Iv, Mode::Ex, 0);
        let b = lkb_with_modes(&lkbs, Mode::Iv, Mode::Nl, 0);
        enqueue(&rsb, &lkbs, a, LkbState::Waiting);
        enqueue(&rsb, &lkbs, b, LkbState::Waiting);
        assert_eq!(rsb.body().wait_queue, vec![a, b]);
    }

    #[test]
    fn dequeue_clears_state() {
        let lkbs = LkbTable::new(4);
        let rsb = Rsb::new(b"r".to_vec());
        let lkid = lkb_with_modes(&lkbs, Mode::Iv, Mode::Ex, 0);
        enqueue(&rsb, &lkbs, lkid, LkbState::Waiting);
        let lkb = lkbs.get(lkid).unwrap();
        let old = lkb_dequeue(&mut rsb.body(), &mut lkb.lock().unwrap());
        assert_eq!(old, Some(LkbState::Waiting));
        assert!(lkb.lock().unwrap().state.is_none());
        assert!(rsb.body().wait_queue.is_empty());
    }

    #[test]
    fn toss_and_rescue() {
        let table = RsbTable::new();
        let rsb = table.find_or_create(b"r", true).unwrap();
        table.release(&rsb);
        // Young entries stay.
        assert!(table.scan(60).is_empty());
        assert!(table.get(b"r").is_some());
        // A rescue takes it off the toss list for good.
        let again = table.find_or_create(b"r", false).unwrap();
        assert_eq!(again.refcount(), 1);
        assert!(table.scan(0).is_empty());
        // Released with no rescue, an aged entry is reclaimed.
        table.release(&again);
        assert_eq!(table.scan(0).len(), 1);
        assert!(table.get(b"r").is_none());
    }
}
