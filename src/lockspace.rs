//! The lockspace: one named, independently recovering locking domain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

use crate::ast_task::AstQueue;
use crate::comms::Comms;
use crate::config::Config;
use crate::dir::{name_hash, Directory};
use crate::lkb::LkbTable;
use crate::member::Membership;
use crate::message_types::{Body, Command, Frame, LockMessage, RecoverMessage, LVB_LEN};
use crate::rcom::RcomState;
use crate::rsb::RsbTable;
use crate::serializer::message::write_frame;

// Lockspace flag bits.
/// Locking enabled; clear from the first stop until recovery finishes.
pub const LSFL_RUN: u32 = 1 << 0;
/// A stop event arrived and has not been superseded by a newer start.
pub const LSFL_STOP: u32 = 1 << 1;
/// An unconsumed start event is queued.
pub const LSFL_START: u32 = 1 << 2;
/// An unconsumed finish event is queued.
pub const LSFL_FINISH: u32 = 1 << 3;
/// Our membership list matches the current epoch.
pub const LSFL_NODES_VALID: u32 = 1 << 4;
/// Every peer reported `NODES_VALID`.
pub const LSFL_ALL_NODES_VALID: u32 = 1 << 5;
/// Our directory share is rebuilt for the current epoch.
pub const LSFL_DIR_VALID: u32 = 1 << 6;
/// Every peer reported `DIR_VALID`.
pub const LSFL_ALL_DIR_VALID: u32 = 1 << 7;
/// Log messages that arrive while recovery is running.
pub const LSFL_REQUEST_WARN: u32 = 1 << 8;
/// Lockspace opted out of the waiter-timeout timer.
pub const LSFL_NOTIMERS: u32 = 1 << 9;

/// Flag accepted by `new_lockspace`: disable operation timeouts.
pub const LSF_NOTIMERS: u32 = 1;

/// Recovery coordinator states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LsState {
    /// Created, never started.
    Init,
    /// First start completed, awaiting its finish.
    InitDone,
    /// Running normally.
    Clear,
    /// Stopped (or a start failed); waiting for the next start.
    WaitStart,
    /// A reconfiguration start completed, awaiting its finish.
    ReconfigDone,
}

/// A start event as delivered by the cluster manager.
#[derive(Debug, Clone)]
pub struct StartEvent {
    pub event_id: u32,
    pub nodeids: Vec<u32>,
}

/// Pending membership events, coalesced by the recovery task.
#[derive(Debug, Default)]
pub struct RecoverEvents {
    pub last_stop: u32,
    pub last_start: u32,
    pub last_finish: u32,
    pub starts: Vec<StartEvent>,
}

/// An inbound message parked while recovery runs.
pub struct QueuedRequest {
    pub nodeid: u32,
    pub frame: Frame,
}

pub struct Lockspace {
    pub name: String,
    /// Cluster-wide id: a stable hash of the name, so every node derives
    /// the same value without coordination.
    pub global_id: u32,
    /// Bytes of LVB the caller sees; the wire always carries [`LVB_LEN`].
    pub lvblen: usize,
    pub config: Arc<Config>,
    pub comms: Comms,
    flags: AtomicU32,
    pub state: Mutex<LsState>,
    pub lkbs: LkbTable,
    pub rsbs: RsbTable,
    pub dir: Directory,
    pub members: Mutex<Membership>,
    /// Lock ids with an outstanding remote operation.
    pub waiters: Mutex<Vec<u32>>,
    /// Queued conversions enrolled for deadlock checking.
    pub deadlockq: Mutex<Vec<u32>>,
    pub requestqueue: Mutex<VecDeque<QueuedRequest>>,
    /// Held read by every operation, write across recovery.
    pub in_recovery: Arc<RwLock<()>>,
    recovery_guard: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    pub recover: Mutex<RecoverEvents>,
    /// Wakes the recovery task when events arrive.
    pub recover_notify: Notify,
    /// General-purpose recovery wait channel (peer status, reply arrival).
    pub wait_notify: Notify,
    pub rcom: RcomState,
    /// Recovery-time master lookups in flight: rcom msgid -> resource name.
    pub recover_list: Mutex<std::collections::HashMap<u32, Vec<u8>>>,
    pub asts: Arc<AstQueue>,
    /// Remaster bookkeeping: locks sent to new masters vs. new ids back.
    pub lkids_expected: AtomicU32,
    pub lkids_received: AtomicU32,
    /// Publishes the event id of each completed start phase, for the
    /// cluster manager to collect before it issues the finish.
    start_done_tx: tokio::sync::watch::Sender<u32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lockspace {
    pub fn new(
        name: &str,
        lvblen: usize,
        flags: u32,
        config: Arc<Config>,
        comms: Comms,
        asts: Arc<AstQueue>,
    ) -> Arc<Lockspace> {
        let mut initial = 0;
        if flags & LSF_NOTIMERS != 0 {
            initial |= LSFL_NOTIMERS;
        }
        Arc::new(Lockspace {
            name: name.to_string(),
            global_id: name_hash(name.as_bytes()),
            lvblen: lvblen.min(LVB_LEN),
            config: config.clone(),
            comms,
            flags: AtomicU32::new(initial),
            state: Mutex::new(LsState::Init),
            lkbs: LkbTable::new(config.lkbtbl_size),
            rsbs: RsbTable::new(),
            dir: Directory::new(),
            members: Mutex::new(Membership::new()),
            waiters: Mutex::new(Vec::new()),
            deadlockq: Mutex::new(Vec::new()),
            requestqueue: Mutex::new(VecDeque::new()),
            in_recovery: Arc::new(RwLock::new(())),
            recovery_guard: Mutex::new(None),
            recover: Mutex::new(RecoverEvents::default()),
            recover_notify: Notify::new(),
            wait_notify: Notify::new(),
            rcom: RcomState::new(),
            recover_list: Mutex::new(std::collections::HashMap::new()),
            asts,
            lkids_expected: AtomicU32::new(0),
            lkids_received: AtomicU32::new(0),
            start_done_tx: tokio::sync::watch::channel(0).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Marks the start phase with `event_id` complete.
    pub fn set_start_done(&self, event_id: u32) {
        tracing::info!(ls = %self.name, event_id, "recover event done");
        let _ = self.start_done_tx.send(event_id);
    }

    /// Watch channel carrying the last completed start event id.
    pub fn start_done(&self) -> tokio::sync::watch::Receiver<u32> {
        self.start_done_tx.subscribe()
    }

    pub fn our_nodeid(&self) -> u32 {
        self.comms.our_nodeid()
    }

    pub fn test_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bit != 0
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::SeqCst);
    }

    /// Atomically clears `bit`, reporting whether it was set.
    pub fn take_flag(&self, bit: u32) -> bool {
        self.flags.fetch_and(!bit, Ordering::SeqCst) & bit != 0
    }

    pub fn running(&self) -> bool {
        self.test_flag(LSFL_RUN)
    }

    /// True while an unprocessed stop makes further recovery work futile.
    pub fn recovery_stopped(&self) -> bool {
        self.test_flag(LSFL_STOP)
    }

    pub fn keep_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("tasks poisoned").push(handle);
    }

    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().expect("tasks poisoned").drain(..) {
            handle.abort();
        }
    }

    // Outbound helpers.

    pub fn send_lock(&self, nodeid: u32, cmd: Command, msg: LockMessage) {
        let frame = write_frame(self.global_id, self.our_nodeid(), cmd, &Body::Lock(msg));
        self.comms.send(nodeid, frame);
    }

    pub fn send_recover(&self, nodeid: u32, cmd: Command, msg: RecoverMessage) {
        let frame = write_frame(self.global_id, self.our_nodeid(), cmd, &Body::Recover(msg));
        self.comms.send(nodeid, frame);
    }

    /// Copies caller-visible LVB bytes into a wire buffer.
    pub fn lvb_to_wire(&self, lvb: &[u8]) -> [u8; LVB_LEN] {
        let mut wire = [0u8; LVB_LEN];
        let len = lvb.len().min(LVB_LEN);
        wire[..len].copy_from_slice(&lvb[..len]);
        wire
    }

    /// Copies wire LVB bytes into a caller-sized buffer.
    pub fn lvb_from_wire(&self, wire: &[u8; LVB_LEN]) -> Vec<u8> {
        wire[..self.lvblen].to_vec()
    }

    // Membership event intake (shape of the external cluster manager
    // interface; any mechanism may call these).

    /// Freeze all operations. Returns once every in-flight operation has
    /// drained out of the engine.
    pub async fn stop(self: &Arc<Self>) {
        let newly_stopped = {
            let mut recover = self.recover.lock().expect("recover poisoned");
            recover.last_stop = recover.last_start;
            self.set_flag(LSFL_STOP);
            self.take_flag(LSFL_RUN)
        };
        if newly_stopped {
            let guard = self.in_recovery.clone().write_owned().await;
            *self.recovery_guard.lock().expect("guard poisoned") = Some(guard);
        }
        self.clear_flag(LSFL_NODES_VALID | LSFL_ALL_NODES_VALID | LSFL_DIR_VALID | LSFL_ALL_DIR_VALID);
        tracing::info!(ls = %self.name, "stop");
        self.recover_notify.notify_one();
        self.wait_notify.notify_waiters();
    }

    /// Announce the intended membership of a new epoch.
    pub fn start(self: &Arc<Self>, event_id: u32, nodeids: Vec<u32>) {
        {
            let mut recover = self.recover.lock().expect("recover poisoned");
            recover.last_start = event_id;
            recover.starts.push(StartEvent { event_id, nodeids });
            self.set_flag(LSFL_START);
        }
        tracing::info!(ls = %self.name, event_id, "start");
        self.recover_notify.notify_one();
    }

    /// All peers completed the start with `event_id`.
    pub fn finish(self: &Arc<Self>, event_id: u32) {
        {
            let mut recover = self.recover.lock().expect("recover poisoned");
            recover.last_finish = event_id;
            self.set_flag(LSFL_FINISH);
        }
        tracing::info!(ls = %self.name, event_id, "finish");
        self.recover_notify.notify_one();
    }

    /// Abort any recovery wait (cluster teardown path).
    pub fn terminate(self: &Arc<Self>) {
        self.set_flag(LSFL_STOP);
        self.recover_notify.notify_one();
        self.wait_notify.notify_waiters();
    }

    /// Re-enables locking unless a newer stop superseded `event_id`.
    /// Called by the recovery task on finish.
    pub fn enable_locking(&self, event_id: u32) -> bool {
        let recover = self.recover.lock().expect("recover poisoned");
        if recover.last_stop < event_id {
            self.set_flag(LSFL_RUN);
            *self.recovery_guard.lock().expect("guard poisoned") = None;
            true
        } else {
            tracing::debug!(ls = %self.name, event_id, "enable_locking aborted");
            false
        }
    }

    /// Remote lock activity probe used by `release_lockspace`:
    /// 0 = idle, 1 = master copies only, 2 = local locks exist.
    pub fn busy(&self) -> u8 {
        if self.lkbs.any(|lkb| !lkb.is_mstcpy()) {
            2
        } else if !self.lkbs.is_empty() {
            1
        } else {
            0
        }
    }
}
