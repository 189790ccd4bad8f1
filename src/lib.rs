//! DLM - a distributed lock manager in Rust.
//!
//! Named locks in six compatibility modes, coordinated cluster-wide: each
//! resource is mastered on one node, lock state survives node failures by
//! remastering onto the living, and callers are notified through
//! asynchronous completion and blocking callbacks.
//!
//! A process creates one [`Dlm`] node runtime, attaches a transport, and
//! opens lockspaces. Membership events (stop / start / finish) are pushed
//! into each lockspace by an external cluster manager through the handle.

mod ast_task;
pub mod comms;
pub mod config;
mod dir;
pub mod flags;
mod lkb;
mod locking;
mod lockspace;
mod member;
pub mod message_types;
pub mod mode;
mod parser;
mod proto;
pub mod query;
mod rcom;
mod recover;
mod recovery_task;
mod remaster;
mod requestqueue;
mod rsb;
mod serializer;
#[cfg(test)]
mod testutil;
mod waiters;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ast_task::{AstQueue, AstTask, ScanTask, TimerTask};
use crate::comms::{Comms, InboundReceiver, InboundSender, SendTask, Transport};
use crate::config::Config;
use crate::lockspace::Lockspace;
use crate::parser::message::parse_frame;
use crate::recovery_task::RecoveryTask;

pub use crate::lkb::{LkbState, WaitType};
pub use crate::locking::{Error as LockError, LockArgs};
pub use crate::lockspace::LSF_NOTIMERS;
pub use crate::message_types::{BlockingFn, CompletionFn, LockStatus, Status};
pub use crate::mode::Mode;
pub use crate::query::{LockInfo, ResourceInfo};
pub use crate::rsb::MasterState;

/// Lockspace lifecycle errors.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// A lockspace with that name is already open.
    Exists,
    /// Unknown lockspace handle/name.
    NotFound,
    /// The lockspace still holds locks the force level does not override.
    Busy,
}

struct DlmInner {
    nodeid: u32,
    config: Arc<Config>,
    inbound_tx: InboundSender,
    outbound_tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(u32, Vec<u8>)>>>,
    inbound_rx: Mutex<Option<InboundReceiver>>,
    registry: Arc<DashMap<u32, Arc<Lockspace>>>,
    asts: Arc<AstQueue>,
    ls_count: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// One node's lock manager runtime.
#[derive(Clone)]
pub struct Dlm {
    inner: Arc<DlmInner>,
}

impl Dlm {
    pub fn new(nodeid: u32, config: Config) -> Dlm {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Dlm {
            inner: Arc::new(DlmInner {
                nodeid,
                config: Arc::new(config),
                inbound_tx,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                registry: Arc::new(DashMap::new()),
                asts: AstQueue::new(),
                ls_count: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn nodeid(&self) -> u32 {
        self.inner.nodeid
    }

    /// Endpoint a transport delivers inbound frames into.
    pub fn inbound_sender(&self) -> InboundSender {
        self.inner.inbound_tx.clone()
    }

    /// Wires the byte-moving backend in. Must be called once before the
    /// first lockspace is opened.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .expect("outbound poisoned")
            .take()
            .expect("transport attached twice");
        self.inner
            .workers
            .lock()
            .expect("workers poisoned")
            .push(SendTask::spawn(outbound_rx, transport));
    }

    fn comms(&self) -> Comms {
        Comms::new(
            self.inner.nodeid,
            self.inner.outbound_tx.clone(),
            self.inner.inbound_tx.clone(),
        )
    }

    // Shared workers start with the first lockspace.
    fn start_workers(&self) {
        let mut workers = self.inner.workers.lock().expect("workers poisoned");
        workers.push(AstTask::spawn(self.inner.asts.clone()));
        workers.push(TimerTask::spawn(
            self.inner.registry.clone(),
            self.inner.config.clone(),
        ));
        let inbound_rx = self
            .inner
            .inbound_rx
            .lock()
            .expect("inbound poisoned")
            .take()
            .expect("inbound taken twice");
        workers.push(RecvTask::spawn(inbound_rx, self.inner.registry.clone()));
    }

    fn stop_workers(&self) {
        for handle in self
            .inner
            .workers
            .lock()
            .expect("workers poisoned")
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Opens a lockspace. `lvblen` bounds the caller-visible lock value
    /// block size (the wire always carries the full block).
    pub fn new_lockspace(
        &self,
        name: &str,
        lvblen: usize,
        flags: u32,
    ) -> Result<LockspaceHandle, Error> {
        let ls = Lockspace::new(
            name,
            lvblen,
            flags,
            self.inner.config.clone(),
            self.comms(),
            self.inner.asts.clone(),
        );
        let global_id = ls.global_id;
        if self.inner.registry.contains_key(&global_id) {
            return Err(Error::Exists);
        }
        if self.inner.ls_count.fetch_add(1, Ordering::SeqCst) == 0 {
            self.start_workers();
        }
        ls.keep_task(RecoveryTask::spawn(ls.clone()));
        ls.keep_task(ScanTask::spawn(ls.clone()));
        self.inner.registry.insert(global_id, ls.clone());
        tracing::info!(ls = %name, global_id, "new lockspace");
        Ok(LockspaceHandle { ls })
    }

    /// Closes a lockspace. `force`: 0 refuses while any lock exists, 1
    /// tolerates master copies for remote holders, 2 always releases, 3 is
    /// the emergency teardown that skips cluster coordination entirely.
    pub fn release_lockspace(&self, handle: LockspaceHandle, force: u8) -> Result<(), Error> {
        let ls = handle.ls;
        if ls.busy() > force {
            return Err(Error::Busy);
        }
        if force >= 3 {
            ls.terminate();
        }
        self.inner.registry.remove(&ls.global_id);
        ls.abort_tasks();
        ls.rsbs.clear();
        tracing::info!(ls = %ls.name, force, "release lockspace");
        if self.inner.ls_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stop_workers();
        }
        Ok(())
    }

    pub fn lockspace(&self, name: &str) -> Option<LockspaceHandle> {
        let global_id = crate::dir::name_hash(name.as_bytes());
        self.inner
            .registry
            .get(&global_id)
            .map(|entry| LockspaceHandle {
                ls: entry.value().clone(),
            })
    }
}

/// Caller-facing handle to an open lockspace.
#[derive(Clone)]
pub struct LockspaceHandle {
    ls: Arc<Lockspace>,
}

impl LockspaceHandle {
    pub fn name(&self) -> &str {
        &self.ls.name
    }

    pub fn global_id(&self) -> u32 {
        self.ls.global_id
    }

    /// Acquires a new lock on `args.name`. Returns the lock id; the
    /// outcome arrives via the completion callback.
    pub async fn request(&self, args: LockArgs) -> Result<u32, LockError> {
        let _in_recovery = self.ls.in_recovery.read().await;
        locking::request(&self.ls, args)
    }

    /// Converts a granted lock to `mode`.
    pub async fn convert(
        &self,
        lkid: u32,
        mode: Mode,
        flags: u32,
        range: Option<(u64, u64)>,
        lvb: Option<Vec<u8>>,
    ) -> Result<(), LockError> {
        let _in_recovery = self.ls.in_recovery.read().await;
        locking::convert(&self.ls, lkid, mode, flags, range, lvb)
    }

    /// Releases a granted lock. With `flags::LKF_VALBLK`, `lvb` is written
    /// to the resource on the way out.
    pub async fn unlock(
        &self,
        lkid: u32,
        flags: u32,
        lvb: Option<Vec<u8>>,
    ) -> Result<(), LockError> {
        let _in_recovery = self.ls.in_recovery.read().await;
        locking::unlock(&self.ls, lkid, flags, lvb)
    }

    /// Cancels a pending convert or wait.
    pub async fn cancel(&self, lkid: u32) -> Result<(), LockError> {
        let _in_recovery = self.ls.in_recovery.read().await;
        locking::unlock(&self.ls, lkid, flags::LKF_CANCEL, None)
    }

    // Membership events from the cluster manager.

    /// Freeze all lock operations; returns once in-flight ones drained.
    pub async fn stop(&self) {
        self.ls.stop().await;
    }

    /// New intended membership; triggers recovery.
    pub fn start(&self, event_id: u32, nodeids: Vec<u32>) {
        self.ls.start(event_id, nodeids);
    }

    /// All peers completed `start(event_id)`; resume locking.
    pub fn finish(&self, event_id: u32) {
        self.ls.finish(event_id);
    }

    /// Abort any recovery wait during cluster teardown.
    pub fn terminate(&self) {
        self.ls.terminate();
    }

    /// Watch channel carrying the id of each completed start phase; the
    /// cluster manager collects these before issuing the finish.
    pub fn start_done(&self) -> tokio::sync::watch::Receiver<u32> {
        self.ls.start_done()
    }

    /// True while the lockspace accepts lock operations.
    pub fn running(&self) -> bool {
        self.ls.running()
    }

    pub fn query_lock(&self, lkid: u32) -> Option<ResourceInfo> {
        query::query_lock(&self.ls, lkid)
    }

    pub fn query_resource(&self, name: &[u8]) -> Option<ResourceInfo> {
        query::query_resource(&self.ls, name)
    }
}

/// Decodes inbound frames and routes them to their lockspace.
struct RecvTask {
    inbound: InboundReceiver,
    registry: Arc<DashMap<u32, Arc<Lockspace>>>,
}

impl RecvTask {
    fn spawn(
        inbound: InboundReceiver,
        registry: Arc<DashMap<u32, Arc<Lockspace>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { inbound, registry }.run())
    }

    async fn run(mut self) {
        while let Some((nodeid, bytes)) = self.inbound.recv().await {
            let frame = match parse_frame(&bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    // Malformed traffic is logged and dropped, never fatal.
                    tracing::warn!(nodeid, %err, "bad frame dropped");
                    continue;
                }
            };
            let Some(ls) = self
                .registry
                .get(&frame.header.lockspace)
                .map(|entry| entry.value().clone())
            else {
                tracing::debug!(
                    nodeid,
                    lockspace = frame.header.lockspace,
                    "frame for unknown lockspace"
                );
                continue;
            };
            proto::deliver(&ls, frame.header.nodeid, frame).await;
        }
    }
}
