//! Notification dispatch.
//!
//! One worker per node drains a FIFO of locks with pending notifications
//! and fires their callbacks, so callback code never runs under a resource
//! lock and completions for one lock stay in order. Recovery can briefly
//! take the dispatch gate to drain the worker before touching lock state.
//!
//! The worker's sibling timer scans parked remote operations for timeouts
//! and queued conversions for conversion deadlocks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::flags::{AST_BAST, AST_COMP, AST_DEL, IFL_VALBLK};
use crate::lkb::LkbState;
use crate::lockspace::{Lockspace, LSFL_NOTIMERS};
use crate::message_types::{Command, LockMessage, LockStatus, Status};
use crate::mode::Mode;

/// Shared FIFO of `(lockspace, lkid)` entries with pending notifications.
pub struct AstQueue {
    queue: Mutex<VecDeque<(Arc<Lockspace>, u32)>>,
    /// Entries for stopped lockspaces wait here until locking resumes.
    deferred: Mutex<Vec<(Arc<Lockspace>, u32)>>,
    notify: Notify,
    /// Held by the worker around each delivery; recovery takes it to drain.
    gate: tokio::sync::Mutex<()>,
}

impl AstQueue {
    pub fn new() -> Arc<AstQueue> {
        Arc::new(AstQueue {
            queue: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(Vec::new()),
            notify: Notify::new(),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    fn push(&self, ls: Arc<Lockspace>, lkid: u32) {
        self.queue.lock().expect("ast queue poisoned").push_back((ls, lkid));
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<(Arc<Lockspace>, u32)> {
        self.queue.lock().expect("ast queue poisoned").pop_front()
    }

    /// Waits until the worker is between deliveries, then lets it continue.
    /// Used by recovery as a drain barrier.
    pub async fn drain_barrier(&self) {
        drop(self.gate.lock().await);
    }

    /// Re-arms deferred entries, typically after locking was re-enabled.
    pub fn kick(&self) {
        let mut deferred = self.deferred.lock().expect("ast deferred poisoned");
        if deferred.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().expect("ast queue poisoned");
        for entry in deferred.drain(..) {
            queue.push_back(entry);
        }
        drop(queue);
        self.notify.notify_one();
    }
}

/// Records a pending notification on `lkb` and schedules delivery.
///
/// For master copies the notification belongs to a remote node, so a
/// message goes out instead: a `Bast`, or a `Grant` carrying the error
/// result for out-of-band completions (a conversion-deadlock victim).
pub fn queue_ast(ls: &Arc<Lockspace>, lkb: &mut crate::lkb::Lkb, bits: u8, bastmode: Mode) {
    if lkb.is_mstcpy() {
        if bits & AST_BAST != 0 {
            let msg = LockMessage {
                remid: lkb.remid,
                lkid: lkb.id,
                bastmode: bastmode.as_i8(),
                ..Default::default()
            };
            if let Some(nodeid) = lkb.nodeid {
                ls.send_lock(nodeid, Command::Bast, msg);
            }
        } else if lkb.retstatus != Status::Ok {
            // Out-of-band error completion for a remote holder.
            let msg = LockMessage {
                remid: lkb.remid,
                lkid: lkb.id,
                result: lkb.retstatus.as_i32(),
                status: lkb.state.map_or(0, LkbState::as_u8),
                ..Default::default()
            };
            if let Some(nodeid) = lkb.nodeid {
                ls.send_lock(nodeid, Command::Grant, msg);
            }
        }
        return;
    }

    if bits & AST_BAST != 0 {
        lkb.bastmode = bastmode;
    }
    let already_queued = lkb.ast_pending & (AST_COMP | AST_BAST) != 0;
    lkb.ast_pending |= bits;
    if !already_queued {
        ls.asts.push(ls.clone(), lkb.id);
    }
}

/// The dispatcher worker.
pub struct AstTask {
    asts: Arc<AstQueue>,
}

impl AstTask {
    pub fn spawn(asts: Arc<AstQueue>) -> JoinHandle<()> {
        tokio::spawn(Self { asts }.run())
    }

    async fn run(self) {
        loop {
            let Some((ls, lkid)) = self.asts.pop() else {
                self.asts.notify.notified().await;
                continue;
            };
            let _gate = self.asts.gate.lock().await;
            self.deliver(&ls, lkid);
        }
    }

    fn deliver(&self, ls: &Arc<Lockspace>, lkid: u32) {
        // Recovery owns the lock state of a stopped lockspace; park the
        // entry until locking is re-enabled.
        if !ls.running() {
            ls.asts
                .deferred
                .lock()
                .expect("ast deferred poisoned")
                .push((ls.clone(), lkid));
            return;
        }
        let Some(lkb) = ls.lkbs.get(lkid) else {
            return;
        };
        let (bits, comp, bast, status, bastmode, delete) = {
            let mut lkb = lkb.lock().expect("lkb poisoned");
            let bits = lkb.ast_pending;
            lkb.ast_pending = 0;
            let status = LockStatus {
                lkid,
                status: lkb.retstatus,
                flags: lkb.sbflags,
                lvb: if lkb.iflags & IFL_VALBLK != 0 {
                    lkb.lvb.clone()
                } else {
                    None
                },
            };
            let obviated = lkb.state != Some(LkbState::Granted)
                || lkb.wait_type.is_some()
                || lkb.grmode.compat(lkb.bastmode);
            let bast = if obviated { None } else { lkb.bast.clone() };
            (
                bits,
                lkb.ast.clone(),
                bast,
                status,
                lkb.bastmode,
                bits & AST_DEL != 0,
            )
        };

        if bits & AST_COMP != 0 {
            if let Some(comp) = comp {
                comp(&status);
            }
        }
        if bits & AST_BAST != 0 && !delete {
            if let Some(bast) = bast {
                bast(lkid, bastmode);
            }
        }
        if delete {
            let resource = {
                let mut lkb = lkb.lock().expect("lkb poisoned");
                lkb.resource.take()
            };
            ls.lkbs.remove(lkid);
            if let Some(rsb) = resource {
                ls.rsbs.release(&rsb);
            }
        }
    }
}

/// Periodic scan for overdue waiters and conversion deadlocks; also ages
/// unused resources off the toss lists.
pub struct TimerTask {
    registry: Arc<DashMap<u32, Arc<Lockspace>>>,
    config: Arc<Config>,
}

impl TimerTask {
    pub fn spawn(registry: Arc<DashMap<u32, Arc<Lockspace>>>, config: Arc<Config>) -> JoinHandle<()> {
        tokio::spawn(Self { registry, config }.run())
    }

    async fn run(self) {
        let period = if self.config.lock_timeout_secs > 0 {
            (self.config.lock_timeout_secs / 2).max(1)
        } else {
            self.config.scan_secs.max(1)
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for entry in self.registry.iter() {
                let ls = entry.value().clone();
                if !ls.running() || ls.test_flag(LSFL_NOTIMERS) {
                    continue;
                }
                if self.config.lock_timeout_secs > 0 {
                    crate::waiters::scan_timeouts(&ls, self.config.lock_timeout_secs);
                }
                if self.config.deadlock_secs > 0 {
                    crate::locking::scan_deadlocks(&ls, self.config.deadlock_secs);
                }
            }
        }
    }
}

/// Ages unused resources out of a lockspace.
pub struct ScanTask {
    ls: Arc<Lockspace>,
}

impl ScanTask {
    pub fn spawn(ls: Arc<Lockspace>) -> JoinHandle<()> {
        tokio::spawn(Self { ls }.run())
    }

    async fn run(self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.ls.config.scan_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.ls.running() {
                continue;
            }
            let freed = self.ls.rsbs.scan(self.ls.config.toss_secs);
            if freed.is_empty() {
                continue;
            }
            tracing::debug!(ls = %self.ls.name, freed = freed.len(), "reclaimed unused resources");
            // Retire the directory record of every resource we mastered.
            let ls = &self.ls;
            let us = ls.our_nodeid();
            for rsb in freed {
                if !rsb.body().master.is_local() {
                    continue;
                }
                let dir_node = {
                    let members = ls.members.lock().expect("members poisoned");
                    crate::dir::dir_nodeid(&rsb.name, members.nodes())
                };
                if dir_node == us {
                    ls.dir.remove(&rsb.name, us);
                } else if ls.running() {
                    let msg = LockMessage {
                        name: rsb.name.clone(),
                        ..Default::default()
                    };
                    ls.send_lock(dir_node, Command::Remove, msg);
                } else {
                    crate::rcom::send_async(
                        ls,
                        dir_node,
                        crate::message_types::RecoverCmd::Remove,
                        rsb.name.clone(),
                    );
                }
            }
        }
    }
}
