//! The waiters table: locks with an outstanding remote operation.
//!
//! Each entry ties an operation sent to a directory or master node to the
//! reply it expects. At most one operation per lock may be outstanding.
//! On membership change the entries aimed at departed nodes are marked and
//! later resent to the new masters (or completed synthetically, for
//! unlocks whose reply can be assumed).

use std::sync::Arc;
use std::time::Instant;

use crate::flags::{IFL_LQCONVERT, IFL_NOREBUILD, IFL_RESEND, IFL_UNLOCKDONE};
use crate::lkb::{Lkb, WaitType};
use crate::lockspace::Lockspace;
use crate::message_types::Status;

/// Enrols a lock that just sent a remote operation.
pub fn add(ls: &Arc<Lockspace>, lkb: &mut Lkb, wait_type: WaitType) {
    debug_assert!(lkb.wait_type.is_none(), "second remote op on {:#x}", lkb.id);
    lkb.wait_type = Some(wait_type);
    lkb.wait_stamp = Some(Instant::now());
    ls.waiters.lock().expect("waiters poisoned").push(lkb.id);
}

/// Clears the entry when its reply arrives (or it is abandoned).
pub fn remove(ls: &Arc<Lockspace>, lkb: &mut Lkb) -> Option<WaitType> {
    let wait_type = lkb.wait_type.take()?;
    lkb.wait_stamp = None;
    ls.waiters
        .lock()
        .expect("waiters poisoned")
        .retain(|id| *id != lkb.id);
    Some(wait_type)
}

/// Fails entries older than `timeout_secs` with a timeout status.
pub fn scan_timeouts(ls: &Arc<Lockspace>, timeout_secs: u64) {
    let overdue: Vec<u32> = {
        let waiters = ls.waiters.lock().expect("waiters poisoned");
        waiters
            .iter()
            .copied()
            .filter(|lkid| {
                ls.lkbs.get(*lkid).is_some_and(|lkb| {
                    let lkb = lkb.lock().expect("lkb poisoned");
                    lkb.wait_stamp
                        .is_some_and(|stamp| stamp.elapsed().as_secs() >= timeout_secs)
                })
            })
            .collect()
    };
    for lkid in overdue {
        tracing::info!(ls = %ls.name, lkid = format_args!("{lkid:#x}"), "operation timed out");
        crate::locking::cancel_lockop(ls, lkid, Status::TimedOut);
    }
}

/// Marks entries whose target departed, deciding per operation whether the
/// request is resent, the lock rebuilt on the new master, or the reply
/// assumed. Runs at the start of recovery, before locks are purged.
pub fn mark(ls: &Arc<Lockspace>) {
    let waiters: Vec<u32> = ls.waiters.lock().expect("waiters poisoned").clone();
    let members = ls.members.lock().expect("members poisoned");
    let mut count = 0;
    for lkid in waiters {
        let Some(lkb) = ls.lkbs.get(lkid) else {
            continue;
        };
        let mut lkb = lkb.lock().expect("lkb poisoned");
        let Some(wait_type) = lkb.wait_type else {
            continue;
        };
        tracing::debug!(
            ls = %ls.name,
            lkid = format_args!("{lkid:#x}"),
            ?wait_type,
            nodeid = ?lkb.nodeid,
            "mark waiter"
        );

        match wait_type {
            WaitType::Lookup => {
                // The directory is being rebuilt, so the lookup must be
                // redone regardless of whether the directory node survived.
                lkb.iflags |= IFL_RESEND;
                count += 1;
            }
            WaitType::Unlock | WaitType::Cancel => {
                let gone = lkb.nodeid.is_some_and(|nodeid| members.in_gone(nodeid));
                if gone {
                    lkb.iflags |= IFL_NOREBUILD;
                    if !crate::requestqueue::reply_queued(ls, lkid) {
                        // No reply will ever come; treat the op as done on
                        // the dead master.
                        lkb.iflags |= IFL_UNLOCKDONE;
                    }
                    count += 1;
                }
            }
            WaitType::Request | WaitType::Convert => {
                let gone = lkb.nodeid.is_some_and(|nodeid| members.in_gone(nodeid));
                if gone && !crate::requestqueue::reply_queued(ls, lkid) {
                    lkb.iflags |= IFL_RESEND;
                    if wait_type == WaitType::Request {
                        // The lock sits on our stale copy of the dead
                        // master's wait queue; the resent request recreates
                        // it, so the remaster pass must skip it.
                        lkb.iflags |= IFL_NOREBUILD;
                    } else {
                        // Tell the new master this lock is mid-conversion:
                        // it belongs on the granted queue at its old mode.
                        lkb.iflags |= IFL_LQCONVERT;
                    }
                    count += 1;
                }
            }
        }
    }
    tracing::info!(ls = %ls.name, count, "marked waiting requests");
}

/// Resends (or locally reprocesses) every entry marked by [`mark`].
/// Runs after recovery re-enabled locking and masters settled.
pub fn resend(ls: &Arc<Lockspace>) {
    let waiters: Vec<u32> = ls.waiters.lock().expect("waiters poisoned").clone();
    let mut count = 0;
    for lkid in waiters {
        if !ls.running() {
            tracing::debug!(ls = %ls.name, "resend interrupted");
            return;
        }
        let Some(lkb_ref) = ls.lkbs.get(lkid) else {
            continue;
        };
        let (wait_type, target, action) = {
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            let Some(wait_type) = lkb.wait_type else {
                continue;
            };
            if lkb.iflags & IFL_UNLOCKDONE != 0 {
                lkb.iflags &= !(IFL_RESEND | IFL_NOREBUILD | IFL_UNLOCKDONE | IFL_LQCONVERT);
                (wait_type, None, Action::UnlockDone)
            } else if lkb.iflags & IFL_RESEND != 0 {
                lkb.iflags &= !(IFL_RESEND | IFL_NOREBUILD | IFL_LQCONVERT);
                let target = if wait_type == WaitType::Lookup {
                    None
                } else {
                    lkb.nodeid
                };
                match target {
                    // We became the master ourselves; process locally.
                    Some(0) => (wait_type, None, Action::Local),
                    _ => (wait_type, target, Action::Resend),
                }
            } else {
                continue;
            }
        };

        count += 1;
        match action {
            Action::UnlockDone => {
                tracing::debug!(lkid = format_args!("{lkid:#x}"), "unlock assumed done");
                crate::locking::finish_assumed_unlock(ls, lkid);
            }
            Action::Local => {
                {
                    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                    remove(ls, &mut lkb);
                }
                crate::locking::process_remastered_lkb(ls, lkid, wait_type);
            }
            Action::Resend => {
                {
                    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                    lkb.wait_stamp = Some(Instant::now());
                }
                crate::proto::send_remote_op(ls, lkid, wait_type, target);
            }
        }
    }
    tracing::info!(ls = %ls.name, count, "resent marked requests");
}

enum Action {
    UnlockDone,
    Local,
    Resend,
}
