//! Recovery building blocks: peer status rounds, lock purging, master
//! reassignment and LVB revalidation.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::dir::{dir_nodeid, unpack_names_page, PageEnd};
use crate::flags::{IFL_VALBLK, LKF_PERSISTENT, RSF_MASTER, RSF_NEW_MASTER, RSF_VALNOTVALID};
use crate::lkb::LkbState;
use crate::lockspace::{Lockspace, LSFL_DIR_VALID};
use crate::message_types::RecoverCmd;
use crate::mode::Mode;
use crate::rcom;
use crate::rsb::{lkb_dequeue, MasterState, Rsb, RsbBody};

// Peer status bits exchanged in `RecoverCmd::Status` rounds.
pub const STS_NODES_VALID: u8 = 0x01;
pub const STS_ALL_NODES_VALID: u8 = 0x02;
pub const STS_DIR_VALID: u8 = 0x04;
pub const STS_ALL_DIR_VALID: u8 = 0x08;

/// Waits until `done` holds or the recovery is interrupted by a new stop.
/// Peers wake us through `wait_notify`; a timer re-checks in between.
pub async fn wait_function(ls: &Arc<Lockspace>, done: impl Fn() -> bool) -> Result<(), ()> {
    let period = Duration::from_secs(ls.config.recover_timer_secs.max(1));
    loop {
        let notified = ls.wait_notify.notified();
        if done() {
            return Ok(());
        }
        if ls.recovery_stopped() {
            return Err(());
        }
        let _ = tokio::time::timeout(period, notified).await;
    }
}

/// Polls every member until each reports all of `wait_bits`.
pub async fn wait_status_all(ls: &Arc<Lockspace>, wait_bits: u8) -> Result<(), ()> {
    let members = ls.members.lock().expect("members poisoned").nodes().to_vec();
    for nodeid in members {
        loop {
            if ls.recovery_stopped() {
                return Err(());
            }
            let reply = rcom::send_and_wait(ls, nodeid, RecoverCmd::Status, Vec::new()).await?;
            if reply.first().copied().unwrap_or(0) & wait_bits == wait_bits {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    Ok(())
}

/// Polls the low node until it reports all of `wait_bits`.
pub async fn wait_status_low(ls: &Arc<Lockspace>, wait_bits: u8) -> Result<(), ()> {
    let low = ls
        .members
        .lock()
        .expect("members poisoned")
        .low_nodeid()
        .ok_or(())?;
    loop {
        if ls.recovery_stopped() {
            return Err(());
        }
        let reply = rcom::send_and_wait(ls, low, RecoverCmd::Status, Vec::new()).await?;
        if reply.first().copied().unwrap_or(0) & wait_bits == wait_bits {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

/// Rebuilds our share of the directory by paging `{master, name}` records
/// from every member (ourselves included).
pub async fn rebuild_directory(ls: &Arc<Lockspace>) -> Result<(), ()> {
    tracing::info!(ls = %ls.name, "rebuild resource directory");
    ls.dir.clear();
    let members = ls.members.lock().expect("members poisoned").nodes().to_vec();
    let mut count = 0;
    for nodeid in members {
        let mut last_name: Vec<u8> = Vec::new();
        loop {
            if ls.recovery_stopped() {
                return Err(());
            }
            let reply =
                rcom::send_and_wait(ls, nodeid, RecoverCmd::Names, last_name.clone()).await?;
            let (records, end) = unpack_names_page(nodeid, &reply);
            if let Some((_, name)) = records.last() {
                last_name = name.clone();
            } else if end == PageEnd::Block {
                // A block that carried nothing will never make progress.
                tracing::warn!(ls = %ls.name, nodeid, "empty names block");
                break;
            }
            for (master, name) in records {
                ls.dir.insert(&name, master);
                count += 1;
            }
            if end == PageEnd::List {
                break;
            }
        }
    }
    ls.set_flag(LSFL_DIR_VALID);
    tracing::info!(ls = %ls.name, count, "rebuilt directory entries");
    Ok(())
}

fn purge_queue(ls: &Arc<Lockspace>, rsb: &Arc<Rsb>, body: &mut RsbBody, state: LkbState) -> (usize, usize) {
    let mut purged = 0;
    let mut orphaned = 0;
    let members = ls.members.lock().expect("members poisoned");
    for lkid in body.queue(state).clone() {
        let Some(lkb_ref) = ls.lkbs.get(lkid) else {
            continue;
        };
        let gone = {
            let lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.is_mstcpy() && lkb.nodeid.is_some_and(|nodeid| members.in_gone(nodeid))
        };
        if !gone {
            continue;
        }
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if lkb.exflags & LKF_PERSISTENT != 0 {
            // Persistent locks survive process death but not node death;
            // they are only counted apart so operators can tell.
            orphaned += 1;
        }
        lkb_dequeue(body, &mut lkb);
        if lkb.due_stamp.take().is_some() {
            ls.deadlockq
                .lock()
                .expect("deadlockq poisoned")
                .retain(|id| *id != lkid);
        }
        lkb.resource = None;
        drop(lkb);
        ls.lkbs.remove(lkid);
        ls.rsbs.release(rsb);
        purged += 1;
    }
    (purged, orphaned)
}

/// Drops master copies held for departed nodes.
pub fn purge_locks(ls: &Arc<Lockspace>) {
    let mut purged = 0;
    let mut orphaned = 0;
    for rsb in ls.rsbs.snapshot() {
        let mut body = rsb.body();
        if !body.master.is_local() {
            continue;
        }
        for state in [LkbState::Granted, LkbState::Convert, LkbState::Waiting] {
            let (p, o) = purge_queue(ls, &rsb, &mut body, state);
            purged += p;
            orphaned += o;
        }
    }
    tracing::info!(ls = %ls.name, purged, orphaned, "purged locks of departed nodes");
}

/// Installs the new master on a resource and its locks.
pub fn set_new_master(ls: &Arc<Lockspace>, rsb: &Arc<Rsb>, master: u32) {
    let us = ls.our_nodeid();
    let state = MasterState::from_lookup(master, us);
    let mut body = rsb.body();
    body.master = state;
    if state.is_local() {
        body.flags |= RSF_MASTER;
    } else {
        body.flags &= !RSF_MASTER;
    }
    body.flags |= RSF_NEW_MASTER;
    for queue_state in [LkbState::Granted, LkbState::Convert, LkbState::Waiting] {
        for lkid in body.queue(queue_state).clone() {
            let Some(lkb_ref) = ls.lkbs.get(lkid) else {
                continue;
            };
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            if !lkb.is_mstcpy() {
                lkb.nodeid = state.lock_nodeid();
            }
        }
    }
}

/// Asks the directory for the new master of every resource whose master
/// departed. Local directory answers apply immediately; remote ones are
/// collected by [`master_reply`] until the in-flight set drains.
pub async fn update_masters(ls: &Arc<Lockspace>) -> Result<(), ()> {
    let us = ls.our_nodeid();
    let mut count = 0;
    for rsb in ls.rsbs.snapshot() {
        if ls.recovery_stopped() {
            return Err(());
        }
        let needs_update = {
            let body = rsb.body();
            match body.master {
                MasterState::Remote(nodeid) => {
                    ls.members.lock().expect("members poisoned").in_gone(nodeid)
                }
                _ => false,
            }
        };
        if !needs_update {
            continue;
        }
        count += 1;
        let members = ls.members.lock().expect("members poisoned").nodes().to_vec();
        let dir_node = dir_nodeid(&rsb.name, &members);
        if dir_node == us {
            let master = ls.dir.lookup(&rsb.name, us);
            set_new_master(ls, &rsb, master);
        } else {
            let msgid = rcom::alloc_msgid(ls);
            ls.recover_list
                .lock()
                .expect("recover_list poisoned")
                .insert(msgid, rsb.name.clone());
            rcom::send_async_msgid(ls, dir_node, RecoverCmd::NewMaster, rsb.name.clone(), msgid);
        }
    }

    let result = wait_function(ls, || {
        ls.recover_list
            .lock()
            .expect("recover_list poisoned")
            .is_empty()
    })
    .await;
    tracing::info!(ls = %ls.name, count, "updated remastered resources");
    result
}

/// Routes an asynchronous `NewMaster` answer back to its resource.
pub fn master_reply(ls: &Arc<Lockspace>, msgid: u32, data: &[u8]) {
    let name = ls
        .recover_list
        .lock()
        .expect("recover_list poisoned")
        .remove(&msgid);
    let Some(name) = name else {
        tracing::debug!(ls = %ls.name, msgid, "master reply without matching lookup");
        return;
    };
    if data.len() < 4 {
        return;
    }
    let master = LittleEndian::read_u32(&data[0..4]);
    if let Some(rsb) = ls.rsbs.get(&name) {
        set_new_master(ls, &rsb, master);
    }
    if ls
        .recover_list
        .lock()
        .expect("recover_list poisoned")
        .is_empty()
    {
        ls.wait_notify.notify_waiters();
    }
}

/// LVB revalidation for one resource. Called whenever recovery changes a
/// resource's holder set.
///
/// A holder above CR proves the LVB content; its copy wins (ties broken by
/// the highest sequence). Only NL/CR holders left means nobody is known to
/// have written since the crash: zero the block and flag it not-valid.
pub fn lvb_recover_body(ls: &Lockspace, body: &mut RsbBody) {
    let mut best: Option<(Mode, u32, Vec<u8>)> = None;
    let mut lvb_holder_exists = false;
    for state in [LkbState::Granted, LkbState::Convert] {
        for lkid in body.queue(state) {
            let Some(lkb_ref) = ls.lkbs.get(*lkid) else {
                continue;
            };
            let lkb = lkb_ref.lock().expect("lkb poisoned");
            if lkb.iflags & IFL_VALBLK == 0 {
                continue;
            }
            lvb_holder_exists = true;
            if lkb.grmode > Mode::Cr {
                let better = match &best {
                    None => true,
                    Some((mode, seq, _)) => {
                        lkb.grmode > *mode || (lkb.grmode == *mode && lkb.lvbseq > *seq)
                    }
                };
                if better {
                    if let Some(lvb) = lkb.lvb.as_ref() {
                        best = Some((lkb.grmode, lkb.lvbseq, lvb.clone()));
                    }
                }
            }
        }
    }

    match best {
        Some((_, seq, lvb)) => {
            body.lvb = Some(lvb);
            body.lvbseq = seq;
            body.flags &= !RSF_VALNOTVALID;
        }
        None if lvb_holder_exists => {
            body.lvb = Some(vec![0; ls.lvblen]);
            body.flags |= RSF_VALNOTVALID;
        }
        None => {
            if body.lvb.is_some() {
                body.flags |= RSF_VALNOTVALID;
            }
        }
    }
}

/// LVB revalidation across every resource we master.
pub fn recover_lvbs(ls: &Arc<Lockspace>) {
    for rsb in ls.rsbs.snapshot() {
        let mut body = rsb.body();
        if body.master.is_local() {
            lvb_recover_body(ls, &mut body);
        }
    }
}

/// Grants whatever became grantable after the purge, and clears the
/// per-epoch recovery flags.
pub fn grant_after_purge(ls: &Arc<Lockspace>) {
    for rsb in ls.rsbs.snapshot() {
        if !ls.running() {
            tracing::debug!(ls = %ls.name, "grant after purge aborted");
            return;
        }
        let mut body = rsb.body();
        body.flags &= !RSF_NEW_MASTER;
        if body.master.is_local() {
            crate::locking::grant_pending(ls, &mut body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsb::lkb_enqueue;
    use crate::testutil::standalone_lockspace;

    fn add_holder(
        ls: &Arc<Lockspace>,
        rsb: &Arc<Rsb>,
        grmode: Mode,
        lvb: Option<Vec<u8>>,
        lvbseq: u32,
    ) -> u32 {
        let (lkid, lkb_ref) = ls.lkbs.create();
        let mut lkb = lkb_ref.lock().unwrap();
        lkb.grmode = grmode;
        if let Some(lvb) = lvb {
            lkb.iflags |= IFL_VALBLK;
            lkb.lvb = Some(lvb);
            lkb.lvbseq = lvbseq;
        }
        let mut body = rsb.body();
        lkb_enqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
        drop(lkb);
        lkid
    }

    #[tokio::test]
    async fn writer_lvb_wins() {
        let ls = standalone_lockspace(1).await;
        let rsb = ls.rsbs.find_or_create(b"r", true).unwrap();
        rsb.body().master = MasterState::Local;
        add_holder(&ls, &rsb, Mode::Cr, Some(vec![1; ls.lvblen]), 3);
        add_holder(&ls, &rsb, Mode::Pw, Some(vec![9; ls.lvblen]), 2);
        let mut body = rsb.body();
        lvb_recover_body(&ls, &mut body);
        assert_eq!(body.lvb.as_deref(), Some(&vec![9; ls.lvblen][..]));
        assert_eq!(body.flags & RSF_VALNOTVALID, 0);
    }

    #[tokio::test]
    async fn readers_only_invalidate() {
        let ls = standalone_lockspace(1).await;
        let rsb = ls.rsbs.find_or_create(b"r", true).unwrap();
        rsb.body().master = MasterState::Local;
        add_holder(&ls, &rsb, Mode::Nl, Some(vec![7; ls.lvblen]), 1);
        let mut body = rsb.body();
        lvb_recover_body(&ls, &mut body);
        assert_eq!(body.lvb.as_deref(), Some(&vec![0; ls.lvblen][..]));
        assert_ne!(body.flags & RSF_VALNOTVALID, 0);
    }
}
