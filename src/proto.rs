//! The master-copy protocol: every message that moves lock state between a
//! process-copy node and the master node of a resource.
//!
//! Outbound operations are recorded in the waiters table before they leave;
//! inbound messages are processed here and matched back to their waiter on
//! reply. Messages arriving while the lockspace is stopped are parked on
//! the request queue (recovery traffic bypasses it).

use std::sync::Arc;

use crate::ast_task::queue_ast;
use crate::dir::dir_nodeid;
use crate::flags::*;
use crate::lkb::{Lkb, LkbState, WaitType};
use crate::lockspace::Lockspace;
use crate::message_types::{Command, Frame, LockMessage, Status, Body};
use crate::mode::Mode;
use crate::rsb::{lkb_dequeue, lkb_enqueue, lkb_swqueue, MasterState, RsbBody};
use crate::waiters;

/// Builds and sends the message for an outbound remote operation. The
/// waiters entry must already exist. `target` overrides the destination
/// (used by recovery resends; `None` derives it from the lock).
pub fn send_remote_op(ls: &Arc<Lockspace>, lkid: u32, wait_type: WaitType, target: Option<u32>) {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return;
    };
    let (msg, name, nodeid) = {
        let lkb = lkb_ref.lock().expect("lkb poisoned");
        let Some(rsb) = lkb.resource.clone() else {
            return;
        };
        let mut msg = LockMessage {
            lkid,
            remid: lkb.remid,
            exflags: lkb.exflags,
            rqmode: lkb.rqmode.as_i8(),
            grmode: lkb.grmode.as_i8(),
            ..Default::default()
        };
        if lkb.ast.is_some() {
            msg.asts |= AST_COMP;
        }
        if lkb.bast.is_some() {
            msg.asts |= AST_BAST;
        }
        if let Some(range) = lkb.range {
            msg.iflags |= IFL_RANGE;
            msg.range = [
                range[crate::lkb::RQ_RANGE_START],
                range[crate::lkb::RQ_RANGE_END],
            ];
        }
        if lkb.iflags & IFL_VALBLK != 0 {
            msg.iflags |= IFL_VALBLK;
            if let Some(lvb) = lkb.lvb.as_ref() {
                msg.lvb = ls.lvb_to_wire(lvb);
            }
            msg.lvbseq = lkb.lvbseq;
        }
        (msg, rsb.name.clone(), lkb.nodeid)
    };

    let (cmd, dest, msg) = match wait_type {
        WaitType::Lookup => {
            let members = ls.members.lock().expect("members poisoned");
            let dir_node = dir_nodeid(&name, members.nodes());
            drop(members);
            let mut msg = msg;
            msg.name = name;
            (Command::Lookup, dir_node, msg)
        }
        WaitType::Request => {
            let mut msg = msg;
            msg.name = name;
            (Command::Request, target.or(nodeid).unwrap_or(0), msg)
        }
        WaitType::Convert => (Command::Convert, target.or(nodeid).unwrap_or(0), msg),
        WaitType::Unlock => (Command::Unlock, target.or(nodeid).unwrap_or(0), msg),
        WaitType::Cancel => (Command::Cancel, target.or(nodeid).unwrap_or(0), msg),
    };

    if dest == 0 || dest == ls.our_nodeid() {
        // Recovery is reassigning masters; the resend pass will route this
        // operation locally once mastery settles.
        tracing::debug!(ls = %ls.name, lkid = format_args!("{lkid:#x}"), "send deferred, no target");
        return;
    }
    tracing::debug!(
        ls = %ls.name,
        lkid = format_args!("{lkid:#x}"),
        ?cmd,
        dest,
        "send remote op"
    );
    ls.send_lock(dest, cmd, msg);
}

/// Out-of-band grant of a master copy (the holder's node is told its lock
/// is granted, LVB and demotion state included).
pub(crate) fn send_grant(ls: &Arc<Lockspace>, body: &RsbBody, lkb: &Lkb) {
    let Some(nodeid) = lkb.nodeid else {
        return;
    };
    let mut msg = LockMessage {
        remid: lkb.remid,
        lkid: lkb.id,
        grmode: lkb.grmode.as_i8(),
        sbflags: lkb.sbflags,
        result: 0,
        ..Default::default()
    };
    if lkb.iflags & IFL_DEMOTED != 0 {
        msg.iflags |= IFL_DEMOTED;
    }
    if lkb.iflags & IFL_VALBLK != 0 {
        if let Some(lvb) = lkb.lvb.as_ref() {
            msg.lvb = ls.lvb_to_wire(lvb);
        }
        msg.lvbseq = body.lvbseq;
    }
    ls.send_lock(nodeid, Command::Grant, msg);
}

fn reply_for(wait: Command) -> Command {
    match wait {
        Command::Request => Command::RequestReply,
        Command::Convert => Command::ConvertReply,
        Command::Unlock => Command::UnlockReply,
        _ => Command::CancelReply,
    }
}

/// Sends the reply for an inbound op, folding in the lock's current state.
fn send_op_reply(ls: &Arc<Lockspace>, nodeid: u32, op: Command, lkb: &Lkb) {
    let mut msg = LockMessage {
        remid: lkb.remid,
        lkid: lkb.id,
        result: lkb.retstatus.as_i32(),
        status: lkb.state.map_or(0, LkbState::as_u8),
        grmode: lkb.grmode.as_i8(),
        sbflags: lkb.sbflags,
        ..Default::default()
    };
    if lkb.iflags & IFL_VALBLK != 0 {
        if let Some(lvb) = lkb.lvb.as_ref() {
            msg.lvb = ls.lvb_to_wire(lvb);
        }
        msg.lvbseq = lkb.lvbseq;
    }
    ls.send_lock(nodeid, reply_for(op), msg);
}

/// Entry point for one decoded frame. Recovery commands bypass the stopped
/// check; everything else parks on the request queue while recovery runs.
pub async fn deliver(ls: &Arc<Lockspace>, nodeid: u32, frame: Frame) {
    match frame.header.cmd {
        Command::Recover | Command::RecoverReply => {
            crate::rcom::process_message(ls, nodeid, frame);
            return;
        }
        _ => {}
    }

    if nodeid != ls.our_nodeid() && !ls.members.lock().expect("members poisoned").contains(nodeid) {
        tracing::debug!(ls = %ls.name, nodeid, "message from non-member dropped");
        return;
    }

    loop {
        if !ls.running() || crate::requestqueue::draining(ls) {
            crate::requestqueue::add(ls, nodeid, frame);
            return;
        }
        // Taken to hold recovery off until this message is done; contended
        // only when a stop is in flight.
        match ls.in_recovery.clone().try_read_owned() {
            Ok(_guard) => {
                process_message(ls, nodeid, frame, false);
                return;
            }
            Err(_) => tokio::task::yield_now().await,
        }
    }
}

/// Processes one message. `replay` is set when draining the request queue
/// after recovery.
pub fn process_message(ls: &Arc<Lockspace>, nodeid: u32, frame: Frame, replay: bool) {
    let cmd = frame.header.cmd;
    let Body::Lock(msg) = frame.body else {
        return;
    };
    if !replay && !ls.running() {
        crate::requestqueue::add(
            ls,
            nodeid,
            Frame {
                header: frame.header,
                body: Body::Lock(msg),
            },
        );
        return;
    }

    match cmd {
        Command::Request => receive_request(ls, nodeid, msg),
        Command::Convert => receive_convert(ls, nodeid, msg),
        Command::Unlock | Command::Cancel => receive_unlock(ls, nodeid, cmd, msg),
        Command::RequestReply | Command::ConvertReply | Command::UnlockReply
        | Command::CancelReply => receive_op_reply(ls, nodeid, cmd, msg),
        Command::Grant => receive_grant(ls, nodeid, msg),
        Command::Bast => receive_bast(ls, nodeid, msg),
        Command::Lookup => receive_lookup(ls, nodeid, msg),
        Command::LookupReply => receive_lookup_reply(ls, nodeid, msg),
        Command::Remove => ls.dir.remove(&msg.name, nodeid),
        Command::Recover | Command::RecoverReply => unreachable!("routed in deliver"),
    }
}

/// Master side of a new-lock request: build the master copy and try to
/// grant it.
fn receive_request(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let Some(rqmode) = Mode::from_i8(msg.rqmode) else {
        tracing::warn!(ls = %ls.name, nodeid, "request with bad mode dropped");
        return;
    };

    let (lkid, lkb_ref) = ls.lkbs.create();
    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.grmode = Mode::Iv;
        lkb.rqmode = rqmode;
        lkb.nodeid = Some(nodeid);
        lkb.remid = msg.lkid;
        lkb.iflags = IFL_MSTCPY;
        lkb.exflags = msg.exflags;
        lkb.remote_asts = msg.asts;
        if msg.exflags & LKF_VALBLK != 0 {
            lkb.iflags |= IFL_VALBLK;
            lkb.lvb = Some(ls.lvb_from_wire(&msg.lvb));
            lkb.lvbseq = msg.lvbseq;
        }
        if msg.iflags & IFL_RANGE != 0 {
            lkb.set_range(msg.range[0], msg.range[1]);
        }
    }

    let rsb = ls
        .rsbs
        .find_or_create(&msg.name, true)
        .expect("create requested");
    {
        let mut body = rsb.body();
        match body.master {
            MasterState::Unknown => {
                // First lock on a resource the directory just assigned us.
                body.master = MasterState::Local;
                body.flags |= RSF_MASTER;
            }
            MasterState::Local => {}
            MasterState::Remote(master) => {
                // The requester chased a stale directory answer.
                drop(body);
                tracing::debug!(ls = %ls.name, nodeid, master, "request for unmastered resource");
                let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                lkb.retstatus = Status::Invalid;
                send_op_reply(ls, nodeid, Command::Request, &lkb);
                drop(lkb);
                ls.lkbs.remove(lkid);
                ls.rsbs.release(&rsb);
                return;
            }
        }
    }

    let released = {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.resource = Some(rsb.clone());
        lkb.reply_pending = true;
        crate::locking::lock_stage3(ls, &mut body, &mut lkb);
        lkb.reply_pending = false;
        send_op_reply(ls, nodeid, Command::Request, &lkb);
        // A try-lock that failed has no further use on the master.
        lkb.retstatus == Status::TryFailed
    };
    if released {
        ls.lkbs.remove(lkid);
        ls.rsbs.release(&rsb);
    }
}

/// Master side of a conversion of an existing master copy.
fn receive_convert(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::warn!(ls = %ls.name, nodeid, remid = msg.remid, "convert for unknown lock");
        return;
    };
    let Some(rqmode) = Mode::from_i8(msg.rqmode) else {
        return;
    };
    let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
        return;
    };

    let mut body = rsb.body();
    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
    if !lkb.is_mstcpy() || lkb.state != Some(LkbState::Granted) {
        tracing::warn!(ls = %ls.name, nodeid, remid = msg.remid, "convert in bad state");
        lkb.retstatus = Status::Invalid;
        send_op_reply(ls, nodeid, Command::Convert, &lkb);
        return;
    }
    lkb.rqmode = rqmode;
    lkb.exflags = msg.exflags;
    lkb.iflags &= !IFL_DEMOTED;
    lkb.sbflags = 0;
    if msg.exflags & LKF_VALBLK != 0 {
        lkb.iflags |= IFL_VALBLK;
        lkb.lvb = Some(ls.lvb_from_wire(&msg.lvb));
        lkb.lvbseq = msg.lvbseq;
    }
    if msg.iflags & IFL_RANGE != 0 {
        lkb.set_range(msg.range[0], msg.range[1]);
    }

    lkb.reply_pending = true;
    crate::locking::convert_stage2(ls, &mut body, &mut lkb, false);
    lkb.reply_pending = false;
    send_op_reply(ls, nodeid, Command::Convert, &lkb);
}

/// Master side of unlock/cancel of a master copy.
fn receive_unlock(ls: &Arc<Lockspace>, nodeid: u32, cmd: Command, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::warn!(ls = %ls.name, nodeid, remid = msg.remid, "unlock for unknown lock");
        return;
    };
    let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
        return;
    };
    let mut flags = msg.exflags;
    if cmd == Command::Cancel {
        flags |= LKF_CANCEL;
    }

    let freed = {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if msg.exflags & LKF_VALBLK != 0 {
            lkb.lvb = Some(ls.lvb_from_wire(&msg.lvb));
        }
        crate::locking::unlock_stage2(ls, &mut body, &mut lkb, flags);
        send_op_reply(ls, nodeid, cmd, &lkb);
        // Freed when the unlock actually dequeued it for good.
        lkb.state.is_none()
    };
    if freed {
        ls.lkbs.remove(msg.remid);
        ls.rsbs.release(&rsb);
    }
}

/// Process-copy side: a reply to one of our four outbound operations.
fn receive_op_reply(ls: &Arc<Lockspace>, nodeid: u32, cmd: Command, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::debug!(ls = %ls.name, nodeid, remid = msg.remid, "reply for unknown lock");
        return;
    };
    let wait_type = {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if lkb.is_mstcpy() {
            tracing::warn!(ls = %ls.name, nodeid, "op reply for master copy dropped");
            return;
        }
        let expected = match lkb.wait_type {
            Some(WaitType::Request) => cmd == Command::RequestReply,
            Some(WaitType::Convert) => cmd == Command::ConvertReply,
            Some(WaitType::Unlock) => cmd == Command::UnlockReply,
            Some(WaitType::Cancel) => cmd == Command::CancelReply,
            _ => false,
        };
        if !expected {
            tracing::debug!(ls = %ls.name, nodeid, ?cmd, "unexpected reply dropped");
            return;
        }
        waiters::remove(ls, &mut lkb).expect("waiter checked")
    };

    let result = Status::from_i32(msg.result).unwrap_or(Status::Invalid);

    match wait_type {
        WaitType::Request | WaitType::Convert => {
            receive_grant_or_queue_reply(ls, nodeid, &lkb_ref, wait_type, msg, result)
        }
        WaitType::Unlock | WaitType::Cancel => {
            let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
                return;
            };
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            let old_state = lkb_dequeue(&mut body, &mut lkb);
            if wait_type == WaitType::Cancel && old_state == Some(LkbState::Convert) {
                // The master cancelled our conversion; we keep the lock at
                // its granted mode.
                lkb.rqmode = Mode::Iv;
                lkb_enqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
                lkb.retstatus = Status::Cancelled;
                queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
            } else if wait_type == WaitType::Cancel && result == Status::Invalid {
                // Cancel raced with a grant; the lock stands as it was.
                if let Some(old_state) = old_state {
                    lkb_enqueue(&mut body, &ls.lkbs, &mut lkb, old_state);
                }
                lkb.retstatus = Status::Invalid;
                queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
            } else {
                lkb.retstatus = if wait_type == WaitType::Cancel {
                    Status::Cancelled
                } else {
                    Status::Unlocked
                };
                queue_ast(ls, &mut lkb, AST_COMP | AST_DEL, Mode::Iv);
            }
        }
        WaitType::Lookup => unreachable!("lookup replies use LookupReply"),
    }
}

/// Request/convert reply handling: the master granted, queued or refused.
fn receive_grant_or_queue_reply(
    ls: &Arc<Lockspace>,
    nodeid: u32,
    lkb_ref: &crate::lkb::LkbRef,
    wait_type: WaitType,
    msg: LockMessage,
    result: Status,
) {
    let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
        return;
    };

    if result == Status::Invalid {
        // Wrong master: the directory answer went stale across a recovery.
        // Forget the cached master and redo the lookup from scratch.
        tracing::debug!(ls = %ls.name, nodeid, "wrong-master reply, redoing lookup");
        {
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb_dequeue(&mut body, &mut lkb);
            body.master = MasterState::Unknown;
            lkb.nodeid = None;
        }
        let name = rsb.name.clone();
        if crate::locking::lock_stage1(ls, lkb_ref, &name).is_err() {
            crate::locking::cancel_lockop(ls, lkb_id(lkb_ref), Status::Invalid);
        }
        return;
    }

    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if lkb.remid == 0 {
            lkb.remid = msg.lkid;
        }
    }

    if result == Status::TryFailed {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if wait_type == WaitType::Request {
            lkb_dequeue(&mut body, &mut lkb);
            lkb.retstatus = Status::TryFailed;
            queue_ast(ls, &mut lkb, AST_COMP | AST_DEL, Mode::Iv);
        } else {
            lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
            lkb.rqmode = Mode::Iv;
            lkb.retstatus = Status::TryFailed;
            queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
        }
        return;
    }

    match LkbState::from_u8(msg.status) {
        Some(LkbState::Granted) => {
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            apply_remote_grant(ls, &mut body, &mut lkb, &msg);
        }
        Some(state @ (LkbState::Waiting | LkbState::Convert)) => {
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            if lkb.state != Some(LkbState::Granted) {
                lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, state);
            } else {
                tracing::warn!(ls = %ls.name, nodeid, "queue reply for granted lock");
            }
        }
        None => tracing::warn!(ls = %ls.name, nodeid, status = msg.status, "reply with bad state"),
    }
}

/// The compact process-copy version of a grant: mirror what the master
/// decided, then notify the caller.
fn apply_remote_grant(ls: &Arc<Lockspace>, body: &mut RsbBody, lkb: &mut Lkb, msg: &LockMessage) {
    if lkb.iflags & IFL_VALBLK != 0 {
        lkb.lvb = Some(ls.lvb_from_wire(&msg.lvb));
        lkb.lvbseq = msg.lvbseq;
    }
    if msg.iflags & IFL_DEMOTED != 0 {
        lkb.iflags |= IFL_DEMOTED;
    }
    lkb.grmode = lkb.rqmode;
    lkb.rqmode = Mode::Iv;
    lkb.promote_range();
    lkb_swqueue(body, &ls.lkbs, lkb, LkbState::Granted);
    lkb.highbast = Mode::Iv;
    lkb.sbflags = msg.sbflags;
    if lkb.iflags & IFL_DEMOTED != 0 {
        lkb.sbflags |= SBF_DEMOTED;
    }
    lkb.retstatus = Status::Ok;
    queue_ast(ls, lkb, AST_COMP, Mode::Iv);
}

/// Deferred grant (or out-of-band error completion) from the master.
fn receive_grant(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::debug!(ls = %ls.name, nodeid, remid = msg.remid, "grant for unknown lock");
        return;
    };
    let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
        return;
    };
    let mut body = rsb.body();
    let mut lkb = lkb_ref.lock().expect("lkb poisoned");

    if lkb.wait_type.is_some() {
        // A grant overtaking our own in-flight op means the master's reply
        // is still coming; record the master lkid and fall through.
        tracing::warn!(ls = %ls.name, nodeid, "grant while op in flight");
        waiters::remove(ls, &mut lkb);
        if lkb.remid == 0 {
            lkb.remid = msg.lkid;
        }
    }

    let result = Status::from_i32(msg.result).unwrap_or(Status::Invalid);
    if result != Status::Ok {
        // Out-of-band completion, e.g. a conversion-deadlock victim.
        lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
        lkb.rqmode = Mode::Iv;
        lkb.retstatus = result;
        queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
        return;
    }
    if lkb.rqmode == Mode::Iv {
        // Duplicate grant; nothing is pending on this lock.
        tracing::debug!(ls = %ls.name, nodeid, "grant with no request pending");
        return;
    }
    apply_remote_grant(ls, &mut body, &mut lkb, &msg);
}

/// Blocking notification relayed by the master.
fn receive_bast(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::debug!(ls = %ls.name, nodeid, remid = msg.remid, "bast for unknown lock");
        return;
    };
    let Some(mode) = Mode::from_i8(msg.bastmode) else {
        return;
    };
    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
    if lkb.state == Some(LkbState::Granted) {
        queue_ast(ls, &mut lkb, AST_BAST, mode);
    }
}

/// Directory node side of a lookup.
fn receive_lookup(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let us = ls.our_nodeid();
    {
        let members = ls.members.lock().expect("members poisoned");
        if dir_nodeid(&msg.name, members.nodes()) != us {
            tracing::debug!(ls = %ls.name, nodeid, "lookup routed to wrong directory node");
        }
    }
    let master = ls.dir.lookup(&msg.name, nodeid);
    let reply = LockMessage {
        remid: msg.lkid,
        nodeid: master,
        ..Default::default()
    };
    ls.send_lock(nodeid, Command::LookupReply, reply);
}

/// Process-copy side: the directory told us the master.
fn receive_lookup_reply(ls: &Arc<Lockspace>, nodeid: u32, msg: LockMessage) {
    let Some(lkb_ref) = ls.lkbs.get(msg.remid) else {
        tracing::debug!(ls = %ls.name, nodeid, remid = msg.remid, "lookup reply for unknown lock");
        return;
    };
    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if lkb.wait_type != Some(WaitType::Lookup) {
            tracing::debug!(ls = %ls.name, nodeid, "unexpected lookup reply dropped");
            return;
        }
        waiters::remove(ls, &mut lkb);
    }
    let Some(rsb) = lkb_ref.lock().expect("lkb poisoned").resource.clone() else {
        return;
    };

    let us = ls.our_nodeid();
    let state = MasterState::from_lookup(msg.nodeid, us);
    {
        let mut body = rsb.body();
        if body.master.is_unknown() {
            body.master = state;
            if state.is_local() {
                body.flags |= RSF_MASTER;
            }
        } else if body.master != state {
            tracing::info!(ls = %ls.name, nodeid, "ignoring late master reply");
        }
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.nodeid = body.master.lock_nodeid();
    }
    crate::locking::lock_stage2(ls, &rsb, &lkb_ref);
}

fn lkb_id(lkb_ref: &crate::lkb::LkbRef) -> u32 {
    lkb_ref.lock().expect("lkb poisoned").id
}
