//! The lock engine: grants, conversions, unlocks, blocking notifications
//! and conversion-deadlock handling.
//!
//! Engine functions are synchronous and run under the per-resource body
//! lock; the only locks taken inside are individual lock blocks of the same
//! resource, one at a time. Callbacks are never fired here, only queued.

use std::sync::Arc;
use std::time::Instant;

use crate::ast_task::queue_ast;
use crate::dir::dir_nodeid;
use crate::flags::*;
use crate::lkb::{Lkb, LkbRef, LkbState, WaitType};
use crate::lockspace::Lockspace;
use crate::message_types::{Status, MAX_NAME_LEN};
use crate::mode::{LvbOp, Mode};
use crate::rsb::{
    lkb_dequeue, lkb_enqueue, lkb_swqueue, MasterState, Rsb, RsbBody,
};
use crate::waiters;

/// Synchronous validation failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    BadMode,
    BadFlags,
    BadName,
    BadRange,
    /// No such lock id.
    NotFound,
    /// Another remote operation is outstanding on this lock.
    Busy,
    /// The operation is not legal on a master copy.
    MasterCopy,
    /// Convert/unlock of a lock that is not granted, or cancel of one that
    /// is.
    BadState,
    /// The lockspace has not been started.
    NotRunning,
}

/// Arguments of a new-lock request.
pub struct LockArgs {
    pub mode: Mode,
    pub flags: u32,
    pub name: Vec<u8>,
    pub range: Option<(u64, u64)>,
    /// Initial LVB content when `LKF_VALBLK` is set.
    pub lvb: Option<Vec<u8>>,
    pub ast: crate::message_types::CompletionFn,
    pub bast: Option<crate::message_types::BlockingFn>,
}

// Snapshot of the fields conflict checks need from a queue member.
#[derive(Debug, Clone, Copy)]
struct Snap {
    id: u32,
    grmode: Mode,
    rqmode: Mode,
    exflags: u32,
    range: Option<[u64; 4]>,
}

fn snap(lkb: &Lkb) -> Snap {
    Snap {
        id: lkb.id,
        grmode: lkb.grmode,
        rqmode: lkb.rqmode,
        exflags: lkb.exflags,
        range: lkb.range,
    }
}

/// Requested interval of `a` against granted interval of `b`; a missing
/// range covers everything.
fn ranges_overlap(a: &Snap, b: &Snap) -> bool {
    let (Some(ra), Some(rb)) = (a.range, b.range) else {
        return true;
    };
    !(ra[crate::lkb::RQ_RANGE_END] < rb[crate::lkb::GR_RANGE_START]
        || ra[crate::lkb::RQ_RANGE_START] > rb[crate::lkb::GR_RANGE_END])
}

fn for_each_snap(ls: &Lockspace, queue: &[u32], skip: u32, mut f: impl FnMut(&Snap) -> bool) -> bool {
    for id in queue {
        if *id == skip {
            continue;
        }
        let Some(other) = ls.lkbs.get(*id) else {
            continue;
        };
        let other = snap(&other.lock().expect("lkb poisoned"));
        if f(&other) {
            return true;
        }
    }
    false
}

/// Does `cand` conflict with any lock on `queue`?
fn queue_conflict(ls: &Lockspace, queue: &[u32], cand: &Snap) -> bool {
    for_each_snap(ls, queue, cand.id, |other| {
        ranges_overlap(cand, other) && !other.grmode.compat(cand.rqmode)
    })
}

/// A pair on the convert queue where each side's granted mode blocks the
/// other's requested mode.
fn conversion_deadlock_detect(ls: &Lockspace, body: &RsbBody, cand: &Snap) -> bool {
    for_each_snap(ls, &body.convert_queue, cand.id, |other| {
        ranges_overlap(cand, other)
            && !other.grmode.compat(cand.rqmode)
            && !cand.grmode.compat(other.rqmode)
    })
}

/// Demotes the other members of the conversion deadlock to NL. Members
/// without `CONVDEADLK` veto the resolution.
fn conversion_deadlock_resolve(ls: &Lockspace, body: &RsbBody, cand: &Snap) -> bool {
    let mut resolved = true;
    for id in &body.convert_queue {
        if *id == cand.id {
            continue;
        }
        let Some(other_ref) = ls.lkbs.get(*id) else {
            continue;
        };
        let mut other = other_ref.lock().expect("lkb poisoned");
        let other_snap = snap(&other);
        if !ranges_overlap(cand, &other_snap) {
            continue;
        }
        if !other_snap.grmode.compat(cand.rqmode) && !cand.grmode.compat(other_snap.rqmode) {
            if other.exflags & LKF_CONVDEADLK == 0 {
                resolved = false;
                continue;
            }
            other.grmode = Mode::Nl;
            other.iflags |= IFL_DEMOTED;
        }
    }
    resolved
}

/// With QUECVT, a conversion is granted ahead of its queue position only
/// when queueing it at the tail would block a conversion ahead of it.
fn quecvt_deadlock_detect(ls: &Lockspace, body: &RsbBody, cand: &Snap) -> bool {
    for id in &body.convert_queue {
        if *id == cand.id {
            return false;
        }
        let Some(other) = ls.lkbs.get(*id) else {
            continue;
        };
        let other = snap(&other.lock().expect("lkb poisoned"));
        if ranges_overlap(cand, &other) && !cand.grmode.compat(other.rqmode) {
            return true;
        }
    }
    false
}

/// The grantability predicate. May resolve a conversion deadlock as a side
/// effect (demoting other queue members).
fn can_be_granted(ls: &Lockspace, body: &RsbBody, cand: &Snap) -> bool {
    if cand.rqmode == Mode::Nl {
        return true;
    }
    if cand.rqmode == cand.grmode {
        return true;
    }
    if queue_conflict(ls, &body.grant_queue, cand) {
        return false;
    }
    if !queue_conflict(ls, &body.convert_queue, cand) {
        if cand.exflags & LKF_QUECVT == 0 {
            return true;
        }
        return body.convert_queue.is_empty()
            || body.convert_queue.first() == Some(&cand.id)
            || quecvt_deadlock_detect(ls, body, cand);
    }

    // A converting lock is in the way. Only a conversion that permits
    // deadlock resolution may push through, and only if there really is a
    // deadlock to resolve.
    if cand.exflags & LKF_CONVDEADLK == 0 {
        return false;
    }
    if !conversion_deadlock_detect(ls, body, cand) {
        return false;
    }
    conversion_deadlock_resolve(ls, body, cand)
}

/// [`can_be_granted`] plus the ALTPR/ALTCW fallback for new requests: if
/// the requested mode fails, retry at the alternate mode and mark the grant
/// with `SBF_ALTMODE`.
fn can_be_granted_alt(ls: &Lockspace, body: &RsbBody, lkb: &mut Lkb) -> bool {
    let cand = snap(lkb);
    if can_be_granted(ls, body, &cand) {
        return true;
    }
    let alt = if lkb.exflags & LKF_ALTPR != 0 {
        Some(Mode::Pr)
    } else if lkb.exflags & LKF_ALTCW != 0 {
        Some(Mode::Cw)
    } else {
        None
    };
    if let Some(alt) = alt {
        let mut retry = cand;
        retry.rqmode = alt;
        if can_be_granted(ls, body, &retry) {
            lkb.rqmode = alt;
            lkb.sbflags |= SBF_ALTMODE;
            return true;
        }
    }
    false
}

fn remove_from_deadlockq(ls: &Lockspace, lkb: &mut Lkb) {
    if lkb.due_stamp.take().is_some() {
        ls.deadlockq
            .lock()
            .expect("deadlockq poisoned")
            .retain(|id| *id != lkb.id);
    }
}

fn add_to_deadlockq(ls: &Lockspace, lkb: &mut Lkb) {
    if lkb.due_stamp.is_none() {
        lkb.due_stamp = Some(Instant::now());
        ls.deadlockq
            .lock()
            .expect("deadlockq poisoned")
            .push(lkb.id);
    }
}

/// Moves a lock to the granted queue with all grant side effects: LVB
/// transfer, range promotion, completion delivery (or the remote grant
/// message for a master copy granted out of band).
pub(crate) fn grant_lock(
    ls: &Arc<Lockspace>,
    body: &mut RsbBody,
    lkb: &mut Lkb,
    send_remote: bool,
) {
    remove_from_deadlockq(ls, lkb);

    if lkb.iflags & IFL_VALBLK != 0 {
        match lkb.grmode.lvb_op(lkb.rqmode) {
            LvbOp::ToLock => {
                if body.lvb.is_none() {
                    body.lvb = Some(vec![0; ls.lvblen]);
                }
                if let Some(rsb_lvb) = body.lvb.as_ref() {
                    lkb.lvb = Some(rsb_lvb.clone());
                    lkb.lvbseq = body.lvbseq;
                }
            }
            LvbOp::ToResource => {
                if let Some(lkb_lvb) = lkb.lvb.as_ref() {
                    body.lvb = Some(lkb_lvb.clone());
                    body.lvbseq = body.lvbseq.wrapping_add(1);
                    lkb.lvbseq = body.lvbseq;
                    body.flags &= !RSF_VALNOTVALID;
                }
            }
            LvbOp::None => {}
        }
    }

    lkb.promote_range();
    lkb.grmode = lkb.rqmode;
    lkb.rqmode = Mode::Iv;
    lkb_swqueue(body, &ls.lkbs, lkb, LkbState::Granted);
    lkb.highbast = Mode::Iv;
    lkb.retstatus = Status::Ok;

    let mut sbflags = lkb.sbflags & SBF_ALTMODE;
    if lkb.iflags & IFL_DEMOTED != 0 {
        sbflags |= SBF_DEMOTED;
    }
    if lkb.iflags & IFL_VALBLK != 0 && body.flags & RSF_VALNOTVALID != 0 {
        sbflags |= SBF_VALNOTVALID;
    }
    lkb.sbflags = sbflags;

    if lkb.is_mstcpy() {
        // A grant folded into the pending reply is sent by the request
        // handler; only out-of-band grants need their own message.
        if send_remote && !lkb.reply_pending {
            crate::proto::send_grant(ls, body, lkb);
        }
    } else {
        queue_ast(ls, lkb, AST_COMP, Mode::Iv);
    }
}

/// Sends blocking notifications to queue members blocking `cand`.
fn send_bast_queue(ls: &Arc<Lockspace>, queue: &[u32], cand: &Snap) {
    for id in queue.to_vec() {
        if id == cand.id {
            continue;
        }
        let Some(other_ref) = ls.lkbs.get(id) else {
            continue;
        };
        let mut other = other_ref.lock().expect("lkb poisoned");
        let wants_bast = other.bast.is_some() || other.remote_asts & AST_BAST != 0;
        let other_snap = snap(&other);
        if wants_bast
            && other.highbast < cand.rqmode
            && ranges_overlap(cand, &other_snap)
            && !other_snap.grmode.compat(cand.rqmode)
        {
            queue_ast(ls, &mut other, AST_BAST, cand.rqmode);
            other.highbast = cand.rqmode;
        }
    }
}

fn send_blocking_asts(ls: &Arc<Lockspace>, body: &RsbBody, cand: &Snap) {
    send_bast_queue(ls, &body.grant_queue, cand);
}

fn send_blocking_asts_all(ls: &Arc<Lockspace>, body: &RsbBody, cand: &Snap) {
    send_bast_queue(ls, &body.grant_queue, cand);
    send_bast_queue(ls, &body.convert_queue, cand);
}

/// After a dequeue or downgrade, grants whatever became grantable and
/// notifies granted holders still blocking the highest waiter.
pub(crate) fn grant_pending(ls: &Arc<Lockspace>, body: &mut RsbBody) {
    let mut high = Mode::Iv;

    for id in body.convert_queue.clone() {
        let Some(lkb_ref) = ls.lkbs.get(id) else {
            continue;
        };
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        let cand = snap(&lkb);
        if can_be_granted(ls, body, &cand) {
            grant_lock(ls, body, &mut lkb, true);
        } else {
            high = high.max(lkb.rqmode);
        }
    }

    for id in body.wait_queue.clone() {
        let Some(lkb_ref) = ls.lkbs.get(id) else {
            continue;
        };
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        if can_be_granted_alt(ls, body, &mut lkb) {
            grant_lock(ls, body, &mut lkb, true);
        } else {
            high = high.max(lkb.rqmode);
        }
    }

    if high > Mode::Iv {
        for id in body.grant_queue.clone() {
            let Some(lkb_ref) = ls.lkbs.get(id) else {
                continue;
            };
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            let wants_bast = lkb.bast.is_some() || lkb.remote_asts & AST_BAST != 0;
            if wants_bast && lkb.highbast < high && !lkb.grmode.compat(high) {
                queue_ast(ls, &mut lkb, AST_BAST, high);
                lkb.highbast = high;
            }
        }
    }
}

// Helpers for the lock/convert/unlock entry points.

fn resource_of(lkb_ref: &LkbRef) -> Option<Arc<Rsb>> {
    lkb_ref.lock().expect("lkb poisoned").resource.clone()
}

fn validate_request(args: &LockArgs) -> Result<(), Error> {
    if args.flags & !LKF_ALL != 0 {
        return Err(Error::BadFlags);
    }
    if args.flags & (LKF_CANCEL | LKF_CONVERT | LKF_QUECVT | LKF_EXPEDITE) != 0 {
        // Conversion-only and unlock-only flags are rejected here; the
        // convert path validates its own set.
        return Err(Error::BadFlags);
    }
    if args.mode == Mode::Iv {
        return Err(Error::BadMode);
    }
    if args.name.is_empty() || args.name.len() > MAX_NAME_LEN {
        return Err(Error::BadName);
    }
    if let Some((start, end)) = args.range {
        if start > end {
            return Err(Error::BadRange);
        }
    }
    Ok(())
}

/// New-lock request. Returns the lock id; the outcome arrives through the
/// completion notification.
pub fn request(ls: &Arc<Lockspace>, args: LockArgs) -> Result<u32, Error> {
    validate_request(&args)?;
    if !ls.running() {
        return Err(Error::NotRunning);
    }

    let (lkid, lkb_ref) = ls.lkbs.create();
    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.rqmode = args.mode;
        lkb.exflags = args.flags;
        lkb.ast = Some(args.ast);
        lkb.bast = args.bast;
        if let Some((start, end)) = args.range {
            lkb.set_range(start, end);
        }
        if args.flags & LKF_VALBLK != 0 {
            lkb.iflags |= IFL_VALBLK;
            let mut lvb = args.lvb.unwrap_or_default();
            lvb.resize(ls.lvblen, 0);
            lkb.lvb = Some(lvb);
        }
    }

    if let Err(err) = lock_stage1(ls, &lkb_ref, &args.name) {
        ls.lkbs.remove(lkid);
        return Err(err);
    }
    Ok(lkid)
}

/// Binds the lock to its resource and resolves the master, going to the
/// directory when nobody local knows it.
pub(crate) fn lock_stage1(ls: &Arc<Lockspace>, lkb_ref: &LkbRef, name: &[u8]) -> Result<(), Error> {
    let rsb = ls
        .rsbs
        .find_or_create(name, true)
        .expect("create requested");
    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.resource = Some(rsb.clone());
    }

    let master = rsb.body().master;
    let master = match master {
        MasterState::Unknown => {
            let us = ls.our_nodeid();
            let members = ls.members.lock().expect("members poisoned");
            let dir_node = dir_nodeid(name, members.nodes());
            drop(members);
            if dir_node != us {
                // Park on the directory lookup.
                let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                lkb.nodeid = None;
                waiters::add(ls, &mut lkb, WaitType::Lookup);
                drop(lkb);
                crate::proto::send_remote_op(ls, lkb_id(lkb_ref), WaitType::Lookup, None);
                return Ok(());
            }
            let master_nodeid = ls.dir.lookup(name, us);
            let state = MasterState::from_lookup(master_nodeid, us);
            let mut body = rsb.body();
            body.master = state;
            if state.is_local() {
                body.flags |= RSF_MASTER;
            }
            state
        }
        known => known,
    };

    {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.nodeid = master.lock_nodeid();
    }
    lock_stage2(ls, &rsb, lkb_ref);
    Ok(())
}

fn lkb_id(lkb_ref: &LkbRef) -> u32 {
    lkb_ref.lock().expect("lkb poisoned").id
}

/// Master known: grant locally or ship the request to the master.
pub(crate) fn lock_stage2(ls: &Arc<Lockspace>, rsb: &Arc<Rsb>, lkb_ref: &LkbRef) {
    let local = rsb.body().master.is_local();
    if local {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lock_stage3(ls, &mut body, &mut lkb);
    } else {
        let lkid = {
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb_enqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Waiting);
            waiters::add(ls, &mut lkb, WaitType::Request);
            lkb.id
        };
        crate::proto::send_remote_op(ls, lkid, WaitType::Request, None);
    }
}

/// Final grant attempt on the master. Both resource body and lock must be
/// locked by the caller.
pub(crate) fn lock_stage3(ls: &Arc<Lockspace>, body: &mut RsbBody, lkb: &mut Lkb) {
    if can_be_granted_alt(ls, body, lkb) {
        grant_lock(ls, body, lkb, false);
        return;
    }

    if lkb.exflags & LKF_NOQUEUE != 0 {
        lkb.retstatus = Status::TryFailed;
        let cand = snap(lkb);
        if lkb.exflags & LKF_NOQUEUEBAST != 0 {
            send_blocking_asts_all(ls, body, &cand);
        }
        if !lkb.is_mstcpy() {
            queue_ast(ls, lkb, AST_COMP | AST_DEL, Mode::Iv);
        }
        return;
    }

    lkb.retstatus = Status::Ok;
    lkb_enqueue(body, &ls.lkbs, lkb, LkbState::Waiting);
    let cand = snap(lkb);
    send_blocking_asts(ls, body, &cand);
}

fn validate_convert(lkb: &Lkb, mode: Mode, flags: u32) -> Result<(), Error> {
    if flags & !LKF_ALL != 0 || flags & LKF_CANCEL != 0 {
        return Err(Error::BadFlags);
    }
    if flags & LKF_EXPEDITE != 0 && flags & (LKF_QUECVT | LKF_NOQUEUE) != 0 {
        return Err(Error::BadFlags);
    }
    if mode == Mode::Iv {
        return Err(Error::BadMode);
    }
    if lkb.is_mstcpy() {
        return Err(Error::MasterCopy);
    }
    if lkb.iflags & IFL_DELETED != 0 {
        return Err(Error::BadState);
    }
    if lkb.wait_type.is_some() {
        return Err(Error::Busy);
    }
    if lkb.state != Some(LkbState::Granted) {
        return Err(Error::BadState);
    }
    if flags & LKF_QUECVT != 0 && !lkb.grmode.quecvt_compat(mode) {
        return Err(Error::BadFlags);
    }
    Ok(())
}

/// Conversion of a granted lock to a new mode.
pub fn convert(
    ls: &Arc<Lockspace>,
    lkid: u32,
    mode: Mode,
    flags: u32,
    range: Option<(u64, u64)>,
    lvb: Option<Vec<u8>>,
) -> Result<(), Error> {
    if !ls.running() {
        return Err(Error::NotRunning);
    }
    let lkb_ref = ls.lkbs.get(lkid).ok_or(Error::NotFound)?;
    let rsb = {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        validate_convert(&lkb, mode, flags)?;
        if let Some((start, end)) = range {
            if start > end {
                return Err(Error::BadRange);
            }
            lkb.set_range(start, end);
        }
        lkb.iflags &= !IFL_DEMOTED;
        lkb.sbflags = 0;
        if flags & LKF_VALBLK != 0 {
            lkb.iflags |= IFL_VALBLK;
            if let Some(new_lvb) = lvb {
                let mut new_lvb = new_lvb;
                new_lvb.resize(ls.lvblen, 0);
                lkb.lvb = Some(new_lvb);
            } else if lkb.lvb.is_none() {
                lkb.lvb = Some(vec![0; ls.lvblen]);
            }
        }
        lkb.rqmode = mode;
        lkb.exflags = flags;
        lkb.resource.clone().ok_or(Error::BadState)?
    };

    let remote = !rsb.body().master.is_local();
    if remote {
        {
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Convert);
            waiters::add(ls, &mut lkb, WaitType::Convert);
        }
        crate::proto::send_remote_op(ls, lkid, WaitType::Convert, None);
    } else {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        convert_stage2(ls, &mut body, &mut lkb, true);
    }
    Ok(())
}

/// Conversion attempt on the master, for local conversions and inbound
/// remote ones alike.
pub(crate) fn convert_stage2(ls: &Arc<Lockspace>, body: &mut RsbBody, lkb: &mut Lkb, do_ast: bool) {
    let cand = snap(lkb);
    if can_be_granted(ls, body, &cand) {
        grant_lock(ls, body, lkb, false);
        grant_pending(ls, body);
        return;
    }

    lkb_dequeue(body, lkb);

    if lkb.exflags & LKF_NOQUEUE != 0 {
        lkb_enqueue(body, &ls.lkbs, lkb, LkbState::Granted);
        lkb.rqmode = Mode::Iv;
        lkb.retstatus = Status::TryFailed;
        if do_ast {
            queue_ast(ls, lkb, AST_COMP, Mode::Iv);
        }
        if lkb.exflags & LKF_NOQUEUEBAST != 0 {
            send_blocking_asts_all(ls, body, &cand);
        }
        return;
    }

    lkb.retstatus = Status::Ok;
    lkb_enqueue(body, &ls.lkbs, lkb, LkbState::Convert);
    send_blocking_asts(ls, body, &cand);
    if lkb.exflags & LKF_NODLCKWT == 0 {
        add_to_deadlockq(ls, lkb);
    }
}

fn validate_unlock(lkb: &Lkb, flags: u32) -> Result<(), Error> {
    if flags & !LKF_ALL != 0 {
        return Err(Error::BadFlags);
    }
    if lkb.is_mstcpy() {
        return Err(Error::MasterCopy);
    }
    if lkb.iflags & IFL_DELETED != 0 {
        return Err(Error::BadState);
    }
    if lkb.wait_type.is_some() {
        return Err(Error::Busy);
    }
    let cancel = flags & LKF_CANCEL != 0;
    if cancel && lkb.state == Some(LkbState::Granted) {
        return Err(Error::BadState);
    }
    if !cancel && lkb.state != Some(LkbState::Granted) {
        return Err(Error::BadState);
    }
    Ok(())
}

/// Unlock a granted lock, or with `LKF_CANCEL` cancel a pending
/// convert/wait.
pub fn unlock(ls: &Arc<Lockspace>, lkid: u32, flags: u32, lvb: Option<Vec<u8>>) -> Result<(), Error> {
    if !ls.running() {
        return Err(Error::NotRunning);
    }
    let lkb_ref = ls.lkbs.get(lkid).ok_or(Error::NotFound)?;
    let (rsb, cancel) = {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        validate_unlock(&lkb, flags)?;
        let cancel = flags & LKF_CANCEL != 0;
        if !cancel {
            lkb.iflags |= IFL_DELETED;
        }
        if let Some(new_lvb) = lvb {
            let mut new_lvb = new_lvb;
            new_lvb.resize(ls.lvblen, 0);
            lkb.lvb = Some(new_lvb);
        }
        lkb.exflags = flags;
        (lkb.resource.clone().ok_or(Error::BadState)?, cancel)
    };

    let remote = !rsb.body().master.is_local();
    if remote {
        let wait_type = if cancel {
            WaitType::Cancel
        } else {
            WaitType::Unlock
        };
        {
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            waiters::add(ls, &mut lkb, wait_type);
        }
        crate::proto::send_remote_op(ls, lkid, wait_type, None);
    } else {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        unlock_stage2(ls, &mut body, &mut lkb, flags);
    }
    Ok(())
}

/// Dequeue and completion on the master, for local and inbound remote
/// unlocks/cancels. The master-copy teardown (freeing the block and the
/// resource reference) is the caller's job for remote locks.
pub(crate) fn unlock_stage2(ls: &Arc<Lockspace>, body: &mut RsbBody, lkb: &mut Lkb, flags: u32) {
    let cancel = flags & LKF_CANCEL != 0;

    if cancel && lkb.state == Some(LkbState::Granted) {
        // Raced with a grant; nothing left to cancel.
        lkb.retstatus = Status::Invalid;
        if !lkb.is_mstcpy() {
            queue_ast(ls, lkb, AST_COMP, Mode::Iv);
        }
        return;
    }

    let old_state = lkb_dequeue(body, lkb);

    if old_state == Some(LkbState::Granted) {
        grant_pending(ls, body);
    }

    if cancel && old_state == Some(LkbState::Convert) {
        // Cancelled conversion: back onto the granted queue at the old
        // mode, and renotify whoever the conversion was blocking.
        let cand = snap(lkb);
        send_blocking_asts(ls, body, &cand);
        remove_from_deadlockq(ls, lkb);
        lkb.rqmode = Mode::Iv;
        lkb_enqueue(body, &ls.lkbs, lkb, LkbState::Granted);
        grant_pending(ls, body);
        lkb.retstatus = Status::Cancelled;
        if !lkb.is_mstcpy() {
            queue_ast(ls, lkb, AST_COMP, Mode::Iv);
        }
        return;
    }

    if !cancel && lkb.grmode >= Mode::Pw {
        if body.lvb.is_some() {
            if flags & LKF_VALBLK != 0 {
                if let Some(lkb_lvb) = lkb.lvb.as_ref() {
                    body.lvb = Some(lkb_lvb.clone());
                    body.lvbseq = body.lvbseq.wrapping_add(1);
                    body.flags &= !RSF_VALNOTVALID;
                }
            }
            if flags & LKF_IVVALBLK != 0 {
                if let Some(rsb_lvb) = body.lvb.as_mut() {
                    rsb_lvb.iter_mut().for_each(|byte| *byte = 0);
                }
            }
        }
    }

    lkb.retstatus = if cancel {
        Status::Cancelled
    } else {
        Status::Unlocked
    };
    if !lkb.is_mstcpy() {
        queue_ast(ls, lkb, AST_COMP | AST_DEL, Mode::Iv);
    }
}

/// Unwinds an operation whose remote processing will not complete (send
/// failure beyond recovery, or timeout). Waiting locks are removed,
/// conversions revert to granted, unlocks stay put.
pub fn cancel_lockop(ls: &Arc<Lockspace>, lkid: u32, status: Status) {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return;
    };
    let rsb = resource_of(&lkb_ref);
    let wait_type = {
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        waiters::remove(ls, &mut lkb)
    };
    let Some(wait_type) = wait_type else {
        return;
    };

    match wait_type {
        WaitType::Lookup => {
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.retstatus = status;
            queue_ast(ls, &mut lkb, AST_COMP | AST_DEL, Mode::Iv);
        }
        WaitType::Request => {
            if let Some(rsb) = rsb {
                let mut body = rsb.body();
                let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                lkb_dequeue(&mut body, &mut lkb);
                lkb.retstatus = status;
                queue_ast(ls, &mut lkb, AST_COMP | AST_DEL, Mode::Iv);
            }
        }
        WaitType::Convert => {
            if let Some(rsb) = rsb {
                let mut body = rsb.body();
                let mut lkb = lkb_ref.lock().expect("lkb poisoned");
                lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
                lkb.rqmode = Mode::Iv;
                remove_from_deadlockq(ls, &mut lkb);
                lkb.retstatus = status;
                queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
            }
        }
        WaitType::Unlock | WaitType::Cancel => {
            // The unlock stays pending; recovery decides its fate.
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.retstatus = status;
            queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
        }
    }
}

/// A conversion the engine itself is failing (deadlock victim).
pub(crate) fn cancel_conversion(ls: &Arc<Lockspace>, lkid: u32, status: Status) {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return;
    };
    let Some(rsb) = resource_of(&lkb_ref) else {
        return;
    };
    let mut body = rsb.body();
    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
    if lkb.state != Some(LkbState::Convert) {
        return;
    }
    tracing::info!(
        ls = %ls.name,
        lkid = format_args!("{lkid:#x}"),
        "conversion deadlock victim"
    );
    lkb_swqueue(&mut body, &ls.lkbs, &mut lkb, LkbState::Granted);
    lkb.rqmode = Mode::Iv;
    remove_from_deadlockq(ls, &mut lkb);
    lkb.retstatus = status;
    queue_ast(ls, &mut lkb, AST_COMP, Mode::Iv);
    drop(lkb);
    grant_pending(ls, &mut body);
}

/// Timer probe: is this queued conversion deadlocked with anything ahead
/// of it on the convert queue?
fn conversion_blocked_by_predecessor(ls: &Arc<Lockspace>, lkid: u32) -> bool {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return false;
    };
    let Some(rsb) = resource_of(&lkb_ref) else {
        return false;
    };
    let body = rsb.body();
    let lkb = lkb_ref.lock().expect("lkb poisoned");
    if lkb.state != Some(LkbState::Convert) {
        return false;
    }
    let cand = snap(&lkb);
    drop(lkb);
    for id in &body.convert_queue {
        if *id == cand.id {
            break;
        }
        let Some(other) = ls.lkbs.get(*id) else {
            continue;
        };
        let other = snap(&other.lock().expect("lkb poisoned"));
        if ranges_overlap(&cand, &other) && !other.grmode.compat(cand.rqmode) {
            return true;
        }
    }
    false
}

/// Ages the deadlock queue: conversions due for `deadlock_secs` that are
/// blocked by a predecessor are failed with a deadlock status.
pub fn scan_deadlocks(ls: &Arc<Lockspace>, deadlock_secs: u64) {
    let due: Vec<u32> = {
        let deadlockq = ls.deadlockq.lock().expect("deadlockq poisoned");
        deadlockq
            .iter()
            .copied()
            .filter(|lkid| {
                ls.lkbs.get(*lkid).is_some_and(|lkb| {
                    let lkb = lkb.lock().expect("lkb poisoned");
                    lkb.due_stamp
                        .is_some_and(|stamp| stamp.elapsed().as_secs() >= deadlock_secs)
                })
            })
            .collect()
    };
    for lkid in due {
        if conversion_blocked_by_predecessor(ls, lkid) {
            cancel_conversion(ls, lkid, Status::Deadlock);
        }
    }
}

/// Recovery handed us mastery of this lock's resource while its request
/// was parked; process the saved operation locally.
pub(crate) fn process_remastered_lkb(ls: &Arc<Lockspace>, lkid: u32, wait_type: WaitType) {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return;
    };
    match wait_type {
        WaitType::Lookup => {
            let name = match resource_of(&lkb_ref) {
                Some(rsb) => rsb.name.clone(),
                None => return,
            };
            if lock_stage1(ls, &lkb_ref, &name).is_err() {
                cancel_lockop(ls, lkid, Status::Invalid);
            }
        }
        WaitType::Request => {
            let Some(rsb) = resource_of(&lkb_ref) else {
                return;
            };
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb_dequeue(&mut body, &mut lkb);
            lkb.nodeid = Some(0);
            lock_stage3(ls, &mut body, &mut lkb);
        }
        WaitType::Convert => {
            let Some(rsb) = resource_of(&lkb_ref) else {
                return;
            };
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.nodeid = Some(0);
            convert_stage2(ls, &mut body, &mut lkb, true);
        }
        WaitType::Unlock | WaitType::Cancel => {
            let Some(rsb) = resource_of(&lkb_ref) else {
                return;
            };
            let flags = {
                let lkb = lkb_ref.lock().expect("lkb poisoned");
                lkb.exflags
            };
            let mut body = rsb.body();
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.nodeid = Some(0);
            unlock_stage2(ls, &mut body, &mut lkb, flags);
        }
    }
}

/// Recovery decided the dead master completed this unlock before dying.
pub(crate) fn finish_assumed_unlock(ls: &Arc<Lockspace>, lkid: u32) {
    let Some(lkb_ref) = ls.lkbs.get(lkid) else {
        return;
    };
    let rsb = resource_of(&lkb_ref);
    let mut lkb = lkb_ref.lock().expect("lkb poisoned");
    waiters::remove(ls, &mut lkb);
    if let Some(rsb) = rsb.as_ref() {
        let mut body = rsb.body();
        lkb_dequeue(&mut body, &mut lkb);
    }
    lkb.retstatus = if lkb.exflags & LKF_CANCEL != 0 {
        Status::Cancelled
    } else {
        Status::Unlocked
    };
    queue_ast(ls, &mut lkb, AST_COMP | AST_DEL, Mode::Iv);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::ast_task::AstTask;
    use crate::message_types::LockStatus;
    use crate::testutil::standalone_lockspace;

    struct Caller {
        events: mpsc::UnboundedReceiver<LockStatus>,
        basts: Arc<StdMutex<Vec<(u32, Mode)>>>,
        ast: crate::message_types::CompletionFn,
        bast: crate::message_types::BlockingFn,
    }

    fn caller() -> Caller {
        let (tx, rx) = mpsc::unbounded_channel();
        let basts = Arc::new(StdMutex::new(Vec::new()));
        let basts_clone = basts.clone();
        Caller {
            events: rx,
            basts,
            ast: Arc::new(move |status: &LockStatus| {
                let _ = tx.send(status.clone());
            }),
            bast: Arc::new(move |lkid, mode| {
                basts_clone.lock().unwrap().push((lkid, mode));
            }),
        }
    }

    impl Caller {
        async fn next(&mut self) -> LockStatus {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("completion timed out")
                .expect("completion channel closed")
        }
    }

    fn args(caller: &Caller, name: &[u8], mode: Mode, flags: u32) -> LockArgs {
        LockArgs {
            mode,
            flags,
            name: name.to_vec(),
            range: None,
            lvb: None,
            ast: caller.ast.clone(),
            bast: Some(caller.bast.clone()),
        }
    }

    async fn granted_lock(
        ls: &Arc<Lockspace>,
        caller: &mut Caller,
        name: &[u8],
        mode: Mode,
    ) -> u32 {
        let lkid = request(ls, args(caller, name, mode, 0)).unwrap();
        let status = caller.next().await;
        assert_eq!(status.status, Status::Ok);
        assert_eq!(status.lkid, lkid);
        lkid
    }

    async fn ls_with_asts() -> Arc<Lockspace> {
        let ls = standalone_lockspace(1).await;
        AstTask::spawn(ls.asts.clone());
        ls
    }

    #[tokio::test]
    async fn empty_resource_grants_immediately() {
        let ls = ls_with_asts().await;
        let mut caller = caller();
        let lkid = granted_lock(&ls, &mut caller, b"r", Mode::Ex).await;
        let lkb = ls.lkbs.get(lkid).unwrap();
        let lkb = lkb.lock().unwrap();
        assert_eq!(lkb.state, Some(LkbState::Granted));
        assert_eq!(lkb.grmode, Mode::Ex);
        assert_eq!(lkb.rqmode, Mode::Iv);
    }

    #[tokio::test]
    async fn rejects_bad_arguments() {
        let ls = ls_with_asts().await;
        let caller = caller();
        assert_eq!(
            request(&ls, args(&caller, b"", Mode::Ex, 0)),
            Err(Error::BadName)
        );
        assert_eq!(
            request(&ls, args(&caller, &[0u8; 65], Mode::Ex, 0)),
            Err(Error::BadName)
        );
        assert_eq!(
            request(&ls, args(&caller, b"r", Mode::Iv, 0)),
            Err(Error::BadMode)
        );
        assert_eq!(
            request(&ls, args(&caller, b"r", Mode::Ex, crate::flags::LKF_QUECVT)),
            Err(Error::BadFlags)
        );
        let mut bad_range = args(&caller, b"r", Mode::Ex, 0);
        bad_range.range = Some((10, 2));
        assert_eq!(request(&ls, bad_range), Err(Error::BadRange));
        // A 64-byte name is the maximum and is accepted.
        assert!(request(&ls, args(&caller, &[7u8; 64], Mode::Nl, 0)).is_ok());
    }

    #[tokio::test]
    async fn second_exclusive_waits_then_gets_lock() {
        let ls = ls_with_asts().await;
        let mut first = caller();
        let mut second = caller();
        let held = granted_lock(&ls, &mut first, b"r", Mode::Ex).await;

        let waiting = request(&ls, args(&second, b"r", Mode::Ex, 0)).unwrap();
        {
            let lkb = ls.lkbs.get(waiting).unwrap();
            assert_eq!(lkb.lock().unwrap().state, Some(LkbState::Waiting));
        }

        unlock(&ls, held, 0, None).unwrap();
        let done = first.next().await;
        assert_eq!(done.status, Status::Unlocked);
        let granted = second.next().await;
        assert_eq!(granted.status, Status::Ok);
        assert_eq!(granted.lkid, waiting);
    }

    #[tokio::test]
    async fn noqueue_try_fails_and_sends_basts() {
        let ls = ls_with_asts().await;
        let mut holder = caller();
        let mut trier = caller();
        let _held = granted_lock(&ls, &mut holder, b"r", Mode::Pr).await;

        let lkid = request(
            &ls,
            args(
                &trier,
                b"r",
                Mode::Ex,
                crate::flags::LKF_NOQUEUE | crate::flags::LKF_NOQUEUEBAST,
            ),
        )
        .unwrap();
        let status = trier.next().await;
        assert_eq!(status.status, Status::TryFailed);
        // The failed try lock is torn down after its completion.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ls.lkbs.get(lkid).is_none());
        let basts = holder.basts.lock().unwrap();
        assert_eq!(basts.len(), 1);
        assert_eq!(basts[0].1, Mode::Ex);
    }

    #[tokio::test]
    async fn bast_sent_once_per_mode() {
        let ls = ls_with_asts().await;
        let mut holder = caller();
        let mut first = caller();
        let mut second = caller();
        let _held = granted_lock(&ls, &mut holder, b"r", Mode::Pr).await;

        let waiting = request(&ls, args(&first, b"r", Mode::Ex, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(holder.basts.lock().unwrap().len(), 1);

        // Cancel the waiter; a second EX contender must not renotify the
        // holder, its highbast already covers EX.
        unlock(&ls, waiting, crate::flags::LKF_CANCEL, None).unwrap();
        let cancelled = first.next().await;
        assert_eq!(cancelled.status, Status::Cancelled);
        let _again = request(&ls, args(&second, b"r", Mode::Ex, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(holder.basts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversion_grants_against_nl_but_not_cr() {
        let ls = ls_with_asts().await;
        let mut other = caller();
        let mut conv = caller();

        let _nl = granted_lock(&ls, &mut other, b"a", Mode::Nl).await;
        let lkid = granted_lock(&ls, &mut conv, b"a", Mode::Nl).await;
        convert(&ls, lkid, Mode::Ex, 0, None, None).unwrap();
        assert_eq!(conv.next().await.status, Status::Ok);

        let _cr = granted_lock(&ls, &mut other, b"b", Mode::Cr).await;
        let lkid = granted_lock(&ls, &mut conv, b"b", Mode::Nl).await;
        convert(&ls, lkid, Mode::Ex, 0, None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lkb = ls.lkbs.get(lkid).unwrap();
        assert_eq!(lkb.lock().unwrap().state, Some(LkbState::Convert));
    }

    #[tokio::test]
    async fn conversion_deadlock_demotes_one_holder() {
        let ls = ls_with_asts().await;
        let mut x = caller();
        let mut y = caller();
        let x_lkid = granted_lock(&ls, &mut x, b"r", Mode::Cr).await;
        let y_lkid = granted_lock(&ls, &mut y, b"r", Mode::Cr).await;

        convert(
            &ls,
            x_lkid,
            Mode::Ex,
            crate::flags::LKF_CONVDEADLK,
            None,
            None,
        )
        .unwrap();
        {
            let lkb = ls.lkbs.get(x_lkid).unwrap();
            assert_eq!(lkb.lock().unwrap().state, Some(LkbState::Convert));
        }
        convert(
            &ls,
            y_lkid,
            Mode::Ex,
            crate::flags::LKF_CONVDEADLK,
            None,
            None,
        )
        .unwrap();

        // The second conversion detects the cycle, demotes the first
        // holder to NL and goes through at EX.
        let granted = y.next().await;
        assert_eq!(granted.status, Status::Ok);
        let x_lkb = ls.lkbs.get(x_lkid).unwrap();
        let x_lkb = x_lkb.lock().unwrap();
        assert_eq!(x_lkb.grmode, Mode::Nl);
        assert_ne!(x_lkb.iflags & IFL_DEMOTED, 0);
    }

    #[tokio::test]
    async fn disjoint_ranges_do_not_conflict() {
        let ls = ls_with_asts().await;
        let mut a = caller();
        let mut b = caller();

        let mut first = args(&a, b"r", Mode::Ex, 0);
        first.range = Some((0, 99));
        let _one = request(&ls, first).unwrap();
        assert_eq!(a.next().await.status, Status::Ok);

        let mut second = args(&b, b"r", Mode::Ex, 0);
        second.range = Some((100, 199));
        let _two = request(&ls, second).unwrap();
        assert_eq!(b.next().await.status, Status::Ok);

        // An unranged lock covers everything and must wait.
        let third = request(&ls, args(&a, b"r", Mode::Ex, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lkb = ls.lkbs.get(third).unwrap();
        assert_eq!(lkb.lock().unwrap().state, Some(LkbState::Waiting));
    }

    #[tokio::test]
    async fn cancel_of_granted_lock_is_invalid() {
        let ls = ls_with_asts().await;
        let mut caller = caller();
        let lkid = granted_lock(&ls, &mut caller, b"r", Mode::Ex).await;
        assert_eq!(
            unlock(&ls, lkid, crate::flags::LKF_CANCEL, None),
            Err(Error::BadState)
        );
        // The lock is untouched.
        let lkb = ls.lkbs.get(lkid).unwrap();
        assert_eq!(lkb.lock().unwrap().state, Some(LkbState::Granted));
    }

    #[tokio::test]
    async fn cancelled_conversion_returns_to_granted() {
        let ls = ls_with_asts().await;
        let mut holder = caller();
        let mut conv = caller();
        let _cr = granted_lock(&ls, &mut holder, b"r", Mode::Cr).await;
        let lkid = granted_lock(&ls, &mut conv, b"r", Mode::Cr).await;

        convert(&ls, lkid, Mode::Ex, 0, None, None).unwrap();
        unlock(&ls, lkid, crate::flags::LKF_CANCEL, None).unwrap();
        let status = conv.next().await;
        assert_eq!(status.status, Status::Cancelled);
        let lkb = ls.lkbs.get(lkid).unwrap();
        let lkb = lkb.lock().unwrap();
        assert_eq!(lkb.state, Some(LkbState::Granted));
        assert_eq!(lkb.grmode, Mode::Cr);
    }

    #[tokio::test]
    async fn lvb_written_on_unlock_read_on_grant() {
        let ls = ls_with_asts().await;
        let mut writer = caller();
        let mut reader = caller();

        let mut wargs = args(&writer, b"r", Mode::Ex, crate::flags::LKF_VALBLK);
        wargs.lvb = Some(vec![0xab; ls.lvblen]);
        let held = request(&ls, wargs).unwrap();
        assert_eq!(writer.next().await.status, Status::Ok);

        unlock(
            &ls,
            held,
            crate::flags::LKF_VALBLK,
            Some(vec![0xcd; ls.lvblen]),
        )
        .unwrap();
        assert_eq!(writer.next().await.status, Status::Unlocked);

        let _read = request(
            &ls,
            args(&reader, b"r", Mode::Pr, crate::flags::LKF_VALBLK),
        )
        .unwrap();
        let status = reader.next().await;
        assert_eq!(status.status, Status::Ok);
        assert_eq!(status.lvb.as_deref(), Some(&vec![0xcd; ls.lvblen][..]));
    }

    #[tokio::test]
    async fn alternate_mode_grants_with_flag() {
        let ls = ls_with_asts().await;
        let mut holder = caller();
        let mut alt = caller();
        let _pr = granted_lock(&ls, &mut holder, b"r", Mode::Pr).await;

        // EX cannot be granted against PR, but the ALTPR fallback can.
        let lkid = request(
            &ls,
            args(&alt, b"r", Mode::Ex, crate::flags::LKF_ALTPR),
        )
        .unwrap();
        let status = alt.next().await;
        assert_eq!(status.status, Status::Ok);
        assert_ne!(status.flags & SBF_ALTMODE, 0);
        let lkb = ls.lkbs.get(lkid).unwrap();
        assert_eq!(lkb.lock().unwrap().grmode, Mode::Pr);
    }

    #[tokio::test]
    async fn resource_reclaimed_after_last_unlock() {
        let ls = ls_with_asts().await;
        let mut caller = caller();
        let lkid = granted_lock(&ls, &mut caller, b"gone", Mode::Ex).await;
        unlock(&ls, lkid, 0, None).unwrap();
        assert_eq!(caller.next().await.status, Status::Unlocked);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The delete notification released the last reference.
        let rsb = ls.rsbs.get(b"gone").unwrap();
        assert_eq!(rsb.refcount(), 0);
        assert_eq!(ls.rsbs.scan(0).len(), 1);
        assert!(ls.rsbs.get(b"gone").is_none());
    }
}
