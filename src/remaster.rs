//! Remastering: shipping our locks to the resources' new masters.
//!
//! After a membership change moved mastery of a resource, every surviving
//! holder serialises its local locks on that resource and sends them to
//! the new master, which rebuilds master copies and answers with the new
//! lock ids. In-flight conversions travel flagged so the new master places
//! them on the granted queue at their prior mode; the conversion itself is
//! resent through the waiters table afterwards.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::flags::{IFL_LQCONVERT, IFL_MSTCPY, IFL_NOREBUILD, IFL_VALBLK};
use crate::lkb::LkbState;
use crate::lockspace::Lockspace;
use crate::message_types::RecoverCmd;
use crate::mode::Mode;
use crate::parser;
use crate::rcom;
use crate::recover;
use crate::rsb::{lkb_enqueue, MasterState, Rsb};
use crate::serializer::primitive as ser;

fn pack_lkb(ls: &Lockspace, out: &mut Vec<u8>, lkb: &crate::lkb::Lkb) {
    ser::u32(out, lkb.id);
    ser::u32(out, lkb.exflags);
    ser::u32(out, lkb.iflags & (IFL_LQCONVERT | IFL_VALBLK));
    ser::u8(out, lkb.state.map_or(0, LkbState::as_u8));
    ser::i8(out, lkb.grmode.as_i8());
    ser::i8(out, lkb.rqmode.as_i8());
    ser::u32(out, lkb.lvbseq);
    match (lkb.iflags & IFL_VALBLK != 0, lkb.lvb.as_ref()) {
        (true, Some(lvb)) => {
            ser::u8(out, 1);
            ser::bytes(out, &ls.lvb_to_wire(lvb));
        }
        _ => ser::u8(out, 0),
    }
    match lkb.range {
        Some(range) => {
            ser::u8(out, 1);
            for bound in range {
                ser::u64(out, bound);
            }
        }
        None => ser::u8(out, 0),
    }
}

/// Serialises one resource and its rebuildable locks, or nothing when no
/// lock of ours needs to move.
fn pack_rsb(ls: &Lockspace, rsb: &Arc<Rsb>) -> Option<(Vec<u8>, u32)> {
    let body = rsb.body();
    let mut locks: Vec<u8> = Vec::new();
    let mut count: u16 = 0;
    for state in [LkbState::Granted, LkbState::Convert, LkbState::Waiting] {
        for lkid in body.queue(state) {
            let Some(lkb_ref) = ls.lkbs.get(*lkid) else {
                continue;
            };
            let lkb = lkb_ref.lock().expect("lkb poisoned");
            if lkb.iflags & (IFL_MSTCPY | IFL_NOREBUILD) != 0 {
                continue;
            }
            pack_lkb(ls, &mut locks, &lkb);
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    let mut section = Vec::with_capacity(locks.len() + rsb.name.len() + 4);
    ser::u16(&mut section, rsb.name.len() as u16);
    ser::bytes(&mut section, &rsb.name);
    ser::u16(&mut section, count);
    section.extend_from_slice(&locks);
    Some((section, u32::from(count)))
}

/// Sends every lock that must move to a new remote master, then waits for
/// the new lock ids to come back.
pub async fn send_locks(ls: &Arc<Lockspace>) -> Result<(), ()> {
    let max = ls.config.buffer_size.saturating_sub(64);
    let mut buffers: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut sent_locks = 0;

    for rsb in ls.rsbs.snapshot() {
        if ls.recovery_stopped() {
            return Err(());
        }
        let target = {
            let body = rsb.body();
            match (body.flags & crate::flags::RSF_NEW_MASTER != 0, body.master) {
                (true, MasterState::Remote(nodeid)) => Some(nodeid),
                _ => None,
            }
        };
        let Some(nodeid) = target else {
            continue;
        };
        let Some((section, count)) = pack_rsb(ls, &rsb) else {
            continue;
        };
        let buffer = buffers.entry(nodeid).or_default();
        if !buffer.is_empty() && buffer.len() + section.len() > max {
            let full = std::mem::take(buffer);
            rcom::send_async(ls, nodeid, RecoverCmd::Locks, full);
        }
        buffer.extend_from_slice(&section);
        sent_locks += count;
    }

    ls.lkids_expected.fetch_add(sent_locks, Ordering::SeqCst);
    for (nodeid, buffer) in buffers {
        if !buffer.is_empty() {
            rcom::send_async(ls, nodeid, RecoverCmd::Locks, buffer);
        }
    }
    tracing::info!(ls = %ls.name, sent_locks, "sent locks to new masters");

    recover::wait_function(ls, || {
        ls.lkids_received.load(Ordering::SeqCst) >= ls.lkids_expected.load(Ordering::SeqCst)
    })
    .await
}

/// Looks for an already-rebuilt copy of a remote lock (an interrupted
/// earlier recovery may have delivered it once).
fn find_by_remid(ls: &Lockspace, rsb: &Arc<Rsb>, nodeid: u32, remid: u32) -> Option<u32> {
    let body = rsb.body();
    for state in [LkbState::Granted, LkbState::Convert, LkbState::Waiting] {
        for lkid in body.queue(state) {
            let Some(lkb_ref) = ls.lkbs.get(*lkid) else {
                continue;
            };
            let lkb = lkb_ref.lock().expect("lkb poisoned");
            if lkb.is_mstcpy() && lkb.nodeid == Some(nodeid) && lkb.remid == remid {
                return Some(*lkid);
            }
        }
    }
    None
}

/// The granted mode an interrupted conversion resumes at on the new
/// master: any PR/CW already granted on the resource names the pair.
fn derive_conversion_grmode(ls: &Lockspace, rsb: &Arc<Rsb>) -> Mode {
    let body = rsb.body();
    for lkid in body.queue(LkbState::Granted) {
        let Some(lkb_ref) = ls.lkbs.get(*lkid) else {
            continue;
        };
        let lkb = lkb_ref.lock().expect("lkb poisoned");
        if lkb.grmode == Mode::Pr || lkb.grmode == Mode::Cw {
            return lkb.grmode;
        }
    }
    Mode::Nl
}

/// New-master side: rebuild master copies from a peer's `Locks` payload.
/// Returns the `LockIds` payload answering with our ids.
pub fn receive_locks(ls: &Arc<Lockspace>, nodeid: u32, data: &[u8]) -> Option<Vec<u8>> {
    let mut src = Cursor::new(data);
    let mut reply: Vec<u8> = Vec::new();
    let mut count = 0;

    while (src.position() as usize) < data.len() {
        let Ok(name_len) = parser::primitive::u16(&mut src) else {
            break;
        };
        let Ok(name) = parser::primitive::bytes(&mut src, name_len as usize) else {
            break;
        };
        let Ok(lkb_count) = parser::primitive::u16(&mut src) else {
            break;
        };
        let rsb = ls.rsbs.find_or_create(&name, true).expect("create requested");
        {
            let mut body = rsb.body();
            if !body.master.is_local() {
                // The directory chose us; a stale remote answer loses.
                body.master = MasterState::Local;
                body.flags |= crate::flags::RSF_MASTER;
            }
        }

        for _ in 0..lkb_count {
            let Some(rebuilt) = unpack_lkb(ls, nodeid, &rsb, &mut src) else {
                ls.rsbs.release(&rsb);
                return Some(reply);
            };
            let (our_lkid, their_lkid) = rebuilt;
            ser::u32(&mut reply, our_lkid);
            ser::u32(&mut reply, their_lkid);
            count += 1;
        }
        // find_or_create took a reference for this section; the per-lock
        // references keep the rsb alive.
        ls.rsbs.release(&rsb);
    }

    tracing::info!(ls = %ls.name, nodeid, count, "rebuilt locks for new mastery");
    Some(reply)
}

fn unpack_lkb(
    ls: &Arc<Lockspace>,
    nodeid: u32,
    rsb: &Arc<Rsb>,
    src: &mut Cursor<&[u8]>,
) -> Option<(u32, u32)> {
    let their_lkid = parser::primitive::u32(src).ok()?;
    let exflags = parser::primitive::u32(src).ok()?;
    let mut iflags = parser::primitive::u32(src).ok()?;
    let raw_state = parser::primitive::u8(src).ok()?;
    let grmode = Mode::from_i8(parser::primitive::i8(src).ok()?)?;
    let rqmode = Mode::from_i8(parser::primitive::i8(src).ok()?)?;
    let lvbseq = parser::primitive::u32(src).ok()?;
    let lvb = match parser::primitive::u8(src).ok()? {
        0 => None,
        _ => {
            let wire = parser::primitive::array::<{ crate::message_types::LVB_LEN }>(src).ok()?;
            Some(ls.lvb_from_wire(&wire))
        }
    };
    let range = match parser::primitive::u8(src).ok()? {
        0 => None,
        _ => {
            let mut range = [0u64; 4];
            for bound in range.iter_mut() {
                *bound = parser::primitive::u64(src).ok()?;
            }
            Some(range)
        }
    };
    let mut state = LkbState::from_u8(raw_state)?;

    if let Some(existing) = find_by_remid(ls, rsb, nodeid, their_lkid) {
        tracing::debug!(ls = %ls.name, nodeid, remid = their_lkid, "lock already rebuilt");
        return Some((existing, their_lkid));
    }

    let mut grmode = grmode;
    let mut rqmode = rqmode;
    if iflags & IFL_LQCONVERT != 0 {
        // Mid-conversion on the old master. It resumes granted at its old
        // mode; the owner resends the conversion itself.
        iflags &= !IFL_LQCONVERT;
        if grmode == Mode::Iv {
            grmode = derive_conversion_grmode(ls, rsb);
        }
        rqmode = Mode::Iv;
        state = LkbState::Granted;
    }

    let (lkid, lkb_ref) = ls.lkbs.create();
    rsb.hold();
    {
        let mut body = rsb.body();
        let mut lkb = lkb_ref.lock().expect("lkb poisoned");
        lkb.remid = their_lkid;
        lkb.nodeid = Some(nodeid);
        lkb.exflags = exflags;
        lkb.iflags = IFL_MSTCPY | (iflags & IFL_VALBLK);
        lkb.grmode = grmode;
        lkb.rqmode = rqmode;
        lkb.lvbseq = lvbseq;
        lkb.lvb = lvb;
        lkb.range = range;
        lkb.resource = Some(rsb.clone());
        lkb_enqueue(&mut body, &ls.lkbs, &mut lkb, state);
        if lkb.iflags & IFL_VALBLK != 0 {
            drop(lkb);
            recover::lvb_recover_body(ls, &mut body);
        }
    }
    Some((lkid, their_lkid))
}

/// Owner side: the new master returned our locks' new ids.
pub fn receive_lkids(ls: &Arc<Lockspace>, nodeid: u32, data: &[u8]) {
    let mut src = Cursor::new(data);
    let mut count = 0;
    while let (Ok(master_lkid), Ok(our_lkid)) = (
        parser::primitive::u32(&mut src),
        parser::primitive::u32(&mut src),
    ) {
        if let Some(lkb_ref) = ls.lkbs.get(our_lkid) {
            let mut lkb = lkb_ref.lock().expect("lkb poisoned");
            lkb.remid = master_lkid;
            lkb.nodeid = Some(nodeid);
        }
        count += 1;
    }
    ls.lkids_received.fetch_add(count, Ordering::SeqCst);
    tracing::debug!(ls = %ls.name, nodeid, count, "received new lock ids");
    ls.wait_notify.notify_waiters();
}
