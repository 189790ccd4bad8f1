//! Recovery comms: the `Recover`/`RecoverReply` side-channel.
//!
//! Recovery messages bypass the request queue (status probes must work
//! while a lockspace is stopped). Synchronous exchanges are serialised
//! through a single slot per lockspace; the correlation id matches the
//! reply back to the waiting sender. Messages to ourselves travel the
//! normal comms loopback, so there is one code path for both cases.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;
use tokio::sync::Notify;

use crate::dir::pack_names_page;
use crate::lockspace::{
    Lockspace, LSFL_ALL_DIR_VALID, LSFL_ALL_NODES_VALID, LSFL_DIR_VALID, LSFL_NODES_VALID,
};
use crate::message_types::{Body, Command, Frame, RecoverCmd, RecoverMessage};
use crate::recover;

struct Pending {
    msgid: u32,
    reply: Option<RecoverMessage>,
}

/// Per-lockspace state of the synchronous exchange slot.
pub struct RcomState {
    msgid: AtomicU32,
    slot: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Pending>>,
    notify: Notify,
}

impl RcomState {
    pub fn new() -> Self {
        Self {
            msgid: AtomicU32::new(0),
            slot: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn next_msgid(&self) -> u32 {
        self.msgid.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn take_reply(&self) -> Option<RecoverMessage> {
        let mut pending = self.pending.lock().expect("rcom poisoned");
        let slot = pending.as_mut()?;
        let reply = slot.reply.take()?;
        *pending = None;
        Some(reply)
    }
}

/// Sends a recovery request and waits for its reply. Aborts with `Err` when
/// a new stop event interrupts the recovery this exchange belongs to.
pub async fn send_and_wait(
    ls: &Arc<Lockspace>,
    nodeid: u32,
    subcmd: RecoverCmd,
    data: Vec<u8>,
) -> Result<Vec<u8>, ()> {
    let _slot = ls.rcom.slot.lock().await;
    let msgid = ls.rcom.next_msgid();
    *ls.rcom.pending.lock().expect("rcom poisoned") = Some(Pending {
        msgid,
        reply: None,
    });
    ls.send_recover(
        nodeid,
        Command::Recover,
        RecoverMessage {
            msgid,
            subcmd: subcmd as u8,
            data,
        },
    );

    let period = Duration::from_secs(ls.config.recover_timer_secs.max(1));
    loop {
        let notified = ls.rcom.notify.notified();
        if let Some(reply) = ls.rcom.take_reply() {
            return Ok(reply.data);
        }
        if ls.recovery_stopped() {
            *ls.rcom.pending.lock().expect("rcom poisoned") = None;
            return Err(());
        }
        let _ = tokio::time::timeout(period, notified).await;
    }
}

/// Reserves a correlation id. Callers record it in their own bookkeeping
/// *before* sending so a fast reply cannot race the registration.
pub fn alloc_msgid(ls: &Arc<Lockspace>) -> u32 {
    ls.rcom.next_msgid()
}

/// Fire-and-forget recovery request; the reply (if any) is routed by
/// correlation id through the asynchronous handlers. Returns the msgid.
pub fn send_async(ls: &Arc<Lockspace>, nodeid: u32, subcmd: RecoverCmd, data: Vec<u8>) -> u32 {
    let msgid = ls.rcom.next_msgid();
    send_async_msgid(ls, nodeid, subcmd, data, msgid);
    msgid
}

/// [`send_async`] with a pre-allocated correlation id.
pub fn send_async_msgid(
    ls: &Arc<Lockspace>,
    nodeid: u32,
    subcmd: RecoverCmd,
    data: Vec<u8>,
    msgid: u32,
) {
    ls.send_recover(
        nodeid,
        Command::Recover,
        RecoverMessage {
            msgid,
            subcmd: subcmd as u8,
            data,
        },
    );
}

fn status_byte(ls: &Lockspace) -> u8 {
    let mut status = 0;
    if ls.test_flag(LSFL_NODES_VALID) {
        status |= recover::STS_NODES_VALID;
    }
    if ls.test_flag(LSFL_ALL_NODES_VALID) {
        status |= recover::STS_ALL_NODES_VALID;
    }
    if ls.test_flag(LSFL_DIR_VALID) {
        status |= recover::STS_DIR_VALID;
    }
    if ls.test_flag(LSFL_ALL_DIR_VALID) {
        status |= recover::STS_ALL_DIR_VALID;
    }
    status
}

fn handle_request(ls: &Arc<Lockspace>, nodeid: u32, msg: &RecoverMessage) -> Option<RecoverMessage> {
    let subcmd = RecoverCmd::from_u8(msg.subcmd)?;
    if ls.recovery_stopped() && subcmd != RecoverCmd::Status {
        tracing::debug!(ls = %ls.name, nodeid, ?subcmd, "recovery message ignored while stopped");
        return None;
    }
    match subcmd {
        RecoverCmd::Status => Some(RecoverMessage {
            msgid: msg.msgid,
            subcmd: msg.subcmd,
            data: vec![status_byte(ls)],
        }),
        RecoverCmd::Names => {
            if !ls.test_flag(LSFL_NODES_VALID) {
                tracing::debug!(ls = %ls.name, nodeid, "names request before membership settled");
                return None;
            }
            let members = ls.members.lock().expect("members poisoned").nodes().to_vec();
            let max = ls.config.buffer_size.saturating_sub(32);
            let page = pack_names_page(&ls.rsbs, &members, nodeid, &msg.data, max);
            Some(RecoverMessage {
                msgid: msg.msgid,
                subcmd: msg.subcmd,
                data: page,
            })
        }
        RecoverCmd::NewMaster => {
            let master = ls.dir.lookup(&msg.data, nodeid);
            let mut data = [0u8; 4];
            LittleEndian::write_u32(&mut data, master);
            Some(RecoverMessage {
                msgid: msg.msgid,
                subcmd: msg.subcmd,
                data: data.to_vec(),
            })
        }
        RecoverCmd::Locks => {
            if let Some(lkids) = crate::remaster::receive_locks(ls, nodeid, &msg.data) {
                send_async(ls, nodeid, RecoverCmd::LockIds, lkids);
            }
            None
        }
        RecoverCmd::LockIds => {
            crate::remaster::receive_lkids(ls, nodeid, &msg.data);
            None
        }
        RecoverCmd::Remove => {
            ls.dir.remove(&msg.data, nodeid);
            None
        }
    }
}

fn handle_reply(ls: &Arc<Lockspace>, nodeid: u32, msg: RecoverMessage) {
    {
        let mut pending = ls.rcom.pending.lock().expect("rcom poisoned");
        if let Some(slot) = pending.as_mut() {
            if slot.msgid == msg.msgid {
                slot.reply = Some(msg);
                drop(pending);
                ls.rcom.notify.notify_one();
                return;
            }
        }
    }
    match RecoverCmd::from_u8(msg.subcmd) {
        Some(RecoverCmd::NewMaster) => recover::master_reply(ls, msg.msgid, &msg.data),
        other => {
            tracing::debug!(ls = %ls.name, nodeid, ?other, msgid = msg.msgid, "stale recovery reply")
        }
    }
}

/// Entry point for inbound `Recover`/`RecoverReply` frames.
pub fn process_message(ls: &Arc<Lockspace>, nodeid: u32, frame: Frame) {
    let Body::Recover(msg) = frame.body else {
        return;
    };
    match frame.header.cmd {
        Command::Recover => {
            if let Some(reply) = handle_request(ls, nodeid, &msg) {
                ls.send_recover(nodeid, Command::RecoverReply, reply);
            }
        }
        Command::RecoverReply => handle_reply(ls, nodeid, msg),
        _ => {}
    }
}
