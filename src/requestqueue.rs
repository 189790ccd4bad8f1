//! Deferred inbound messages.
//!
//! Messages that arrive while a lockspace is stopped are parked here with
//! their sender and replayed in arrival order once recovery finishes.
//! Directory traffic from before the rebuild is invalid by then and gets
//! purged instead, as does anything from a departed node.

use std::sync::Arc;

use crate::lkb::WaitType;
use crate::lockspace::{Lockspace, QueuedRequest, LSFL_REQUEST_WARN};
use crate::message_types::{Body, Command, Frame};

/// Parks one message for replay after recovery.
pub fn add(ls: &Arc<Lockspace>, nodeid: u32, frame: Frame) {
    if ls.test_flag(LSFL_REQUEST_WARN) {
        tracing::warn!(ls = %ls.name, nodeid, "request during recovery");
    }
    if ls.members.lock().expect("members poisoned").in_gone(nodeid) {
        return;
    }
    tracing::debug!(ls = %ls.name, nodeid, cmd = ?frame.header.cmd, "defer request");
    ls.requestqueue
        .lock()
        .expect("requestqueue poisoned")
        .push_back(QueuedRequest { nodeid, frame });
}

/// True while replay should route fresh arrivals through the queue to keep
/// them ordered behind the deferred ones.
pub fn draining(ls: &Arc<Lockspace>) -> bool {
    !ls.requestqueue
        .lock()
        .expect("requestqueue poisoned")
        .is_empty()
}

/// Replays the queue in order. Stops early if the lockspace stops again.
pub fn process(ls: &Arc<Lockspace>) -> Result<usize, ()> {
    let mut count = 0;
    loop {
        let entry = ls
            .requestqueue
            .lock()
            .expect("requestqueue poisoned")
            .pop_front();
        let Some(entry) = entry else {
            break;
        };
        if !ls.running() {
            tracing::debug!(ls = %ls.name, "request replay interrupted");
            return Err(());
        }
        crate::proto::process_message(ls, entry.nodeid, entry.frame, true);
        count += 1;
    }
    tracing::info!(ls = %ls.name, count, "replayed held requests");
    Ok(count)
}

/// Drops queue entries the directory rebuild made meaningless.
pub fn purge(ls: &Arc<Lockspace>) {
    let members = ls.members.lock().expect("members poisoned");
    let mut queue = ls.requestqueue.lock().expect("requestqueue poisoned");
    let before = queue.len();
    queue.retain(|entry| {
        match entry.frame.header.cmd {
            // Directory state from the old epoch.
            Command::Lookup | Command::LookupReply | Command::Remove => return false,
            _ => {}
        }
        if members.in_gone(entry.nodeid) {
            return false;
        }
        // A reply parked for a lock that went back to master lookup is for
        // the old master and must not be replayed.
        if entry.frame.header.cmd.is_op_reply() {
            if let Body::Lock(msg) = &entry.frame.body {
                if let Some(lkb) = ls.lkbs.get(msg.remid) {
                    let lkb = lkb.lock().expect("lkb poisoned");
                    if lkb.wait_type == Some(WaitType::Lookup) {
                        return false;
                    }
                }
            }
        }
        true
    });
    tracing::info!(ls = %ls.name, purged = before - queue.len(), "purged requests");
}

/// Is a reply for `lkid` sitting in the queue?
pub fn reply_queued(ls: &Arc<Lockspace>, lkid: u32) -> bool {
    let queue = ls.requestqueue.lock().expect("requestqueue poisoned");
    queue.iter().any(|entry| {
        entry.frame.header.cmd.is_op_reply()
            && matches!(&entry.frame.body, Body::Lock(msg) if msg.remid == lkid)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_types::{Header, LockMessage, WIRE_VERSION};
    use crate::testutil::standalone_lockspace;

    fn frame(cmd: Command, remid: u32) -> Frame {
        Frame {
            header: Header {
                version: WIRE_VERSION,
                lockspace: 1,
                nodeid: 2,
                length: 0,
                cmd,
                flags: 0,
            },
            body: Body::Lock(LockMessage {
                remid,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn purge_drops_directory_traffic() {
        let ls = standalone_lockspace(1).await;
        ls.members.lock().unwrap().reconfig(1, &[1, 2]);
        add(&ls, 2, frame(Command::Lookup, 0));
        add(&ls, 2, frame(Command::Remove, 0));
        add(&ls, 2, frame(Command::Request, 0));
        purge(&ls);
        let queue = ls.requestqueue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].frame.header.cmd, Command::Request);
    }

    #[tokio::test]
    async fn messages_from_gone_nodes_are_dropped() {
        let ls = standalone_lockspace(1).await;
        ls.members.lock().unwrap().reconfig(1, &[1, 2, 3]);
        ls.members.lock().unwrap().reconfig(2, &[1, 2]);
        add(&ls, 3, frame(Command::Request, 0));
        assert!(ls.requestqueue.lock().unwrap().is_empty());
        add(&ls, 2, frame(Command::Request, 0));
        purge(&ls);
        assert_eq!(ls.requestqueue.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finds_queued_replies() {
        let ls = standalone_lockspace(1).await;
        ls.members.lock().unwrap().reconfig(1, &[1, 2]);
        add(&ls, 2, frame(Command::UnlockReply, 77));
        assert!(reply_queued(&ls, 77));
        assert!(!reply_queued(&ls, 78));
    }
}
