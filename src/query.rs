//! Local introspection of locks and their resources.
//!
//! Answers come from this node's own state: authoritative for resources
//! mastered here, the process-copy view otherwise.

use std::sync::Arc;

use crate::lkb::LkbState;
use crate::lockspace::Lockspace;
use crate::mode::Mode;
use crate::rsb::MasterState;

/// One lock as seen on a resource queue.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub lkid: u32,
    pub remid: u32,
    /// Holder node for master copies, master node for local locks.
    pub nodeid: Option<u32>,
    pub grmode: Mode,
    pub rqmode: Mode,
    pub state: LkbState,
    pub master_copy: bool,
}

/// A resource and the contents of its queues.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub name: Vec<u8>,
    pub master: MasterState,
    pub grant_queue: Vec<LockInfo>,
    pub convert_queue: Vec<LockInfo>,
    pub wait_queue: Vec<LockInfo>,
    pub lvbseq: u32,
}

fn queue_info(ls: &Lockspace, queue: &[u32], state: LkbState) -> Vec<LockInfo> {
    queue
        .iter()
        .filter_map(|lkid| {
            let lkb = ls.lkbs.get(*lkid)?;
            let lkb = lkb.lock().expect("lkb poisoned");
            Some(LockInfo {
                lkid: *lkid,
                remid: lkb.remid,
                nodeid: lkb.nodeid,
                grmode: lkb.grmode,
                rqmode: lkb.rqmode,
                state,
                master_copy: lkb.is_mstcpy(),
            })
        })
        .collect()
}

/// Queue contents of the resource a held lock is bound to.
pub fn query_lock(ls: &Arc<Lockspace>, lkid: u32) -> Option<ResourceInfo> {
    let lkb = ls.lkbs.get(lkid)?;
    let rsb = lkb.lock().expect("lkb poisoned").resource.clone()?;
    let body = rsb.body();
    Some(ResourceInfo {
        name: rsb.name.clone(),
        master: body.master,
        grant_queue: queue_info(ls, &body.grant_queue, LkbState::Granted),
        convert_queue: queue_info(ls, &body.convert_queue, LkbState::Convert),
        wait_queue: queue_info(ls, &body.wait_queue, LkbState::Waiting),
        lvbseq: body.lvbseq,
    })
}

/// Queue contents of a resource by name, if this node knows it.
pub fn query_resource(ls: &Arc<Lockspace>, name: &[u8]) -> Option<ResourceInfo> {
    let rsb = ls.rsbs.get(name)?;
    let body = rsb.body();
    Some(ResourceInfo {
        name: rsb.name.clone(),
        master: body.master,
        grant_queue: queue_info(ls, &body.grant_queue, LkbState::Granted),
        convert_queue: queue_info(ls, &body.convert_queue, LkbState::Convert),
        wait_queue: queue_info(ls, &body.wait_queue, LkbState::Waiting),
        lvbseq: body.lvbseq,
    })
}
