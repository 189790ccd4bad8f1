//! Helpers for unit tests that need a lockspace without a full node.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ast_task::AstQueue;
use crate::comms::Comms;
use crate::config::Config;
use crate::lockspace::{Lockspace, LSFL_NODES_VALID, LSFL_RUN, LsState};

/// A running single-member lockspace with no transport behind it. Sends go
/// nowhere; engine paths that stay local work normally.
pub async fn standalone_lockspace(nodeid: u32) -> Arc<Lockspace> {
    let (out_tx, _out_rx) = mpsc::unbounded_channel();
    let (in_tx, _in_rx) = mpsc::unbounded_channel();
    let comms = Comms::new(nodeid, out_tx, in_tx);
    let ls = Lockspace::new(
        "test",
        32,
        0,
        Arc::new(Config::default()),
        comms,
        AstQueue::new(),
    );
    ls.members.lock().unwrap().reconfig(1, &[nodeid]);
    ls.set_flag(LSFL_RUN | LSFL_NODES_VALID);
    *ls.state.lock().unwrap() = LsState::Clear;
    ls
}
