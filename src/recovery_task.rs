//! The per-lockspace recovery worker.
//!
//! Consumes stop/start/finish events from the cluster manager, coalesces
//! whatever accumulated between runs into one action, and drives the
//! recovery phases. Runs with the lockspace's `in_recovery` writer held
//! (taken at stop time), so the lock engine is quiescent throughout.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::lockspace::{
    Lockspace, LsState, StartEvent, LSFL_ALL_DIR_VALID, LSFL_ALL_NODES_VALID, LSFL_FINISH,
    LSFL_NODES_VALID, LSFL_REQUEST_WARN, LSFL_START, LSFL_STOP,
};
use crate::recover;
use crate::requestqueue;
use crate::waiters;

/// One coalesced action for the worker.
#[derive(Debug)]
enum Move {
    Stop,
    Start(StartEvent),
    Finish(u32),
    FinishStop(u32),
    FinishStart(u32, StartEvent),
}

/// Collapses the events that arrived since the last run. Start events
/// superseded by a later stop are discarded.
fn next_move(ls: &Arc<Lockspace>) -> Option<Move> {
    let stop = ls.take_flag(LSFL_STOP);
    let start = ls.take_flag(LSFL_START);
    let finish = ls.take_flag(LSFL_FINISH);

    let (last_stop, last_finish, start_event) = {
        let mut recover = ls.recover.lock().expect("recover poisoned");
        let last_stop = recover.last_stop;
        let last_finish = recover.last_finish;
        let mut survivor: Option<StartEvent> = None;
        for event in recover.starts.drain(..) {
            if event.event_id <= last_stop {
                tracing::debug!(ls = %ls.name, event.event_id, "skip cancelled start");
            } else {
                survivor = Some(event);
            }
        }
        (last_stop, last_finish, survivor)
    };

    tracing::debug!(
        ls = %ls.name,
        stop,
        start,
        finish,
        "coalesce events"
    );

    match (stop, start, finish) {
        (false, false, false) => None,
        (false, false, true) => Some(Move::Finish(last_finish)),
        (false, true, false) => start_event.map(Move::Start),
        (true, false, false) => Some(Move::Stop),
        (true, false, true) => Some(Move::FinishStop(last_finish)),
        (true, true, false) => match start_event {
            Some(event) => Some(Move::Start(event)),
            None => Some(Move::Stop),
        },
        (true, true, true) => match start_event {
            Some(event) => Some(Move::FinishStart(last_finish, event)),
            None => Some(Move::FinishStop(last_finish)),
        },
        (false, true, true) => {
            // A finish and a start with no stop between them should not
            // happen; treat the start as authoritative.
            tracing::warn!(ls = %ls.name, "start and finish with no stop");
            start_event.map(Move::Start)
        }
    }
}

pub struct RecoveryTask {
    ls: Arc<Lockspace>,
}

impl RecoveryTask {
    pub fn spawn(ls: Arc<Lockspace>) -> JoinHandle<()> {
        tokio::spawn(Self { ls }.run())
    }

    async fn run(self) {
        loop {
            let notified = self.ls.recover_notify.notified();
            if let Some(action) = next_move(&self.ls) {
                self.dispatch(action).await;
                continue;
            }
            notified.await;
        }
    }

    async fn dispatch(&self, action: Move) {
        let ls = &self.ls;
        let cur_state = *ls.state.lock().expect("state poisoned");
        tracing::debug!(ls = %ls.name, ?cur_state, ?action, "recovery step");

        let next_state = match (cur_state, action) {
            (LsState::Init, Move::Start(event)) => match self.first_start(event).await {
                Ok(()) => Some(LsState::InitDone),
                Err(()) => None,
            },
            (LsState::Init, _) => None,

            (LsState::InitDone, Move::Stop | Move::FinishStop(_)) => Some(LsState::WaitStart),
            (LsState::InitDone, Move::Start(event) | Move::FinishStart(_, event)) => {
                Some(self.reconfig_state(event).await)
            }
            (LsState::InitDone, Move::Finish(event_id)) => {
                self.finish(event_id);
                Some(LsState::Clear)
            }

            (LsState::Clear, Move::Stop) => Some(LsState::WaitStart),
            (LsState::Clear, Move::Start(event)) => Some(self.reconfig_state(event).await),
            (LsState::Clear, _) => {
                tracing::warn!(ls = %ls.name, "unexpected finish while clear");
                None
            }

            (LsState::WaitStart, Move::Stop) => None,
            (LsState::WaitStart, Move::Start(event)) => Some(self.reconfig_state(event).await),
            (LsState::WaitStart, _) => {
                tracing::warn!(ls = %ls.name, "unexpected finish while waiting for start");
                None
            }

            (LsState::ReconfigDone, Move::Finish(event_id)) => {
                self.finish(event_id);
                Some(LsState::Clear)
            }
            (LsState::ReconfigDone, Move::Stop) => Some(LsState::WaitStart),
            (LsState::ReconfigDone, Move::FinishStop(event_id)) => {
                ls.members
                    .lock()
                    .expect("members poisoned")
                    .clear_finished(event_id);
                Some(LsState::WaitStart)
            }
            (LsState::ReconfigDone, Move::FinishStart(event_id, event)) => {
                ls.members
                    .lock()
                    .expect("members poisoned")
                    .clear_finished(event_id);
                Some(self.reconfig_state(event).await)
            }
            (LsState::ReconfigDone, Move::Start(event)) => {
                Some(self.reconfig_state(event).await)
            }
        };

        if let Some(next_state) = next_state {
            *ls.state.lock().expect("state poisoned") = next_state;
        }
    }

    async fn reconfig_state(&self, event: StartEvent) -> LsState {
        match self.reconfig(event).await {
            Ok(()) => LsState::ReconfigDone,
            Err(()) => LsState::WaitStart,
        }
    }

    /// The very first start: establish membership and our (empty) share of
    /// the directory.
    async fn first_start(&self, event: StartEvent) -> Result<(), ()> {
        let ls = &self.ls;
        tracing::info!(ls = %ls.name, event.event_id, "recover event (first)");
        {
            let mut members = ls.members.lock().expect("members poisoned");
            members.reconfig(event.event_id, &event.nodeids);
        }
        ls.set_flag(LSFL_NODES_VALID);
        self.nodes_wait().await?;
        recover::rebuild_directory(ls).await?;
        self.dir_wait().await?;
        ls.set_start_done(event.event_id);
        Ok(())
    }

    async fn nodes_wait(&self) -> Result<(), ()> {
        let ls = &self.ls;
        let low = ls.members.lock().expect("members poisoned").low_nodeid();
        if low == Some(ls.our_nodeid()) {
            recover::wait_status_all(ls, recover::STS_NODES_VALID).await?;
            ls.set_flag(LSFL_ALL_NODES_VALID);
        } else {
            recover::wait_status_low(ls, recover::STS_ALL_NODES_VALID).await?;
        }
        Ok(())
    }

    async fn dir_wait(&self) -> Result<(), ()> {
        let ls = &self.ls;
        let low = ls.members.lock().expect("members poisoned").low_nodeid();
        if low == Some(ls.our_nodeid()) {
            recover::wait_status_all(ls, recover::STS_DIR_VALID).await?;
            ls.set_flag(LSFL_ALL_DIR_VALID);
        } else {
            recover::wait_status_low(ls, recover::STS_ALL_DIR_VALID).await?;
        }
        Ok(())
    }

    /// The full reconfiguration: §4.5 phases on a non-first start.
    async fn reconfig(&self, event: StartEvent) -> Result<(), ()> {
        let ls = &self.ls;
        tracing::info!(ls = %ls.name, event.event_id, "recover event");

        // Drain the notification worker so no callback runs against the
        // state recovery is about to rewrite.
        ls.asts.drain_barrier().await;

        ls.lkids_expected.store(0, Ordering::SeqCst);
        ls.lkids_received.store(0, Ordering::SeqCst);
        ls.recover_list
            .lock()
            .expect("recover_list poisoned")
            .clear();

        let departed = {
            let mut members = ls.members.lock().expect("members poisoned");
            members.reconfig(event.event_id, &event.nodeids)
        };
        ls.set_flag(LSFL_NODES_VALID);
        self.nodes_wait().await?;

        recover::rebuild_directory(ls).await?;
        requestqueue::purge(ls);
        ls.set_flag(LSFL_REQUEST_WARN);
        self.dir_wait().await?;

        waiters::mark(ls);
        if ls.recovery_stopped() {
            ls.clear_flag(LSFL_REQUEST_WARN);
            return Err(());
        }

        if departed > 0 {
            recover::purge_locks(ls);
            recover::update_masters(ls).await?;
            crate::remaster::send_locks(ls).await?;
            recover::recover_lvbs(ls);
        }

        ls.clear_flag(LSFL_REQUEST_WARN);
        ls.set_start_done(event.event_id);
        Ok(())
    }

    /// All peers finished the start: unfreeze and work off the backlog.
    fn finish(&self, event_id: u32) {
        let ls = &self.ls;
        ls.members
            .lock()
            .expect("members poisoned")
            .clear_finished(event_id);

        if !ls.enable_locking(event_id) {
            return;
        }
        ls.asts.kick();
        if requestqueue::process(ls).is_err() {
            return;
        }
        waiters::resend(ls);
        recover::grant_after_purge(ls);
        ls.asts.kick();
        tracing::info!(ls = %ls.name, event_id, "recover event finished");
    }
}
