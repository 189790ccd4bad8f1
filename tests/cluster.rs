//! Multi-node scenarios over the in-process hub transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use dlm::comms::Hub;
use dlm::config::Config;
use dlm::flags::{LKF_NOQUEUE, LKF_VALBLK, SBF_VALNOTVALID};
use dlm::{Dlm, LockArgs, LockStatus, LockspaceHandle, Mode, Status};

fn test_config() -> Config {
    Config {
        recover_timer_secs: 1,
        scan_secs: 1,
        toss_secs: 600,
        lock_timeout_secs: 0,
        deadlock_secs: 0,
        ..Config::default()
    }
}

struct Node {
    _dlm: Dlm,
    ls: LockspaceHandle,
}

struct Caller {
    events: mpsc::UnboundedReceiver<LockStatus>,
    basts: Arc<std::sync::Mutex<Vec<(u32, Mode)>>>,
    ast: dlm::CompletionFn,
    bast: dlm::BlockingFn,
}

fn caller() -> Caller {
    let (tx, rx) = mpsc::unbounded_channel();
    let basts = Arc::new(std::sync::Mutex::new(Vec::new()));
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
        tokio::time::timeout(Duration::from_secs(20), self.events.recv())
            .await
            .expect("completion timed out")
            .expect("completion channel closed")
    }

    fn args(&self, name: &[u8], mode: Mode, flags: u32) -> LockArgs {
        LockArgs {
            mode,
            flags,
            name: name.to_vec(),
            range: None,
            lvb: None,
            ast: self.ast.clone(),
            bast: Some(self.bast.clone()),
        }
    }
}

/// Brings up `count` nodes (ids 1..=count) sharing one lockspace, runs the
/// initial membership round and waits until locking is enabled everywhere.
async fn cluster(count: u32) -> (Arc<Hub>, Vec<Node>) {
    let hub = Hub::new();
    let mut nodes = Vec::new();
    for nodeid in 1..=count {
        let dlm = Dlm::new(nodeid, test_config());
        let transport = hub.attach(nodeid, dlm.inbound_sender());
        dlm.attach_transport(transport);
        let ls = dlm.new_lockspace("fs", 32, 0).unwrap();
        nodes.push(Node { _dlm: dlm, ls });
    }
    let members: Vec<u32> = (1..=count).collect();
    reconfigure(&nodes, 1, &members).await;
    (hub, nodes)
}

/// Pushes one full stop/start/finish round to `nodes` and waits for
/// locking to resume. The start with id 1 is the initial one (no stop).
async fn reconfigure(nodes: &[Node], event_id: u32, members: &[u32]) {
    if event_id > 1 {
        for node in nodes {
            node.ls.stop().await;
        }
    }
    for node in nodes {
        node.ls.start(event_id, members.to_vec());
    }
    for node in nodes {
        let mut done = node.ls.start_done();
        tokio::time::timeout(Duration::from_secs(30), async {
            while *done.borrow() < event_id {
                done.changed().await.unwrap();
            }
        })
        .await
        .expect("start never completed");
    }
    for node in nodes {
        node.ls.finish(event_id);
    }
    for node in nodes {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !node.ls.running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("locking never resumed");
    }
}

#[tokio::test]
async fn single_node_grant_and_unlock() {
    let (_hub, nodes) = cluster(1).await;
    let mut caller = caller();

    let lkid = nodes[0]
        .ls
        .request(caller.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    assert_eq!(caller.next().await.status, Status::Ok);

    // A second EX with NOQUEUE fails immediately.
    let mut second = self::caller();
    let failed = nodes[0]
        .ls
        .request(second.args(b"r", Mode::Ex, LKF_NOQUEUE))
        .await
        .unwrap();
    let status = second.next().await;
    assert_eq!(status.lkid, failed);
    assert_eq!(status.status, Status::TryFailed);

    // Without NOQUEUE it parks until the first is unlocked.
    let waiting = nodes[0]
        .ls
        .request(second.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    nodes[0].ls.unlock(lkid, 0, None).await.unwrap();
    assert_eq!(caller.next().await.status, Status::Unlocked);
    let granted = second.next().await;
    assert_eq!(granted.lkid, waiting);
    assert_eq!(granted.status, Status::Ok);
}

#[tokio::test]
async fn cross_node_contention_and_grant_message() {
    let (_hub, nodes) = cluster(2).await;
    let mut on_a = caller();
    let mut on_b = caller();

    let a_lkid = nodes[0]
        .ls
        .request(on_a.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    assert_eq!(on_a.next().await.status, Status::Ok);

    // B's request travels to the master and parks there.
    let b_lkid = nodes[1]
        .ls
        .request(on_b.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly one node masters the resource.
    let a_info = nodes[0].ls.query_resource(b"r").unwrap();
    let b_info = nodes[1].ls.query_resource(b"r").unwrap();
    assert!(matches!(a_info.master, dlm::MasterState::Local));
    assert!(matches!(b_info.master, dlm::MasterState::Remote(1)));

    nodes[0].ls.unlock(a_lkid, 0, None).await.unwrap();
    assert_eq!(on_a.next().await.status, Status::Unlocked);
    let granted = on_b.next().await;
    assert_eq!(granted.lkid, b_lkid);
    assert_eq!(granted.status, Status::Ok);
}

#[tokio::test]
async fn blocking_notification_crosses_nodes() {
    let (_hub, nodes) = cluster(2).await;
    let mut on_a = caller();
    let mut on_b = caller();

    let a_lkid = nodes[0]
        .ls
        .request(on_a.args(b"r", Mode::Pr, 0))
        .await
        .unwrap();
    assert_eq!(on_a.next().await.status, Status::Ok);

    let _b_lkid = nodes[1]
        .ls
        .request(on_b.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let basts = on_a.basts.lock().unwrap().clone();
    assert_eq!(basts, vec![(a_lkid, Mode::Ex)]);
}

#[tokio::test]
async fn lvb_travels_between_nodes() {
    let (_hub, nodes) = cluster(2).await;
    let mut writer = caller();
    let mut reader = caller();

    let mut args = writer.args(b"r", Mode::Ex, LKF_VALBLK);
    args.lvb = Some(vec![0x11; 32]);
    let held = nodes[0].ls.request(args).await.unwrap();
    assert_eq!(writer.next().await.status, Status::Ok);
    nodes[0]
        .ls
        .unlock(held, LKF_VALBLK, Some(vec![0x2a; 32]))
        .await
        .unwrap();
    assert_eq!(writer.next().await.status, Status::Unlocked);

    let _read = nodes[1]
        .ls
        .request(reader.args(b"r", Mode::Pr, LKF_VALBLK))
        .await
        .unwrap();
    let status = reader.next().await;
    assert_eq!(status.status, Status::Ok);
    assert_eq!(status.lvb.as_deref(), Some(&vec![0x2a; 32][..]));
}

#[tokio::test]
async fn master_failure_remasters_surviving_locks() {
    let (hub, nodes) = cluster(3).await;
    let mut on_a = caller();
    let mut on_b = caller();

    // Node 1 masters "r" (it asks first); node 2 holds a process copy.
    let _a_lkid = nodes[0]
        .ls
        .request(on_a.args(b"r", Mode::Cr, 0))
        .await
        .unwrap();
    assert_eq!(on_a.next().await.status, Status::Ok);
    let b_lkid = nodes[1]
        .ls
        .request(on_b.args(b"r", Mode::Cr, 0))
        .await
        .unwrap();
    assert_eq!(on_b.next().await.status, Status::Ok);

    // Node 1 dies; 2 and 3 recover without it.
    hub.detach(1);
    reconfigure(&nodes[1..], 2, &[2, 3]).await;

    // B's granted state survived onto a new master.
    let info = nodes[1].ls.query_lock(b_lkid).expect("lock survived");
    let held: Vec<_> = info
        .grant_queue
        .iter()
        .filter(|lock| !lock.master_copy)
        .collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].grmode, Mode::Cr);

    // The lock is fully operable: convert it up and unlock it.
    nodes[1]
        .ls
        .convert(b_lkid, Mode::Ex, 0, None, None)
        .await
        .unwrap();
    assert_eq!(on_b.next().await.status, Status::Ok);
    nodes[1].ls.unlock(b_lkid, 0, None).await.unwrap();
    assert_eq!(on_b.next().await.status, Status::Unlocked);

    // And node 3 can take an exclusive lock afterwards.
    let mut on_c = caller();
    let _c = nodes[2]
        .ls
        .request(on_c.args(b"r", Mode::Ex, 0))
        .await
        .unwrap();
    assert_eq!(on_c.next().await.status, Status::Ok);
}

#[tokio::test]
async fn crashed_writer_invalidates_lvb() {
    let (hub, nodes) = cluster(2).await;
    let mut writer = caller();
    let mut survivor = caller();

    let mut args = writer.args(b"r", Mode::Ex, LKF_VALBLK);
    args.lvb = Some(vec![0x01; 32]);
    let _held = nodes[0].ls.request(args).await.unwrap();
    assert_eq!(writer.next().await.status, Status::Ok);

    let b_lkid = nodes[1]
        .ls
        .request(survivor.args(b"r", Mode::Nl, LKF_VALBLK))
        .await
        .unwrap();
    assert_eq!(survivor.next().await.status, Status::Ok);

    // The writer crashes before anyone read its block.
    hub.detach(1);
    reconfigure(&nodes[1..], 2, &[2]).await;

    // Only NL holders remain: the block is zeroed and flagged.
    nodes[1]
        .ls
        .convert(b_lkid, Mode::Pw, LKF_VALBLK, None, None)
        .await
        .unwrap();
    let status = survivor.next().await;
    assert_eq!(status.status, Status::Ok);
    assert_ne!(status.flags & SBF_VALNOTVALID, 0);
    assert_eq!(status.lvb.as_deref(), Some(&vec![0u8; 32][..]));
}

#[tokio::test]
async fn requests_during_recovery_proceed_after_finish() {
    let (_hub, nodes) = cluster(2).await;
    let mut on_b = caller();

    // Freeze the cluster, then fire a request into the stopped lockspace;
    // it must park and complete only after the finish.
    for node in &nodes {
        node.ls.stop().await;
    }
    let ls_b = nodes[1].ls.clone();
    let args = on_b.args(b"r", Mode::Ex, 0);
    let request = tokio::spawn(async move { ls_b.request(args).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!request.is_finished());

    for node in &nodes {
        node.ls.start(2, vec![1, 2]);
    }
    for node in &nodes {
        let mut done = node.ls.start_done();
        while *done.borrow() < 2 {
            done.changed().await.unwrap();
        }
    }
    for node in &nodes {
        node.ls.finish(2);
    }

    request.await.unwrap().unwrap();
    assert_eq!(on_b.next().await.status, Status::Ok);
}
