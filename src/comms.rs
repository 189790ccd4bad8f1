//! Inter-node message plumbing.
//!
//! The engine only ever *enqueues* outbound frames; a send task drains the
//! queue and pushes bytes through a [`Transport`]. Inbound frames arrive as
//! `(source nodeid, bytes)` pairs on a channel the node runtime reads.
//!
//! Two transports are provided: a TCP transport framing messages by their
//! header length field, and an in-process hub that wires nodes of one test
//! cluster directly together.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message_types::HEADER_LEN;

/// Inbound frame: source nodeid plus the raw bytes of one message.
pub type InboundFrame = (u32, Vec<u8>);
pub type InboundSender = mpsc::UnboundedSender<InboundFrame>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundFrame>;

/// Byte-moving backend under the send task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one framed message to `nodeid`. Ordering per peer must be
    /// preserved.
    async fn send(&self, nodeid: u32, frame: Vec<u8>) -> io::Result<()>;
}

/// Synchronous send facade handed to the engine.
#[derive(Clone)]
pub struct Comms {
    our_nodeid: u32,
    outbound: mpsc::UnboundedSender<InboundFrame>,
    /// Frames addressed to ourselves loop straight back to the dispatcher.
    inbound: InboundSender,
}

impl Comms {
    pub fn new(
        our_nodeid: u32,
        outbound: mpsc::UnboundedSender<InboundFrame>,
        inbound: InboundSender,
    ) -> Self {
        Self {
            our_nodeid,
            outbound,
            inbound,
        }
    }

    pub fn our_nodeid(&self) -> u32 {
        self.our_nodeid
    }

    /// Queues a frame. Failures surface when the send task observes them;
    /// the caller's lock state is recovered through the waiters table, not
    /// through this return path.
    pub fn send(&self, nodeid: u32, frame: Vec<u8>) {
        let result = if nodeid == self.our_nodeid {
            self.inbound.send((nodeid, frame))
        } else {
            self.outbound.send((nodeid, frame))
        };
        if result.is_err() {
            tracing::warn!(nodeid, "send queue closed, frame dropped");
        }
    }
}

/// Drains the outbound queue into the transport.
pub struct SendTask {
    outbound: mpsc::UnboundedReceiver<InboundFrame>,
    transport: Arc<dyn Transport>,
}

impl SendTask {
    pub fn spawn(
        outbound: mpsc::UnboundedReceiver<InboundFrame>,
        transport: Arc<dyn Transport>,
    ) -> JoinHandle<()> {
        tokio::spawn(
            Self {
                outbound,
                transport,
            }
            .run(),
        )
    }

    async fn run(mut self) {
        while let Some((nodeid, frame)) = self.outbound.recv().await {
            if let Err(err) = self.transport.send(nodeid, frame).await {
                // The waiters table resends after membership settles.
                tracing::warn!(nodeid, %err, "send failed");
            }
        }
    }
}

/// In-process switchboard connecting the nodes of one test cluster.
#[derive(Default)]
pub struct Hub {
    peers: Mutex<HashMap<u32, InboundSender>>,
}

impl Hub {
    pub fn new() -> Arc<Hub> {
        Arc::new(Hub::default())
    }

    /// Registers a node's inbound channel and returns its transport.
    pub fn attach(self: &Arc<Self>, nodeid: u32, inbound: InboundSender) -> Arc<HubTransport> {
        self.peers
            .lock()
            .expect("hub poisoned")
            .insert(nodeid, inbound);
        Arc::new(HubTransport {
            hub: self.clone(),
            our_nodeid: nodeid,
        })
    }

    /// Simulates a node crash: its frames go nowhere from now on.
    pub fn detach(&self, nodeid: u32) {
        self.peers.lock().expect("hub poisoned").remove(&nodeid);
    }
}

/// [`Transport`] backed by a [`Hub`].
pub struct HubTransport {
    hub: Arc<Hub>,
    our_nodeid: u32,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(&self, nodeid: u32, frame: Vec<u8>) -> io::Result<()> {
        let peer = self
            .hub
            .peers
            .lock()
            .expect("hub poisoned")
            .get(&nodeid)
            .cloned();
        match peer {
            Some(tx) => {
                // A receiver dropped mid-send is a crashed peer, not an error.
                let _ = tx.send((self.our_nodeid, frame));
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("node {nodeid} not attached"),
            )),
        }
    }
}

/// TCP transport: one connection per peer, established on first send.
pub struct TcpTransport {
    our_nodeid: u32,
    addrs: Mutex<HashMap<u32, SocketAddr>>,
    conns: tokio::sync::Mutex<HashMap<u32, OwnedWriteHalf>>,
    inbound: InboundSender,
}

impl TcpTransport {
    pub fn new(our_nodeid: u32, inbound: InboundSender) -> Arc<Self> {
        Arc::new(Self {
            our_nodeid,
            addrs: Mutex::new(HashMap::new()),
            conns: tokio::sync::Mutex::new(HashMap::new()),
            inbound,
        })
    }

    /// Records where a peer listens. Must happen before traffic to it.
    pub fn add_peer(&self, nodeid: u32, addr: SocketAddr) {
        self.addrs
            .lock()
            .expect("addrs poisoned")
            .insert(nodeid, addr);
    }

    /// Accept loop. Inbound connections are identified by the nodeid in
    /// their message headers, so no handshake is needed.
    pub fn listen(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        if let Err(err) = socket.set_nodelay(true) {
                            tracing::warn!(%err, "set_nodelay failed");
                        }
                        let (readhalf, _writehalf) = socket.into_split();
                        FrameReadTask::spawn(readhalf, transport.inbound.clone());
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        return;
                    }
                }
            }
        })
    }

    async fn connection(
        &self,
        conns: &mut HashMap<u32, OwnedWriteHalf>,
        nodeid: u32,
    ) -> io::Result<()> {
        if conns.contains_key(&nodeid) {
            return Ok(());
        }
        let addr = self
            .addrs
            .lock()
            .expect("addrs poisoned")
            .get(&nodeid)
            .copied()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {nodeid}"))
            })?;
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (readhalf, writehalf) = socket.into_split();
        FrameReadTask::spawn(readhalf, self.inbound.clone());
        conns.insert(nodeid, writehalf);
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, nodeid: u32, frame: Vec<u8>) -> io::Result<()> {
        let mut conns = self.conns.lock().await;
        self.connection(&mut conns, nodeid).await?;
        let conn = conns.get_mut(&nodeid).expect("connection just made");
        if let Err(err) = conn.write_all(&frame).await {
            conns.remove(&nodeid);
            return Err(err);
        }
        Ok(())
    }
}

/// Reads framed messages off one TCP connection and forwards them inbound.
pub struct FrameReadTask {
    readhalf: OwnedReadHalf,
    inbound: InboundSender,
}

impl FrameReadTask {
    pub fn spawn(readhalf: OwnedReadHalf, inbound: InboundSender) -> JoinHandle<()> {
        tokio::spawn(Self { readhalf, inbound }.run())
    }

    async fn run(mut self) {
        loop {
            let mut frame = vec![0u8; HEADER_LEN];
            if let Err(err) = self.readhalf.read_exact(&mut frame).await {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::debug!(%err, "connection closed");
                }
                return;
            }
            let length = LittleEndian::read_u16(&frame[12..14]) as usize;
            if length < HEADER_LEN {
                tracing::warn!(length, "malformed frame length, dropping connection");
                return;
            }
            let nodeid = LittleEndian::read_u32(&frame[8..12]);
            frame.resize(length, 0);
            if let Err(err) = self.readhalf.read_exact(&mut frame[HEADER_LEN..]).await {
                tracing::debug!(%err, "connection closed mid-frame");
                return;
            }
            if self.inbound.send((nodeid, frame)).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_routes_between_peers() {
        let hub = Hub::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let transport_a = hub.attach(1, tx_a);
        let _transport_b = hub.attach(2, tx_b);
        transport_a.send(2, vec![1, 2, 3]).await.unwrap();
        let (src, frame) = rx_b.recv().await.unwrap();
        assert_eq!(src, 1);
        assert_eq!(frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn hub_rejects_detached_peer() {
        let hub = Hub::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let transport_a = hub.attach(1, tx_a);
        let _transport_b = hub.attach(2, tx_b);
        hub.detach(2);
        assert!(transport_a.send(2, vec![0]).await.is_err());
    }

    #[tokio::test]
    async fn comms_loops_self_sends_back() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let comms = Comms::new(5, out_tx, in_tx);
        comms.send(5, vec![9]);
        let (src, frame) = in_rx.recv().await.unwrap();
        assert_eq!(src, 5);
        assert_eq!(frame, vec![9]);
    }
}
