//! Stream-endpoint request handling and replication fan-out: one task
//! per accepted connection, each handling exactly one command before
//! closing.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::NodeArgs,
    gossip::Gossip,
    mutex::{self, MutexCoordinator, MutexMode},
    net::{self, Command, Peer},
    store::Store,
    trace::{Stage, TraceSink},
};

const REPLICATION_TIMEOUT: Duration = Duration::from_millis(400);

pub struct Node {
    pub id: u8,
    pub peers: Vec<Peer>,
    pub mutex_mode: MutexMode,
    pub clock: Clock,
    pub store: Store,
    pub gossip: Arc<Gossip>,
    pub coordinator: MutexCoordinator,
    pub trace: TraceSink,
}

/// A running node plus the background tasks that keep it alive, returned
/// by [`start`] so both `gossipkv-node`'s `main` and integration tests can
/// wait on the same handles.
pub struct NodeHandle {
    pub node: Arc<Node>,
    pub stream_server: JoinHandle<anyhow::Result<()>>,
    pub gossip_sender: JoinHandle<anyhow::Result<()>>,
    pub gossip_receiver: JoinHandle<anyhow::Result<()>>,
}

/// Builds a [`Node`] from parsed [`NodeArgs`] and spawns its stream server
/// and gossip tasks, matching the wiring `gossipkv-node`'s `main` performs.
pub async fn start(args: &NodeArgs) -> anyhow::Result<NodeHandle> {
    let peers = args.resolve_peers()?;
    let self_index = args.id as usize - 1;
    let bind_stream: SocketAddr = format!("0.0.0.0:{}", args.tcp).parse()?;
    let bind_datagram: SocketAddr = format!("0.0.0.0:{}", args.udp).parse()?;

    let gossip = Gossip::bind(args.id, bind_datagram, peers.clone()).await?;
    let node = Arc::new(Node {
        id: args.id,
        peers,
        mutex_mode: args.mutex_mode(),
        clock: Clock::new(self_index, args.num_nodes),
        store: Store::new(),
        gossip: gossip.clone(),
        coordinator: MutexCoordinator::new(),
        trace: TraceSink::new(args.id, args.collector_addr()?),
    });

    let listener = TcpListener::bind(bind_stream).await?;
    info!(id = args.id, tcp = args.tcp, udp = args.udp, mutex = ?node.mutex_mode, "node starting");

    let stream_server = tokio::spawn(node.clone().run_stream_server(listener));
    let gossip_sender = tokio::spawn(gossip.clone().run_sender());
    let gossip_receiver = tokio::spawn(gossip.clone().run_receiver());

    Ok(NodeHandle { node, stream_server, gossip_sender, gossip_receiver })
}

impl Node {
    /// Binds the stream endpoint and serves connections forever, spawning
    /// one short-lived handler task per accepted connection.
    pub async fn run_stream_server(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(err) = node.handle_connection(stream).await {
                    warn!(%err, %peer_addr, "connection handler failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();

        let response = match net::parse_command(line) {
            Ok(command) => self.dispatch(command).await,
            Err(_) => "ERR".to_string(),
        };
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        Ok(())
    }

    async fn dispatch(&self, command: Command) -> String {
        match command {
            Command::Get { key } => self.handle_get(&key),
            Command::Put { key, value } => {
                self.handle_put(&key, &value).await;
                "OK".to_string()
            }
            Command::ReplPut { key, value, lamport, vector } => {
                self.handle_repl_put(&key, &value, lamport, &vector);
                "OK".to_string()
            }
            Command::LockReq { node_id } => match self.coordinator.req(node_id) {
                mutex::ReqOutcome::Granted => "GRANTED".to_string(),
                mutex::ReqOutcome::Queued => "QUEUED".to_string(),
            },
            Command::LockRel { node_id } => {
                self.coordinator.rel(node_id);
                "OK".to_string()
            }
        }
    }

    fn handle_get(&self, key: &str) -> String {
        let snap = self.clock.tick_local();
        self.trace.emit(Stage::Get, key, &snap);
        self.store.get_or_nil(key)
    }

    /// The full client-initiated PUT path: optional mutex acquisition,
    /// local apply, replication fan-out, optional mutex release.
    async fn handle_put(&self, key: &str, value: &str) {
        if self.mutex_mode == MutexMode::Enabled {
            let snap = self.clock.tick_local();
            self.trace.emit(Stage::MutexReq, key, &snap);
            mutex::acquire(self.id, &self.gossip, &self.coordinator).await;
            let snap = self.clock.tick_local();
            self.trace.emit(Stage::MutexGot, key, &snap);
        }

        let snap = self.clock.tick_local();
        self.trace.emit(Stage::ApplyLocal, format!("{key}={value}"), &snap);
        self.store.put(key, value);

        let snap = self.clock.tick_local();
        self.trace.emit(Stage::ReplSend, format!("{key}={value}"), &snap);
        self.replicate(key, value, snap.lamport, &snap.vector).await;

        if self.mutex_mode == MutexMode::Enabled {
            let snap = self.clock.tick_local();
            mutex::release(self.id, &self.gossip, &self.coordinator).await;
            self.trace.emit(Stage::MutexRel, key, &snap);
        }
    }

    fn handle_repl_put(&self, key: &str, value: &str, lamport: u64, vector: &[u64]) {
        let snap = self.clock.merge(lamport, vector);
        self.trace.emit(Stage::ReplRecv, format!("{key}={value}"), &snap);
        self.store.put(key, value);
    }

    /// Fans out REPL_PUT to every other known peer over a fresh
    /// connection, bounded per-peer timeout, failures ignored. Targets
    /// the peer table snapshot at REPL_SEND time; peers currently DEAD
    /// are still attempted.
    async fn replicate(&self, key: &str, value: &str, lamport: u64, vector: &[u64]) {
        let line = Command::repl_put_line(key, value, lamport, vector);
        let targets: Vec<SocketAddr> =
            self.peers.iter().filter(|p| p.id != self.id).map(|p| p.stream_addr).collect();
        let mut tasks = Vec::with_capacity(targets.len());
        for addr in targets {
            let line = line.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = net::send_request(addr, &line, REPLICATION_TIMEOUT).await {
                    debug!(%err, %addr, "replication to peer failed, ignored");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::Gossip;

    fn peers() -> Vec<Peer> {
        vec![Peer {
            id: 1,
            stream_addr: "127.0.0.1:18001".parse().unwrap(),
            datagram_addr: "127.0.0.1:19001".parse().unwrap(),
        }]
    }

    async fn single_node(mode: MutexMode) -> Node {
        let gossip = Gossip::bind(1, "127.0.0.1:0".parse().unwrap(), peers()).await.unwrap();
        Node {
            id: 1,
            peers: peers(),
            mutex_mode: mode,
            clock: Clock::new(0, 1),
            store: Store::new(),
            gossip,
            coordinator: MutexCoordinator::new(),
            trace: TraceSink::new(1, "127.0.0.1:1".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn get_on_empty_store_returns_nil() {
        let node = single_node(MutexMode::Disabled).await;
        assert_eq!(node.handle_get("color"), crate::store::NIL);
    }

    #[tokio::test]
    async fn put_without_mutex_applies_locally() {
        let node = single_node(MutexMode::Disabled).await;
        node.handle_put("color", "blue").await;
        assert_eq!(node.store.get("color").as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn put_with_mutex_self_leader_grants_and_releases() {
        let node = single_node(MutexMode::Enabled).await;
        node.handle_put("color", "blue").await;
        assert_eq!(node.store.get("color").as_deref(), Some("blue"));
        assert_eq!(node.coordinator.held_by(), None);
    }

    #[tokio::test]
    async fn repl_put_merges_clock_and_applies() {
        let node = single_node(MutexMode::Disabled).await;
        node.handle_repl_put("color", "red", 10, &[1]);
        assert_eq!(node.store.get("color").as_deref(), Some("red"));
        assert!(node.clock.snapshot().lamport > 10);
    }

    #[tokio::test]
    async fn stale_repl_put_after_newer_local_put_is_dropped() {
        let node = single_node(MutexMode::Disabled).await;
        node.handle_put("color", "blue").await;
        std::thread::sleep(std::time::Duration::from_millis(2));
        // a replication carrying a causally-prior write arrives after the
        // newer local put already applied: LWW by local apply-time rejects
        // it -- this is an accepted limitation, not a bug.
        node.handle_repl_put("color", "red", 1, &[1]);
        // nothing here asserts which wins deterministically beyond "the
        // store never panics and holds one of the two values" -- exact
        // winner depends on Instant ordering, which this test doesn't
        // control; see store::tests for the deterministic LWW check.
        assert!(matches!(node.store.get("color").as_deref(), Some("blue") | Some("red")));
    }
}
