//! Process configuration: node id, ports, peer list, collector
//! address, total node count, mutex on/off -- all fixed at startup, no
//! persisted state.

use std::net::SocketAddr;

use clap::Parser;

use crate::{mutex::MutexMode, net::Peer};

#[derive(Debug, Parser)]
#[command(name = "gossipkv-node", about = "A gossip-mutex replicated key-value node")]
pub struct NodeArgs {
    /// This node's id, in [1..num_nodes].
    #[arg(long)]
    pub id: u8,

    /// Port for the stream endpoint (client + inter-node requests).
    #[arg(long)]
    pub tcp: u16,

    /// Port for the gossip datagram endpoint.
    #[arg(long)]
    pub udp: u16,

    /// Other peers as `host:tcp:udp=id` tokens, comma-separated. Self is
    /// added automatically if not present.
    #[arg(long, default_value = "")]
    pub peers: String,

    /// Trace collector address, `host:port`.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub collector: String,

    /// Total number of nodes in the cluster (sizes the vector clock).
    #[arg(long)]
    pub num_nodes: usize,

    /// Disable the distributed mutex, making PUT an unprotected write.
    #[arg(long, default_value_t = false)]
    pub no_mutex: bool,
}

impl NodeArgs {
    pub fn mutex_mode(&self) -> MutexMode {
        if self.no_mutex {
            MutexMode::Disabled
        } else {
            MutexMode::Enabled
        }
    }

    pub fn collector_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.collector.parse()?)
    }

    /// Parses `--peers` and ensures self is present, matching
    /// `original_source/Task2/program/kv.py::parse_peers` plus the
    /// self-insertion `Node.__init__` performs.
    pub fn resolve_peers(&self) -> anyhow::Result<Vec<Peer>> {
        let mut peers = parse_peers(&self.peers)?;
        if !peers.iter().any(|p| p.id == self.id) {
            peers.push(Peer {
                id: self.id,
                stream_addr: format!("127.0.0.1:{}", self.tcp).parse()?,
                datagram_addr: format!("127.0.0.1:{}", self.udp).parse()?,
            });
        }
        Ok(peers)
    }
}

fn parse_peers(raw: &str) -> anyhow::Result<Vec<Peer>> {
    let mut peers = Vec::new();
    if raw.is_empty() {
        return Ok(peers);
    }
    for token in raw.split(',') {
        let (hostports, id) = token
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("peer token {token:?} missing '=<id>'"))?;
        let parts: Vec<&str> = hostports.split(':').collect();
        let (host, tcp, udp) = match parts.as_slice() {
            [host, tcp] => (*host, tcp.parse::<u16>()?, tcp.parse::<u16>()? + 100),
            [host, tcp, udp] => (*host, tcp.parse::<u16>()?, udp.parse::<u16>()?),
            _ => anyhow::bail!("peer token {token:?} must be host:tcp or host:tcp:udp"),
        };
        peers.push(Peer {
            id: id.parse()?,
            stream_addr: format!("{host}:{tcp}").parse()?,
            datagram_addr: format!("{host}:{udp}").parse()?,
        });
    }
    Ok(peers)
}

#[derive(Debug, Parser)]
#[command(name = "gossipkv-collector", about = "Trace collector: prints physical/Lamport/vector orderings")]
pub struct CollectorArgs {
    #[arg(long, default_value_t = 9000)]
    pub tcp: u16,

    /// How often to print the buffered window, in seconds.
    #[arg(long, default_value_t = 3.0)]
    pub interval_secs: f64,
}

#[derive(Debug, Parser)]
#[command(name = "gossipkv-client", about = "Line-oriented client shell for a gossipkv cluster")]
pub struct ClientArgs {
    /// Cluster nodes as `host:port`, comma-separated, in node order.
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    #[command(subcommand)]
    pub action: crate::client::Action,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_tcp_id_inferring_udp() {
        let peers = parse_peers("127.0.0.1:8002=2").unwrap();
        assert_eq!(peers[0].id, 2);
        assert_eq!(peers[0].stream_addr.port(), 8002);
        assert_eq!(peers[0].datagram_addr.port(), 8102);
    }

    #[test]
    fn parses_host_tcp_udp_id_explicit() {
        let peers = parse_peers("127.0.0.1:8002:9002=2").unwrap();
        assert_eq!(peers[0].datagram_addr.port(), 9002);
    }

    #[test]
    fn parses_multiple_comma_separated_peers() {
        let peers = parse_peers("127.0.0.1:8002=2,127.0.0.1:8003=3").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].id, 3);
    }

    #[test]
    fn empty_peers_is_empty() {
        assert!(parse_peers("").unwrap().is_empty());
    }
}
