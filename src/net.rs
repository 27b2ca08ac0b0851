//! Wire formats and the small TCP helpers shared by the dispatcher,
//! replicator, mutex client, and trace sink. The stream protocol is
//! hand-tokenized text, not a serde format: commands are whitespace
//! tokenized and values are never escaped, so there is no schema to
//! derive here, unlike the gossip datagram and trace event.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

use crate::gossip::MembershipState;

/// One fully-resolved peer, including self.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: u8,
    pub stream_addr: SocketAddr,
    pub datagram_addr: SocketAddr,
}

/// A parsed command off the stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Put { key: String, value: String },
    ReplPut { key: String, value: String, lamport: u64, vector: Vec<u64> },
    LockReq { node_id: u8 },
    LockRel { node_id: u8 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("malformed {0} command")]
    Malformed(&'static str),
}

/// Parses one newline-stripped line per the stream line protocol. Anything
/// that doesn't match the grammar is a `ParseError`, which the dispatcher
/// turns into the bare `ERR` response.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let cmd = tokens.next().ok_or(ParseError::Empty)?;
    match cmd {
        "GET" => {
            let key = tokens.next().ok_or(ParseError::Malformed("GET"))?;
            if tokens.next().is_some() {
                return Err(ParseError::Malformed("GET"));
            }
            Ok(Command::Get { key: key.to_string() })
        }
        "PUT" => {
            let key = tokens.next().ok_or(ParseError::Malformed("PUT"))?.to_string();
            let rest: Vec<&str> = tokens.collect();
            if rest.is_empty() {
                return Err(ParseError::Malformed("PUT"));
            }
            Ok(Command::Put { key, value: rest.join(" ") })
        }
        "REPL_PUT" => {
            let key = tokens.next().ok_or(ParseError::Malformed("REPL_PUT"))?.to_string();
            let value = tokens.next().ok_or(ParseError::Malformed("REPL_PUT"))?.to_string();
            let lamport: u64 = tokens
                .next()
                .ok_or(ParseError::Malformed("REPL_PUT"))?
                .parse()
                .map_err(|_| ParseError::Malformed("REPL_PUT"))?;
            let rest: Vec<&str> = tokens.collect();
            if rest.is_empty() {
                return Err(ParseError::Malformed("REPL_PUT"));
            }
            let vector: Vec<u64> = serde_json::from_str(&rest.join(" "))
                .map_err(|_| ParseError::Malformed("REPL_PUT"))?;
            Ok(Command::ReplPut { key, value, lamport, vector })
        }
        "LOCK_REQ" => Ok(Command::LockReq { node_id: parse_node_id(&mut tokens, "LOCK_REQ")? }),
        "LOCK_REL" => Ok(Command::LockRel { node_id: parse_node_id(&mut tokens, "LOCK_REL")? }),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

fn parse_node_id<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    cmd: &'static str,
) -> Result<u8, ParseError> {
    let node_id: u8 = tokens
        .next()
        .ok_or(ParseError::Malformed(cmd))?
        .parse()
        .map_err(|_| ParseError::Malformed(cmd))?;
    if tokens.next().is_some() {
        return Err(ParseError::Malformed(cmd));
    }
    Ok(node_id)
}

impl Command {
    /// Renders a REPL_PUT line to fan out to peers, using the clock
    /// snapshot taken at REPL_SEND.
    pub fn repl_put_line(key: &str, value: &str, lamport: u64, vector: &[u64]) -> String {
        let vector_json = serde_json::to_string(vector).expect("vec<u64> always serializes");
        format!("REPL_PUT {key} {value} {lamport} {vector_json}\n")
    }
}

/// The gossip datagram message shape. Messages that don't deserialize to
/// this shape are dropped at the parser boundary rather than crashing the
/// receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigest {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: u8,
    pub heartbeat: u64,
    pub known: HashMap<String, KnownRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownRecord {
    pub state: MembershipState,
    pub hb: u64,
    pub addr: Option<(String, u16)>,
}

impl GossipDigest {
    pub const KIND: &'static str = "gossip";

    /// Drops anything not shaped like a gossip digest.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let digest: Self = serde_json::from_slice(buf).ok()?;
        if digest.kind != Self::KIND {
            return None;
        }
        Some(digest)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("GossipDigest always serializes")
    }
}

/// Opens a fresh connection, writes `request` (already newline-terminated),
/// and reads back one line. Used by the replicator and the mutex client --
/// both are one-shot request/response over the stream endpoint.
pub async fn send_request(
    addr: SocketAddr,
    request: &str,
    connect_timeout: Duration,
) -> anyhow::Result<String> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr)).await??;
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    timeout(connect_timeout, reader.read_line(&mut line)).await??;
    Ok(line.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get() {
        assert_eq!(parse_command("GET color"), Ok(Command::Get { key: "color".into() }));
    }

    #[test]
    fn parses_put_joining_multi_word_value() {
        assert_eq!(
            parse_command("PUT color dark blue"),
            Ok(Command::Put { key: "color".into(), value: "dark blue".into() })
        );
    }

    #[test]
    fn parses_repl_put() {
        assert_eq!(
            parse_command("REPL_PUT color blue 42 [1,2,3]"),
            Ok(Command::ReplPut {
                key: "color".into(),
                value: "blue".into(),
                lamport: 42,
                vector: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn parses_lock_commands() {
        assert_eq!(parse_command("LOCK_REQ 2"), Ok(Command::LockReq { node_id: 2 }));
        assert_eq!(parse_command("LOCK_REL 2"), Ok(Command::LockRel { node_id: 2 }));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_eq!(parse_command("PING"), Err(ParseError::Unknown("PING".into())));
        assert_eq!(parse_command("PUT onlykey"), Err(ParseError::Malformed("PUT")));
        assert_eq!(parse_command(""), Err(ParseError::Empty));
    }

    #[test]
    fn gossip_digest_round_trips() {
        let mut known = HashMap::new();
        known.insert(
            "2".to_string(),
            KnownRecord { state: MembershipState::Alive, hb: 7, addr: Some(("127.0.0.1".into(), 9002)) },
        );
        let digest = GossipDigest { kind: GossipDigest::KIND.into(), from: 1, heartbeat: 5, known };
        let decoded = GossipDigest::decode(&digest.encode()).unwrap();
        assert_eq!(decoded.from, 1);
        assert_eq!(decoded.heartbeat, 5);
    }

    #[test]
    fn gossip_digest_rejects_wrong_shape() {
        assert!(GossipDigest::decode(b"{\"not\":\"a digest\"}").is_none());
        assert!(GossipDigest::decode(b"not even json").is_none());
    }
}
