//! Fire-and-forget trace emission to the external collector. Every
//! instrumented stage ships one JSON line over a fresh stream connection;
//! failures are swallowed so instrumentation never blocks or fails a user
//! operation.

use std::{
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tracing::debug;

use crate::clock::Snapshot;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

/// Stage tags the node emits, verbatim, at each point of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Get,
    MutexReq,
    MutexGot,
    ApplyLocal,
    ReplSend,
    MutexRel,
    ReplRecv,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Get => "GET",
            Stage::MutexReq => "MUTEX_REQ",
            Stage::MutexGot => "MUTEX_GOT",
            Stage::ApplyLocal => "APPLY_LOCAL",
            Stage::ReplSend => "REPL_SEND",
            Stage::MutexRel => "MUTEX_REL",
            Stage::ReplRecv => "REPL_RECV",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TraceEvent {
    pub node: u8,
    pub stage: &'static str,
    pub op: String,
    pub phy_ts: f64,
    pub lamport: u64,
    pub vector: Vec<u64>,
}

impl TraceEvent {
    pub fn new(node: u8, stage: Stage, op: impl Into<String>, clock: &Snapshot) -> Self {
        Self {
            node,
            stage: stage.as_str(),
            op: op.into(),
            phy_ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            lamport: clock.lamport,
            vector: clock.vector.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TraceSink {
    node: u8,
    collector: SocketAddr,
}

impl TraceSink {
    pub fn new(node: u8, collector: SocketAddr) -> Self {
        Self { node, collector }
    }

    /// Emits one stage's event. Never returns an error to the caller,
    /// so a slow or unreachable collector never blocks the request path.
    pub fn emit(&self, stage: Stage, op: impl Into<String>, clock: &Snapshot) {
        let event = TraceEvent::new(self.node, stage, op, clock);
        let collector = self.collector;
        tokio::spawn(async move {
            if let Err(err) = send_event(collector, &event).await {
                debug!(%err, "trace event dropped");
            }
        });
    }
}

async fn send_event(collector: SocketAddr, event: &TraceEvent) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(collector)).await??;
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn event_serializes_to_documented_shape() {
        let clock = Clock::new(0, 2);
        let snap = clock.tick_local();
        let event = TraceEvent::new(1, Stage::ApplyLocal, "color=blue", &snap);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["node"], 1);
        assert_eq!(json["stage"], "APPLY_LOCAL");
        assert_eq!(json["op"], "color=blue");
        assert_eq!(json["lamport"], 1);
        assert_eq!(json["vector"][0], 1);
    }
}
