//! External trace collector, grounded in
//! `original_source/Task2/program/kv.py::Logger`: buffers events in memory
//! behind a mutex and periodically prints three orderings of the buffered
//! window. Not part of the node core -- nodes only need to agree on the
//! wire shape of `TraceEvent`.

use std::{
    sync::Mutex,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
    time::interval,
};
use tracing::debug;

#[derive(Debug, Clone, serde::Deserialize)]
struct RawEvent {
    node: u8,
    stage: String,
    op: String,
    phy_ts: f64,
    lamport: u64,
    vector: Vec<u64>,
}

pub struct Collector {
    events: Mutex<Vec<RawEvent>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    pub async fn run_accept(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            if let Err(err) = self.handle_connection(stream).await {
                debug!(%err, "collector connection dropped");
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let Ok(event) = serde_json::from_str::<RawEvent>(line.trim_end()) else {
            return Ok(());
        };
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    pub async fn run_printer(&self, period: Duration) {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let events = self.events.lock().unwrap().clone();
            if events.is_empty() {
                continue;
            }
            print!("{}", render_orderings(&events));
        }
    }
}

/// Renders the physical, Lamport, and vector-partial-order views of a
/// buffered window, matching `Logger._printer`'s three sections.
fn render_orderings(events: &[RawEvent]) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n================ TRACE (last {} events) ================\n", events.len()));

    out.push_str("-- Physical order --\n");
    for e in sorted_by_physical(events) {
        out.push_str(&format!(
            "t={:.6} L={:>3} V={:?} node={} {} {}\n",
            e.phy_ts, e.lamport, e.vector, e.node, e.stage, e.op
        ));
    }

    out.push_str("-- Lamport order --\n");
    for e in sorted_by_lamport(events) {
        out.push_str(&format!(
            "L={:>3} t={:.6} V={:?} node={} {} {}\n",
            e.lamport, e.phy_ts, e.vector, e.node, e.stage, e.op
        ));
    }

    out.push_str("-- Vector partial order (layers of concurrent sets) --\n");
    for (i, layer) in vector_layers(events).into_iter().enumerate() {
        let desc = layer
            .iter()
            .map(|e| format!("n{}:{}:{}@{:?}", e.node, e.stage, e.op, e.vector))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("Layer {}: {}\n", i + 1, desc));
    }
    out.push_str("======================================================\n");
    out
}

fn sorted_by_physical(events: &[RawEvent]) -> Vec<&RawEvent> {
    let mut sorted: Vec<&RawEvent> = events.iter().collect();
    sorted.sort_by(|a, b| {
        a.phy_ts
            .partial_cmp(&b.phy_ts)
            .unwrap()
            .then(a.node.cmp(&b.node))
            .then(a.lamport.cmp(&b.lamport))
    });
    sorted
}

fn sorted_by_lamport(events: &[RawEvent]) -> Vec<&RawEvent> {
    let mut sorted: Vec<&RawEvent> = events.iter().collect();
    sorted.sort_by(|a, b| a.lamport.cmp(&b.lamport).then(a.node.cmp(&b.node)));
    sorted
}

/// Repeatedly peels off the maximal antichain: events with no other
/// not-yet-placed event strictly before them under `<=` on vectors. Ports
/// `Logger._printer`'s layering loop.
fn vector_layers(events: &[RawEvent]) -> Vec<Vec<&RawEvent>> {
    let mut remaining: Vec<&RawEvent> = events.iter().collect();
    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let mut layer = Vec::new();
        let mut kept = Vec::new();
        for candidate in &remaining {
            let has_predecessor = remaining.iter().any(|other| {
                !std::ptr::eq(*other, *candidate) && crate::clock::vector_lt(&other.vector, &candidate.vector)
            });
            if has_predecessor {
                kept.push(*candidate);
            } else {
                layer.push(*candidate);
            }
        }
        if layer.is_empty() {
            break;
        }
        layers.push(layer);
        remaining = kept;
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(node: u8, lamport: u64, vector: Vec<u64>, ts: f64) -> RawEvent {
        RawEvent { node, stage: "APPLY_LOCAL".into(), op: "k=v".into(), phy_ts: ts, lamport, vector }
    }

    #[test]
    fn physical_order_ties_break_on_node_then_lamport() {
        let events = vec![event(2, 5, vec![0, 1], 1.0), event(1, 3, vec![1, 0], 1.0)];
        let sorted = sorted_by_physical(&events);
        assert_eq!(sorted[0].node, 1);
    }

    #[test]
    fn lamport_order_is_total() {
        let events = vec![event(1, 5, vec![1, 0], 2.0), event(2, 3, vec![0, 1], 1.0)];
        let sorted = sorted_by_lamport(&events);
        assert_eq!(sorted[0].lamport, 3);
    }

    #[test]
    fn vector_layers_group_concurrent_events() {
        let a = event(1, 1, vec![1, 0], 1.0);
        let b = event(2, 1, vec![0, 1], 1.0);
        let c = event(1, 2, vec![2, 0], 2.0);
        let events = vec![a, b, c];
        let layers = vector_layers(&events);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].len(), 2);
        assert_eq!(layers[1].len(), 1);
    }
}
