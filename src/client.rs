//! Line-oriented client shell and bench harness, grounded in
//! `original_source/Task2/program/kvclient.py`. Carries no clock, no trace
//! emission, and no mutex awareness -- it only ever speaks the stream line
//! protocol to whichever node it's pointed at.

use std::time::{Duration, Instant};

use clap::Subcommand;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Send one raw command to a single node, by index into `--nodes`.
    Cmd {
        #[arg(long)]
        node: usize,
        command: String,
    },
    /// Fire two commands at two different nodes concurrently.
    Race { cmd_a: String, cmd_b: String },
    /// GET the same key from every configured node.
    Getall { key: String },
    /// Fire a mix of random GET/PUT at random nodes and report latency.
    Bench {
        #[arg(long, default_value_t = 50)]
        ops: usize,
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 0.3)]
        put_ratio: f64,
    },
    /// Interactive REPL reading commands from stdin.
    Repl,
}

/// Sends one line and reads one line back, reporting round-trip latency.
pub async fn send_line(addr: &str, command: &str) -> anyhow::Result<(String, Duration)> {
    let start = Instant::now();
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(command.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await?;
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    tokio::time::timeout(CLIENT_TIMEOUT, reader.read_line(&mut line)).await??;
    Ok((line.trim_end().to_string(), start.elapsed()))
}

pub async fn action_cmd(nodes: &[String], node: usize, command: &str) -> anyhow::Result<()> {
    let addr = nodes.get(node).ok_or_else(|| anyhow::anyhow!("no node at index {node}"))?;
    let (reply, dt) = send_line(addr, command).await?;
    println!("[{addr}] {command} -> {reply} ({:.2} ms)", dt.as_secs_f64() * 1000.0);
    Ok(())
}

/// Fires `cmd_a` at `nodes[0]` and `cmd_b` at `nodes[1]` concurrently --
/// the canonical race demo for observing whether concurrent writes
/// converge under the mutex or diverge without it.
pub async fn action_race(nodes: &[String], cmd_a: &str, cmd_b: &str) -> anyhow::Result<()> {
    anyhow::ensure!(nodes.len() >= 2, "need at least 2 nodes for a race");
    let (addr_a, addr_b) = (nodes[0].clone(), nodes[1].clone());
    let (cmd_a_owned, cmd_b_owned) = (cmd_a.to_string(), cmd_b.to_string());
    let task_a = tokio::spawn(async move { send_line(&addr_a, &cmd_a_owned).await });
    let task_b = tokio::spawn(async move { send_line(&addr_b, &cmd_b_owned).await });
    let (result_a, result_b) = tokio::join!(task_a, task_b);
    report_race_leg(&nodes[0], cmd_a, result_a?);
    report_race_leg(&nodes[1], cmd_b, result_b?);
    Ok(())
}

fn report_race_leg(addr: &str, command: &str, result: anyhow::Result<(String, Duration)>) {
    match result {
        Ok((reply, dt)) => {
            println!("[{addr}] {command} -> {reply} ({:.2} ms)", dt.as_secs_f64() * 1000.0)
        }
        Err(err) => println!("[{addr}] {command} -> ERR: {err}"),
    }
}

pub async fn action_getall(nodes: &[String], key: &str) -> anyhow::Result<()> {
    for addr in nodes {
        let (reply, dt) = send_line(addr, &format!("GET {key}")).await?;
        println!("[{addr}] GET {key} -> {reply} ({:.2} ms)", dt.as_secs_f64() * 1000.0);
    }
    Ok(())
}

pub async fn action_bench(nodes: &[String], ops: usize, key: &str, put_ratio: f64) -> anyhow::Result<()> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut latencies = Vec::with_capacity(ops);
    let (mut puts, mut gets) = (0usize, 0usize);
    for i in 0..ops {
        let addr = &nodes[rng.gen_range(0..nodes.len())];
        let command = if rng.gen_bool(put_ratio) {
            puts += 1;
            format!("PUT {key} v{i}")
        } else {
            gets += 1;
            format!("GET {key}")
        };
        let (_, dt) = send_line(addr, &command).await?;
        latencies.push(dt.as_secs_f64() * 1000.0);
    }
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p50 = latencies[latencies.len() / 2];
    let p99 = latencies[(latencies.len() * 99 / 100).min(latencies.len() - 1)];
    println!("ops={ops} puts={puts} gets={gets} p50={p50:.2}ms p99={p99:.2}ms");
    Ok(())
}

pub async fn action_repl(nodes: &[String]) -> anyhow::Result<()> {
    use tokio::io::{stdin, AsyncBufReadExt as _, BufReader as TokioBufReader};
    println!("Type: GET <key> | PUT <key> <value> | help");
    let mut lines = TokioBufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("help") {
            println!("Commands: GET <key> | PUT <key> <value>");
            continue;
        }
        match send_line(&nodes[0], line).await {
            Ok((reply, _)) => println!("{reply}"),
            Err(err) => println!("ERR: {err}"),
        }
    }
    Ok(())
}
