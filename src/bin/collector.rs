use std::{sync::Arc, time::Duration};

use clap::Parser;
use gossipkv::{collector::Collector, config::CollectorArgs};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CollectorArgs::parse();
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.tcp)).await?;
    info!(tcp = args.tcp, "collector listening");

    let collector = Arc::new(Collector::new());
    let period = Duration::from_secs_f64(args.interval_secs);

    let accept_collector = collector.clone();
    let accept = tokio::spawn(async move { accept_collector.run_accept(listener).await });
    let printer_collector = collector.clone();
    let printer = tokio::spawn(async move { printer_collector.run_printer(period).await });

    tokio::select! {
        result = accept => result??,
        _ = printer => {}
    }
    Ok(())
}
