use gossipkv::{config::NodeArgs, dispatcher};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = NodeArgs::parse();
    let handle = dispatcher::start(&args).await?;

    tokio::select! {
        result = handle.stream_server => result??,
        result = handle.gossip_sender => result??,
        result = handle.gossip_receiver => result??,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
