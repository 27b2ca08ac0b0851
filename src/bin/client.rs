use clap::Parser;
use gossipkv::{
    client::{action_bench, action_cmd, action_getall, action_race, action_repl, Action},
    config::ClientArgs,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    match args.action {
        Action::Cmd { node, command } => action_cmd(&args.nodes, node, &command).await,
        Action::Race { cmd_a, cmd_b } => action_race(&args.nodes, &cmd_a, &cmd_b).await,
        Action::Getall { key } => action_getall(&args.nodes, &key).await,
        Action::Bench { ops, key, put_ratio } => action_bench(&args.nodes, ops, &key, put_ratio).await,
        Action::Repl => action_repl(&args.nodes).await,
    }
}
