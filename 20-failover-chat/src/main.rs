use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use failover_chat::{
    cli::{Cli, Command},
    client,
    config::NodeConfig,
    node::Node,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Primary(args) => serve(args.listen, args.node_config()).await?,
        Command::Backup(args) => serve(args.listen, args.node_config()).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(listen: std::net::SocketAddr, config: NodeConfig) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    let node = Node::new(listener, config);
    let addr = node.local_addr()?;
    info!(role = %node.handle().role(), "node listening on {}", addr);
    if let Err(err) = node.run_until_ctrl_c().await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
