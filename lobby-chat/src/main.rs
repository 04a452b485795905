use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use lobby_chat::{
    cli::{Cli, Command},
    client,
    config::ServerConfig,
    master::Master,
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
        Command::Master(args) => {
            let config = ServerConfig::from_args(args)?;
            let master = Master::bind(config).await?;
            let addr = master.local_addr()?;
            info!("master listening on {}", addr);
            if let Err(err) = master.run_until_ctrl_c().await {
                warn!("master exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
