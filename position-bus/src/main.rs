use anyhow::Result;
use clap::Parser;
use tracing::warn;

use position_bus::{
    cli::{Cli, Command},
    publisher,
    server::PositionServer,
};

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.debug_logs());

    match cli.command {
        Command::Server(args) => {
            let server = PositionServer::new(args.into());
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Client(args) => publisher::run(args).await?,
    }

    Ok(())
}
