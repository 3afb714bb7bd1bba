use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use rendezvous_relay::{
    cli::{Cli, Command},
    client,
    relay::{LISTEN_BACKLOG, Relay, RelayConfig},
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
        Command::Serve(args) => serve(RelayConfig::from(args)).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(config: RelayConfig) -> Result<()> {
    let buffer_size = config.buffer_size;
    let idle_timeout = config.idle_timeout;
    let notify_disconnect = config.notify_disconnect;
    let legacy_second_role = config.legacy_second_role;

    let relay = Relay::bind(config)?;
    let addr = relay.local_addr()?;
    info!(
        backlog = LISTEN_BACKLOG,
        buffer_size,
        ?idle_timeout,
        notify_disconnect,
        legacy_second_role,
        "pairing relay listening on {addr}"
    );

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay stopped after a listener failure: {err:?}");
        return Err(err);
    }
    info!("relay stopped; all sessions closed");
    Ok(())
}
