use anyhow::Result;
use clap::Parser;
use tracing::info;

use central_mutex::{cli::Cli, simulation::Simulation};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.simulation_config();
    info!(
        usage = ?config.protocol.usage,
        retry = ?config.protocol.retry_interval,
        spawn = ?config.spawn_interval,
        rotation = ?config.rotation_interval,
        handoff = ?config.handoff,
        "starting simulation"
    );

    let simulation = Simulation::start(config, cli.strategy()).await?;
    let cluster = simulation.run_until_ctrl_c().await;
    info!(
        uses = cluster.resource().uses(),
        violations = cluster.resource().violations(),
        "simulation finished"
    );

    Ok(())
}
