//! Transfer daemon entry point.

mod app;
mod config;
mod requests;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tardis=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting transfer daemon");

    let config = config::Config::load(std::env::args_os().nth(1).map(Into::into))?;
    tracing::info!(
        locations = config.locations.len(),
        hosts = config.hosts.len(),
        workers = config.workers,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("transfer daemon shut down cleanly");
    Ok(())
}
