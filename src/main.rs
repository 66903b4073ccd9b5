use tracing_subscriber::EnvFilter;

use solarflux::TelemetryPlane;
use solarflux::config::SolarfluxConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("solarflux=debug")),
        )
        .init();

    let config_path =
        std::env::var("SOLARFLUX_CONFIG").unwrap_or_else(|_| "./solarflux.toml".to_string());
    let mut config = SolarfluxConfig::load(&config_path)?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }

    let plane = TelemetryPlane::connect(&config).await?;
    tracing::info!("telemetry plane connected to store");

    plane.spawn_background_engines(&config);
    tracing::info!("background engines started");

    // No work is accepted over this process's lifetime boundary: on ctrl-c
    // the engines stop with the runtime and the pool drains in-flight
    // acquisitions before closing.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    plane.pool.close().await;

    Ok(())
}
