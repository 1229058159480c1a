use envoy_telemetry::engine::FATAL_COOL_DOWN;
use envoy_telemetry::{Config, Engine, Shutdown};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Enphase Envoy telemetry bridge");
    let config = Config::from_env()?;
    config.log_summary();

    let shutdown = Shutdown::new();
    let engine = Engine::start(&config, shutdown.clone()).await?;

    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.request_stop();
        }
    });

    engine.join().await;

    if shutdown.is_fatal() {
        error!(
            "Stopped after fatal error: {}. Exiting in {}s",
            shutdown.fatal_reason().unwrap_or_default(),
            FATAL_COOL_DOWN.as_secs()
        );
        tokio::time::sleep(FATAL_COOL_DOWN).await;
        std::process::exit(1);
    }

    info!("Envoy telemetry bridge stopped");
    Ok(())
}
