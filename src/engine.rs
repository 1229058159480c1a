use crate::config::{Config, Firmware};
use crate::energy_accumulator::EnergyAccumulator;
use crate::gateway_client::{GatewayAuth, GatewayClient, INSTALLER_USER, STREAM_PATH};
use crate::historic_counters::HistoricCounterCache;
use crate::persistence::{FileBackend, MemoryBackend, PersistenceStore, StateBackend};
use crate::poll_scheduler::PollScheduler;
use crate::shutdown::Shutdown;
use crate::snapshot_bus::{Channel, SnapshotBus};
use crate::stream_reader::StreamReader;
use crate::token_manager::{EnlightenIssuer, TokenManager, TokenSettings};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Wait before exiting after a fatal condition, so a supervisor restart
/// loop does not hammer the gateway.
pub const FATAL_COOL_DOWN: Duration = Duration::from_secs(60);

/// Every `NOT_READY_WARN_EVERY` seconds without a snapshot the not-ready
/// log line is raised to a warning.
const NOT_READY_WARN_EVERY: u64 = 15;

/// State shared by all workers.
#[derive(Clone)]
pub struct EngineState {
    pub historic: HistoricCounterCache,
    pub bus: Arc<SnapshotBus>,
    pub shutdown: Shutdown,
    pub tokens: Option<Arc<TokenManager>>,
}

/// Wires the workers together and owns their tasks.
pub struct Engine {
    state: EngineState,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Builds every component from `config` and starts the workers. With
    /// token firmware the first token check runs before anything talks to
    /// the gateway.
    pub async fn start(config: &Config, shutdown: Shutdown) -> anyhow::Result<Self> {
        info!("Initializing telemetry engine");

        let tokens = match config.firmware {
            Firmware::Token => {
                let issuer = EnlightenIssuer::new(
                    &config.token.login_url,
                    &config.token.token_url,
                    &config.token.username,
                    &config.token.password,
                    &config.token.serial,
                );
                let manager = Arc::new(TokenManager::new(
                    Box::new(issuer),
                    &config.token.token_file,
                    TokenSettings::default(),
                ));
                manager.check(Utc::now()).await;
                Some(manager)
            }
            Firmware::Legacy => None,
        };

        let auth = match &tokens {
            Some(manager) => GatewayAuth::Bearer(manager.clone()),
            None => GatewayAuth::Digest {
                username: INSTALLER_USER.to_string(),
                password: config.installer_password.clone(),
            },
        };
        let gateway = Arc::new(
            GatewayClient::new(config.base_url(), auth).context("Could not build HTTP client")?,
        );

        let state = EngineState {
            historic: HistoricCounterCache::new(),
            bus: Arc::new(SnapshotBus::new(config.publish_modes())),
            shutdown,
            tokens,
        };

        let fast: Box<dyn StateBackend> = match &config.fast_state_file {
            Some(path) => Box::new(FileBackend::new("fast tier", path)),
            None => Box::new(MemoryBackend::new("fast tier")),
        };
        let durable = Box::new(FileBackend::new("durable tier", &config.durable_state_file));
        let accumulator = EnergyAccumulator::new(
            PersistenceStore::new(fast, durable),
            config.accumulator_settings(),
        );

        let mut handles = Vec::new();
        if let Some(manager) = &state.tokens {
            handles.push(tokio::spawn(manager.clone().run(state.shutdown.clone())));
        }

        // The scheduler's first tick fetches everything that is enabled.
        let scheduler = PollScheduler::new(
            gateway.clone(),
            config.resource_settings(),
            state.historic.clone(),
            state.bus.clone(),
            state.shutdown.clone(),
        );
        handles.push(scheduler.spawn());

        let reader = StreamReader::new(
            gateway.clone(),
            accumulator,
            state.historic.clone(),
            state.bus.clone(),
            state.shutdown.clone(),
        );
        handles.push(reader.spawn());

        handles.push(tokio::spawn(log_publisher(
            state.bus.clone(),
            config.publish_interval,
            gateway.url(STREAM_PATH),
            state.shutdown.clone(),
        )));

        info!("All workers started");
        Ok(Self { state, handles })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn bus(&self) -> Arc<SnapshotBus> {
        self.state.bus.clone()
    }

    /// Waits until every worker has exited.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {e}");
            }
        }
    }
}

/// Stand-in consumer of the bus: logs every channel value its publish
/// mode lets through, and complains while no snapshot exists yet.
async fn log_publisher(
    bus: Arc<SnapshotBus>,
    interval: Duration,
    stream_url: String,
    shutdown: Shutdown,
) {
    let mut waited: u64 = 0;
    while shutdown.is_running() {
        if bus.latest().is_err() {
            waited += 1;
            if waited % NOT_READY_WARN_EVERY == 0 {
                warn!(
                    "No meter data after {waited}s. Check that {stream_url} answers, e.g. with curl"
                );
            } else {
                info!("Waiting for first meter snapshot");
            }
        }

        for channel in Channel::ALL {
            if let Some(value) = bus.take_changed(channel) {
                match serde_json::to_string(value.as_ref()) {
                    Ok(json) => debug!("{channel:?}: {json}"),
                    Err(e) => warn!("Could not serialize {channel:?}: {e}"),
                }
            }
        }

        let pause = if bus.latest().is_err() {
            Duration::from_secs(1)
        } else {
            interval
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }
}
