//! Independent polling of the gateway's JSON documents.
//!
//! Every resource carries its own interval and failure counter. The
//! historic counters are mandatory: they gate the energy accumulator, so
//! running out of retries on them stops the process. The optional
//! resources are best effort.

use crate::error::{EnvoyError, Result};
use crate::historic_counters::{HistoricCounterCache, HistoricCounters};
use crate::shutdown::Shutdown;
use crate::snapshot_bus::{ChannelValue, SnapshotBus};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Scheduler cadence.
pub const TICK: Duration = Duration::from_secs(1);
/// Consecutive historic counter failures tolerated before giving up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    HistoricCounters,
    DeviceInventory,
    InverterList,
    EventLog,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::HistoricCounters,
        ResourceKind::DeviceInventory,
        ResourceKind::InverterList,
        ResourceKind::EventLog,
    ];

    pub fn path(self) -> &'static str {
        match self {
            ResourceKind::HistoricCounters => "/production.json?details=1",
            ResourceKind::DeviceInventory => "/inventory.json",
            ResourceKind::InverterList => "/api/v1/production/inverters",
            ResourceKind::EventLog => "/datatab/event_dt.rb?start=0&length=10",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::HistoricCounters => "historic counters",
            ResourceKind::DeviceInventory => "device inventory",
            ResourceKind::InverterList => "inverter list",
            ResourceKind::EventLog => "event log",
        }
    }

    pub fn is_mandatory(self) -> bool {
        self == ResourceKind::HistoricCounters
    }
}

/// Fetches the raw JSON document behind a resource.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, resource: ResourceKind) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSettings {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    Idle,
    Due,
    Fetching,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    kind: ResourceKind,
    settings: ResourceSettings,
    phase: ResourcePhase,
    last_success: Option<Instant>,
    consecutive_failures: u32,
}

impl ResourceState {
    pub fn new(kind: ResourceKind, settings: ResourceSettings) -> Self {
        Self {
            kind,
            settings,
            phase: ResourcePhase::Idle,
            last_success: None,
            consecutive_failures: 0,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn phase(&self) -> ResourcePhase {
        self.phase
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Never fetched, or a full interval since the last success. Failures
    /// do not move `last_success`, so a failing resource stays due.
    pub fn is_due(&self, now: Instant) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match self.last_success {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.settings.interval,
        }
    }

    fn record_success(&mut self, at: Instant) {
        self.phase = ResourcePhase::Idle;
        self.last_success = Some(at);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.phase = ResourcePhase::Idle;
        self.consecutive_failures += 1;
    }
}

/// Inventory grouped by device type, then keyed by serial number.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInventory(pub BTreeMap<String, BTreeMap<String, DeviceStatus>>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename(deserialize = "device_status"))]
    pub status: Value,
    pub producing: bool,
    pub communicating: bool,
    pub provisioned: bool,
    pub operating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
struct RawDeviceGroup {
    #[serde(rename = "type")]
    device_type: String,
    devices: Vec<RawDevice>,
}

#[derive(Deserialize)]
struct RawDevice {
    serial_num: String,
    #[serde(flatten)]
    status: DeviceStatus,
}

impl DeviceInventory {
    pub fn group_name(device_type: &str) -> String {
        match device_type {
            "PCU" => "inverters".to_string(),
            "ACB" => "batteries".to_string(),
            "NSRB" => "relais".to_string(),
            other => other.to_string(),
        }
    }

    pub fn from_json(document: Value) -> Result<Self> {
        let groups: Vec<RawDeviceGroup> = serde_json::from_value(document)
            .map_err(|e| EnvoyError::decode(format!("inventory.json: {e}")))?;
        Ok(Self(
            groups
                .into_iter()
                .map(|group| {
                    let devices = group
                        .devices
                        .into_iter()
                        .map(|device| (device.serial_num, device.status))
                        .collect();
                    (Self::group_name(&group.device_type), devices)
                })
                .collect(),
        ))
    }
}

/// Last report per microinverter, keyed by serial number.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InverterList(pub BTreeMap<String, InverterReport>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterReport {
    #[serde(rename = "lastReportDate")]
    pub last_report_date: i64,
    #[serde(rename = "lastReportWatts")]
    pub last_report_watts: i64,
}

#[derive(Deserialize)]
struct RawInverter {
    #[serde(rename = "serialNumber")]
    serial_number: String,
    #[serde(flatten)]
    report: InverterReport,
}

impl InverterList {
    pub fn from_json(document: Value) -> Result<Self> {
        let inverters: Vec<RawInverter> = serde_json::from_value(document)
            .map_err(|e| EnvoyError::decode(format!("inverter list: {e}")))?;
        Ok(Self(
            inverters
                .into_iter()
                .map(|inverter| (inverter.serial_number, inverter.report))
                .collect(),
        ))
    }
}

/// Most recent gateway events, keyed by event id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventLog(pub BTreeMap<String, EventEntry>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub message: String,
    #[serde(rename = "serialNumber")]
    pub serial_number: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub datetime: String,
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl EventLog {
    /// Rows are `[id, message, serial, type, datetime]`.
    pub fn from_json(document: &Value) -> Result<Self> {
        let rows = document
            .get("aaData")
            .and_then(Value::as_array)
            .ok_or_else(|| EnvoyError::decode("event log has no aaData array"))?;

        let mut events = BTreeMap::new();
        for row in rows {
            let cells = row
                .as_array()
                .filter(|cells| cells.len() >= 5)
                .ok_or_else(|| EnvoyError::decode(format!("short event row: {row}")))?;
            events.insert(
                cell_text(&cells[0]),
                EventEntry {
                    message: cell_text(&cells[1]),
                    serial_number: cell_text(&cells[2]),
                    event_type: cell_text(&cells[3]),
                    datetime: cell_text(&cells[4]),
                },
            );
        }
        Ok(Self(events))
    }
}

/// Polls every enabled resource on its own cadence and hands the reshaped
/// results to the historic counter cache or the snapshot bus.
pub struct PollScheduler {
    fetcher: Arc<dyn ResourceFetcher>,
    resources: Vec<ResourceState>,
    historic: HistoricCounterCache,
    bus: Arc<SnapshotBus>,
    shutdown: Shutdown,
}

impl PollScheduler {
    /// The historic counters are always enabled; resources missing from
    /// `settings` are disabled.
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        settings: impl IntoIterator<Item = (ResourceKind, ResourceSettings)>,
        historic: HistoricCounterCache,
        bus: Arc<SnapshotBus>,
        shutdown: Shutdown,
    ) -> Self {
        let settings: BTreeMap<ResourceKind, ResourceSettings> = settings.into_iter().collect();
        let resources = ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let mut resource_settings =
                    settings.get(&kind).copied().unwrap_or(ResourceSettings {
                        enabled: false,
                        interval: Duration::from_secs(900),
                    });
                if kind.is_mandatory() {
                    resource_settings.enabled = true;
                }
                ResourceState::new(kind, resource_settings)
            })
            .collect();

        Self {
            fetcher,
            resources,
            historic,
            bus,
            shutdown,
        }
    }

    pub fn state(&self, kind: ResourceKind) -> Option<&ResourceState> {
        self.resources.iter().find(|resource| resource.kind == kind)
    }

    /// Spawns the scheduler loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut scheduler = self;
            scheduler.run().await;
        })
    }

    async fn run(&mut self) {
        for resource in &self.resources {
            if resource.settings.enabled {
                info!(
                    "Polling {} every {}s",
                    resource.kind.name(),
                    resource.settings.interval.as_secs()
                );
            }
        }

        while self.shutdown.is_running() {
            self.tick(Instant::now()).await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(TICK) => {}
            }
        }

        info!("Poll scheduler exiting");
    }

    /// Fetches every resource that is due at `now`. Returns the resources
    /// that were attempted.
    pub async fn tick(&mut self, now: Instant) -> Vec<ResourceKind> {
        let mut attempted = Vec::new();
        for index in 0..self.resources.len() {
            if !self.shutdown.is_running() {
                break;
            }
            if !self.resources[index].is_due(now) {
                continue;
            }
            self.resources[index].phase = ResourcePhase::Due;
            attempted.push(self.resources[index].kind);
            self.poll(index, now).await;
        }
        attempted
    }

    async fn poll(&mut self, index: usize, now: Instant) {
        let kind = self.resources[index].kind;
        self.resources[index].phase = ResourcePhase::Fetching;
        debug!("Fetching {}", kind.name());

        let result = match self.fetcher.fetch(kind).await {
            Ok(document) => self.apply(kind, document),
            Err(e) => Err(e),
        };

        let resource = &mut self.resources[index];
        match result {
            Ok(()) => {
                resource.record_success(now);
                info!("Fetched {}", kind.name());
            }
            Err(e) => {
                resource.record_failure();
                let failures = resource.consecutive_failures;
                if kind.is_mandatory() {
                    error!(
                        "{} fetch failed ({}/{}): {}",
                        kind.name(),
                        failures,
                        MAX_CONSECUTIVE_ERRORS,
                        e
                    );
                    if failures >= MAX_CONSECUTIVE_ERRORS {
                        self.shutdown.raise_fatal(format!(
                            "{} failed {} times in a row",
                            kind.name(),
                            failures
                        ));
                    }
                } else {
                    warn!("{} fetch failed, retrying next tick: {}", kind.name(), e);
                }
            }
        }
    }

    /// Reshapes the document and stores it where its consumers look.
    fn apply(&self, kind: ResourceKind, document: Value) -> Result<()> {
        match kind {
            ResourceKind::HistoricCounters => {
                self.historic
                    .replace(HistoricCounters::from_production_json(&document)?);
            }
            ResourceKind::DeviceInventory => {
                let inventory = DeviceInventory::from_json(document)?;
                self.bus.publish(ChannelValue::Devices(Arc::new(inventory)));
            }
            ResourceKind::InverterList => {
                let inverters = InverterList::from_json(document)?;
                self.bus.publish(ChannelValue::Inverters(Arc::new(inverters)));
            }
            ResourceKind::EventLog => {
                let events = EventLog::from_json(&document)?;
                self.bus.publish(ChannelValue::Events(Arc::new(events)));
            }
        }
        Ok(())
    }
}
