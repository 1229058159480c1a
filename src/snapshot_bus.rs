//! The externally visible view of the engine.
//!
//! Producers replace whole values; publishers read immutable `Arc`s and
//! ask per channel whether there is something worth sending.

use crate::error::{EnvoyError, Result};
use crate::historic_counters::EnergyCounters;
use crate::model::{MeterKind, Phase};
use crate::poll_scheduler::{DeviceInventory, EventLog, InverterList};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    pub power: f64,
    pub current: f64,
    pub voltage: f64,
    pub power_react: f64,
    pub power_apparent: f64,
    pub power_factor: f64,
    pub frequency: f64,
    #[serde(flatten)]
    pub counters: EnergyCounters,
    pub energy_forward: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_reverse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub power: f64,
    pub current: f64,
    pub voltage: f64,
    pub power_react: f64,
    pub power_apparent: f64,
    #[serde(flatten)]
    pub counters: EnergyCounters,
    pub energy_forward: f64,
    /// Only the grid meter has a reverse direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_reverse: Option<f64>,
    #[serde(flatten)]
    pub phases: BTreeMap<Phase, PhaseSnapshot>,
}

/// Merged instantaneous and energy view of all meters for one stream sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub captured_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meters: BTreeMap<MeterKind, MeterSnapshot>,
}

impl Snapshot {
    pub fn meter(&self, kind: MeterKind) -> Option<&MeterSnapshot> {
        self.meters.get(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Meters,
    Devices,
    Inverters,
    Events,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Meters,
        Channel::Devices,
        Channel::Inverters,
        Channel::Events,
    ];
}

/// Whether a channel sends every pass or only when its value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    #[default]
    OnChange,
    Always,
}

impl PublishMode {
    /// Accepts `on_change`/`always` and the legacy `0`/`1` flags.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "on_change" | "on-change" | "onchange" => Some(PublishMode::OnChange),
            "1" | "always" => Some(PublishMode::Always),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Meters(Arc<Snapshot>),
    Devices(Arc<DeviceInventory>),
    Inverters(Arc<InverterList>),
    Events(Arc<EventLog>),
}

impl ChannelValue {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelValue::Meters(_) => Channel::Meters,
            ChannelValue::Devices(_) => Channel::Devices,
            ChannelValue::Inverters(_) => Channel::Inverters,
            ChannelValue::Events(_) => Channel::Events,
        }
    }

    /// Content equality; the capture time of a snapshot does not count.
    fn same_content(&self, other: &ChannelValue) -> bool {
        match (self, other) {
            (ChannelValue::Meters(a), ChannelValue::Meters(b)) => a.meters == b.meters,
            (ChannelValue::Devices(a), ChannelValue::Devices(b)) => a == b,
            (ChannelValue::Inverters(a), ChannelValue::Inverters(b)) => a == b,
            (ChannelValue::Events(a), ChannelValue::Events(b)) => a == b,
            _ => false,
        }
    }
}

struct Slot {
    mode: PublishMode,
    current: ArcSwapOption<ChannelValue>,
    published: Mutex<Option<Arc<ChannelValue>>>,
}

impl Slot {
    fn new(mode: PublishMode) -> Self {
        Self {
            mode,
            current: ArcSwapOption::empty(),
            published: Mutex::new(None),
        }
    }

    fn should_publish(
        &self,
        current: &ChannelValue,
        published: &Option<Arc<ChannelValue>>,
    ) -> bool {
        match (self.mode, published) {
            (PublishMode::Always, _) => true,
            (PublishMode::OnChange, None) => true,
            (PublishMode::OnChange, Some(previous)) => !previous.same_content(current),
        }
    }
}

/// Latest value per channel plus what each channel last published.
pub struct SnapshotBus {
    slots: BTreeMap<Channel, Slot>,
}

impl Default for SnapshotBus {
    fn default() -> Self {
        Self::new([])
    }
}

impl SnapshotBus {
    /// Channels not listed publish on change.
    pub fn new(modes: impl IntoIterator<Item = (Channel, PublishMode)>) -> Self {
        let mut slots: BTreeMap<Channel, Slot> = Channel::ALL
            .into_iter()
            .map(|channel| (channel, Slot::new(PublishMode::default())))
            .collect();
        for (channel, mode) in modes {
            slots.insert(channel, Slot::new(mode));
        }
        Self { slots }
    }

    fn slot(&self, channel: Channel) -> &Slot {
        // Every channel is inserted by `new`.
        &self.slots[&channel]
    }

    pub fn mode(&self, channel: Channel) -> PublishMode {
        self.slot(channel).mode
    }

    /// Atomically replaces the value of the channel `value` belongs to.
    pub fn publish(&self, value: ChannelValue) {
        self.slot(value.channel()).current.store(Some(Arc::new(value)));
    }

    pub fn publish_snapshot(&self, snapshot: Snapshot) {
        self.publish(ChannelValue::Meters(Arc::new(snapshot)));
    }

    /// The latest snapshot, or [`EnvoyError::NotReady`] before the first
    /// stream sample was processed.
    pub fn latest(&self) -> Result<Arc<Snapshot>> {
        match self.current(Channel::Meters).as_deref() {
            Some(ChannelValue::Meters(snapshot)) => Ok(snapshot.clone()),
            _ => Err(EnvoyError::NotReady),
        }
    }

    pub fn current(&self, channel: Channel) -> Option<Arc<ChannelValue>> {
        self.slot(channel).current.load_full()
    }

    /// True when the channel has a value and its publish mode says it
    /// should go out. Does not mark anything as published.
    pub fn has_changed(&self, channel: Channel) -> bool {
        let slot = self.slot(channel);
        let Some(current) = slot.current.load_full() else {
            return false;
        };
        match slot.published.lock() {
            Ok(published) => slot.should_publish(&current, &published),
            Err(_) => true,
        }
    }

    /// Returns the value to publish, if any, and records it as published.
    pub fn take_changed(&self, channel: Channel) -> Option<Arc<ChannelValue>> {
        let slot = self.slot(channel);
        let current = slot.current.load_full()?;
        let mut published = slot.published.lock().ok()?;
        if !slot.should_publish(&current, &published) {
            return None;
        }
        *published = Some(current.clone());
        Some(current)
    }
}
