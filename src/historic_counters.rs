//! Cumulative energy counters polled from production.json and the cache
//! that gates the energy accumulator.

use crate::error::{EnvoyError, Result};
use crate::model::{MeterKind, Phase};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifetime and daily counters for one meter or one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounters {
    #[serde(rename = "whToday")]
    pub wh_today: f64,
    #[serde(rename = "vahToday")]
    pub vah_today: f64,
    #[serde(rename = "whLifetime")]
    pub wh_lifetime: f64,
    #[serde(rename = "vahLifetime")]
    pub vah_lifetime: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterCounters {
    pub total: EnergyCounters,
    pub phases: BTreeMap<Phase, EnergyCounters>,
}

/// The last successfully polled counters, keyed by meter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricCounters {
    pub meters: BTreeMap<MeterKind, MeterCounters>,
}

#[derive(Deserialize)]
struct RawMeasurement {
    #[serde(rename = "whLifetime")]
    wh_lifetime: f64,
    #[serde(rename = "vahLifetime")]
    vah_lifetime: f64,
    #[serde(rename = "whToday")]
    wh_today: f64,
    #[serde(rename = "vahToday")]
    vah_today: f64,
    #[serde(default)]
    lines: Vec<RawLine>,
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "whLifetime")]
    wh_lifetime: f64,
    #[serde(rename = "vahLifetime")]
    vah_lifetime: f64,
    #[serde(rename = "whToday")]
    wh_today: f64,
    #[serde(rename = "vahToday")]
    vah_today: f64,
}

impl From<&RawLine> for EnergyCounters {
    fn from(line: &RawLine) -> Self {
        Self {
            wh_today: line.wh_today,
            vah_today: line.vah_today,
            wh_lifetime: line.wh_lifetime,
            vah_lifetime: line.vah_lifetime,
        }
    }
}

impl HistoricCounters {
    /// Reshapes the production.json document.
    ///
    /// Every top-level array is scanned for entries whose `measurementType`
    /// names one of our meters, so the result does not depend on where the
    /// firmware places them.
    pub fn from_production_json(document: &Value) -> Result<Self> {
        let sections = document
            .as_object()
            .ok_or_else(|| EnvoyError::decode("production.json is not an object"))?;

        let mut meters = BTreeMap::new();
        for entry in sections.values().filter_map(Value::as_array).flatten() {
            let Some(kind) = entry
                .get("measurementType")
                .and_then(Value::as_str)
                .and_then(MeterKind::from_wire_name)
            else {
                continue;
            };

            let raw: RawMeasurement = serde_json::from_value(entry.clone()).map_err(|e| {
                EnvoyError::decode(format!("production.json {}: {e}", kind.wire_name()))
            })?;

            let phases = raw
                .lines
                .iter()
                .enumerate()
                .filter_map(|(index, line)| {
                    Phase::from_index(index).map(|phase| (phase, EnergyCounters::from(line)))
                })
                .collect();

            meters.insert(
                kind,
                MeterCounters {
                    total: EnergyCounters {
                        wh_today: raw.wh_today,
                        vah_today: raw.vah_today,
                        wh_lifetime: raw.wh_lifetime,
                        vah_lifetime: raw.vah_lifetime,
                    },
                    phases,
                },
            );
        }

        // The accumulator needs all three meters; a partial poll must not
        // release the startup barrier.
        let missing = MeterKind::ALL
            .into_iter()
            .find(|kind| !meters.contains_key(kind));
        if let Some(missing) = missing {
            return Err(EnvoyError::decode(format!(
                "production.json has no {} measurement",
                missing.wire_name()
            )));
        }
        Ok(Self { meters })
    }

    pub fn meter(&self, kind: MeterKind) -> Option<&MeterCounters> {
        self.meters.get(&kind)
    }
}

/// Holds the latest [`HistoricCounters`]; replaced whole on every
/// successful poll and never mutated in place.
#[derive(Clone)]
pub struct HistoricCounterCache {
    sender: Arc<watch::Sender<Option<Arc<HistoricCounters>>>>,
}

impl Default for HistoricCounterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoricCounterCache {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn replace(&self, counters: HistoricCounters) {
        self.sender.send_replace(Some(Arc::new(counters)));
    }

    pub fn latest(&self) -> Option<Arc<HistoricCounters>> {
        self.sender.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Waits until at least one poll has succeeded.
    pub async fn wait_ready(&self) -> Arc<HistoricCounters> {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(counters) = receiver.borrow_and_update().clone() {
                return counters;
            }
            // The sender lives in `self`, so this only errors if it was dropped.
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
