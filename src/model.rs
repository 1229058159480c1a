//! Meter and phase identifiers plus the decoded live-stream record.

use crate::error::{EnvoyError, Result};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The three feeds the gateway meters.
///
/// Serialized with the published names (`pv`, `grid`, `consumption`); the
/// gateway's own names are available through [`MeterKind::wire_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MeterKind {
    #[serde(rename = "pv")]
    Production,
    #[serde(rename = "grid")]
    NetConsumption,
    #[serde(rename = "consumption")]
    TotalConsumption,
}

impl MeterKind {
    pub const ALL: [MeterKind; 3] = [
        MeterKind::Production,
        MeterKind::NetConsumption,
        MeterKind::TotalConsumption,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            MeterKind::Production => "production",
            MeterKind::NetConsumption => "net-consumption",
            MeterKind::TotalConsumption => "total-consumption",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MeterKind::Production => "pv",
            MeterKind::NetConsumption => "grid",
            MeterKind::TotalConsumption => "consumption",
        }
    }

    /// Maps a `measurementType` from production.json.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn wire_name(self) -> &'static str {
        match self {
            Phase::L1 => "ph-a",
            Phase::L2 => "ph-b",
            Phase::L3 => "ph-c",
        }
    }

    /// Zero based position in a `lines` array.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Instantaneous values for one phase of one meter, as streamed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PhaseReading {
    #[serde(rename = "p")]
    pub power: f64,
    #[serde(rename = "q")]
    pub power_react: f64,
    #[serde(rename = "s")]
    pub power_apparent: f64,
    #[serde(rename = "v")]
    pub voltage: f64,
    #[serde(rename = "i")]
    pub current: f64,
    #[serde(rename = "pf")]
    pub power_factor: f64,
    #[serde(rename = "f")]
    pub frequency: f64,
}

/// Metered phases of a single meter. Only phases with voltage above zero
/// are kept; an absent phase means the device is not metering it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterReadings {
    pub phases: BTreeMap<Phase, PhaseReading>,
}

/// One decoded record from the live meter stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSample {
    pub captured_at: DateTime<Utc>,
    pub meters: BTreeMap<MeterKind, MeterReadings>,
}

#[derive(Deserialize)]
struct RawFrame {
    production: RawMeter,
    #[serde(rename = "net-consumption")]
    net_consumption: RawMeter,
    #[serde(rename = "total-consumption")]
    total_consumption: RawMeter,
}

#[derive(Deserialize)]
struct RawMeter {
    #[serde(rename = "ph-a")]
    ph_a: Option<PhaseReading>,
    #[serde(rename = "ph-b")]
    ph_b: Option<PhaseReading>,
    #[serde(rename = "ph-c")]
    ph_c: Option<PhaseReading>,
}

impl RawMeter {
    fn into_readings(self) -> MeterReadings {
        let phases = [
            (Phase::L1, self.ph_a),
            (Phase::L2, self.ph_b),
            (Phase::L3, self.ph_c),
        ]
        .into_iter()
        .filter_map(|(phase, reading)| reading.map(|r| (phase, r)))
        .filter(|(_, reading)| reading.voltage > 0.0)
        .collect();
        MeterReadings { phases }
    }
}

impl MeterSample {
    /// Decodes the JSON payload of a single stream frame.
    ///
    /// A missing meter or a phase missing any of its fields is a decode
    /// error; the caller charges it to the stream failure budget.
    pub fn decode(payload: &[u8], captured_at: DateTime<Utc>) -> Result<Self> {
        let raw: RawFrame = serde_json::from_slice(payload)
            .map_err(|e| EnvoyError::decode(format!("meter stream frame: {e}")))?;
        let meters = BTreeMap::from([
            (MeterKind::Production, raw.production.into_readings()),
            (MeterKind::NetConsumption, raw.net_consumption.into_readings()),
            (
                MeterKind::TotalConsumption,
                raw.total_consumption.into_readings(),
            ),
        ]);
        Ok(Self {
            captured_at,
            meters,
        })
    }

    pub fn meter(&self, kind: MeterKind) -> Option<&MeterReadings> {
        self.meters.get(&kind)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};

    pub(crate) fn phase_json(power: f64, voltage: f64) -> Value {
        json!({"p": power, "q": 10.0, "s": power.abs() + 20.0, "v": voltage, "i": 2.0, "pf": 0.98, "f": 50.0})
    }

    pub(crate) fn frame_json(pv: [(f64, f64); 3], grid: [(f64, f64); 3]) -> Value {
        let meter = |phases: [(f64, f64); 3]| {
            json!({
                "ph-a": phase_json(phases[0].0, phases[0].1),
                "ph-b": phase_json(phases[1].0, phases[1].1),
                "ph-c": phase_json(phases[2].0, phases[2].1),
            })
        };
        json!({
            "production": meter(pv),
            "net-consumption": meter(grid),
            "total-consumption": meter([(300.0, 230.0), (0.0, 0.0), (0.0, 0.0)]),
        })
    }

    #[test]
    fn test_phase_kept_only_with_voltage() {
        let frame = frame_json(
            [(100.0, 230.0), (50.0, 0.0), (0.0, 0.0)],
            [(500.0, 230.0), (0.0, 0.0), (10.0, -1.0)],
        );
        let sample =
            MeterSample::decode(frame.to_string().as_bytes(), Utc::now()).unwrap();

        let pv = sample.meter(MeterKind::Production).unwrap();
        assert_eq!(pv.phases.keys().copied().collect::<Vec<_>>(), vec![Phase::L1]);
        let grid = sample.meter(MeterKind::NetConsumption).unwrap();
        assert_eq!(grid.phases.len(), 1);
        assert_eq!(grid.phases[&Phase::L1].power, 500.0);
    }

    #[test]
    fn test_missing_field_is_decode_error() {
        let frame = json!({
            "production": {"ph-a": {"p": 1.0, "v": 230.0}},
            "net-consumption": {},
            "total-consumption": {},
        });
        let err = MeterSample::decode(frame.to_string().as_bytes(), Utc::now()).unwrap_err();
        assert!(matches!(err, EnvoyError::Decode(_)));
    }

    #[test]
    fn test_missing_meter_is_decode_error() {
        let frame = json!({"production": {}, "net-consumption": {}});
        assert!(MeterSample::decode(frame.to_string().as_bytes(), Utc::now()).is_err());
    }

    #[test]
    fn test_meter_names() {
        assert_eq!(
            MeterKind::from_wire_name("net-consumption"),
            Some(MeterKind::NetConsumption)
        );
        assert_eq!(MeterKind::from_wire_name("storage"), None);
        assert_eq!(
            serde_json::to_string(&MeterKind::TotalConsumption).unwrap(),
            "\"consumption\""
        );
        assert_eq!(Phase::from_index(2), Some(Phase::L3));
        assert_eq!(Phase::from_index(3), None);
    }
}
