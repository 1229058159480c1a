//! Turns stream samples plus polled counters into snapshots, and estimates
//! grid import/export energy from instantaneous power.
//!
//! The gateway reports cumulative energy for production and total
//! consumption, but for the net-consumption (grid) meter it only reports
//! one direction. Grid forward/reverse energy is therefore integrated here:
//! power samples are summed over a window, and when the window closes the
//! mean power times the elapsed time is added to the stored totals.

use crate::error::{EnvoyError, Result};
use crate::historic_counters::{EnergyCounters, HistoricCounters, MeterCounters};
use crate::model::{MeterKind, MeterReadings, MeterSample, Phase};
use crate::persistence::{EnergyFlow, EnergyTotals, PersistenceStore, Tier};
use crate::snapshot_bus::{MeterSnapshot, PhaseSnapshot, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// PV readings below this are night-time noise and reported as zero.
pub const PV_NOISE_FLOOR_W: f64 = 5.0;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_DURABLE_SAVE_INTERVAL: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorSettings {
    /// Length of one averaging window.
    pub window: Duration,
    /// Minimum spacing between durable tier writes.
    pub durable_save_interval: Duration,
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            durable_save_interval: DEFAULT_DURABLE_SAVE_INTERVAL,
        }
    }
}

/// Running sums of power (W) for one direction.
#[derive(Debug, Clone, Default, PartialEq)]
struct PowerSums {
    total: f64,
    phases: BTreeMap<Phase, f64>,
}

impl PowerSums {
    fn add(&mut self, other: &PowerSums) {
        self.total += other.total;
        for (phase, power) in &other.phases {
            *self.phases.entry(*phase).or_default() += power;
        }
    }
}

/// Grid power of one sample split into import and export parts.
#[derive(Debug, Clone, Default, PartialEq)]
struct GridFlows {
    forward: PowerSums,
    reverse: PowerSums,
}

impl GridFlows {
    fn from_meter(grid: &MeterSnapshot) -> Self {
        let mut flows = Self::default();
        flows.forward.total = grid.power.max(0.0);
        flows.reverse.total = (-grid.power).max(0.0);
        for (phase, values) in &grid.phases {
            flows.forward.phases.insert(*phase, values.power.max(0.0));
            flows.reverse.phases.insert(*phase, (-values.power).max(0.0));
        }
        flows
    }
}

#[derive(Debug, Clone)]
struct AccumulationWindow {
    started_at: DateTime<Utc>,
    samples: u32,
    flows: GridFlows,
}

impl AccumulationWindow {
    fn open(at: DateTime<Utc>, flows: GridFlows) -> Self {
        Self {
            started_at: at,
            samples: 1,
            flows,
        }
    }

    fn add(&mut self, flows: &GridFlows) {
        self.flows.forward.add(&flows.forward);
        self.flows.reverse.add(&flows.reverse);
        self.samples += 1;
    }

    /// kWh for a summed power over this window, closed at `closed_at`.
    fn energy_kwh(&self, power_sum: f64, closed_at: DateTime<Utc>) -> f64 {
        let elapsed_secs = (closed_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let mean_power = power_sum / f64::from(self.samples);
        mean_power * (elapsed_secs / 3600.0) / 1000.0
    }

    /// New totals built off to the side; phases not seen in this window
    /// are dropped, newly seen phases start from zero.
    fn apply_to(&self, previous: &EnergyTotals, closed_at: DateTime<Utc>) -> EnergyTotals {
        let forward = &self.flows.forward;
        let reverse = &self.flows.reverse;
        let phases = forward
            .phases
            .keys()
            .map(|phase| {
                let before = previous.phases.get(phase).copied().unwrap_or_default();
                let fwd = forward.phases.get(phase).copied().unwrap_or_default();
                let rev = reverse.phases.get(phase).copied().unwrap_or_default();
                (
                    *phase,
                    EnergyFlow {
                        energy_forward: before.energy_forward + self.energy_kwh(fwd, closed_at),
                        energy_reverse: before.energy_reverse + self.energy_kwh(rev, closed_at),
                    },
                )
            })
            .collect();
        EnergyTotals {
            energy_forward: previous.energy_forward + self.energy_kwh(forward.total, closed_at),
            energy_reverse: previous.energy_reverse + self.energy_kwh(reverse.total, closed_at),
            phases,
        }
    }
}

/// Totals waiting to be written after a window close.
///
/// The accumulator never touches storage itself; whoever drives it takes
/// the save and runs it where blocking file IO is allowed.
pub struct PendingSave {
    store: Arc<PersistenceStore>,
    totals: EnergyTotals,
    durable: bool,
}

impl PendingSave {
    pub fn includes_durable(&self) -> bool {
        self.durable
    }

    /// Writes the fast tier, and the durable tier when it was due.
    pub fn write(self) {
        if let Err(e) = self.store.save(Tier::Fast, &self.totals) {
            error!("Could not write grid energy totals to the fast tier: {e}");
        }
        if self.durable {
            match self.store.save(Tier::Durable, &self.totals) {
                Ok(()) => info!("Written grid energy totals to persistent storage"),
                Err(e) => error!("Could not write grid energy totals to persistent storage: {e}"),
            }
        }
    }

    /// Runs [`PendingSave::write`] on the blocking pool.
    pub async fn write_off_thread(self) {
        if let Err(e) = tokio::task::spawn_blocking(move || self.write()).await {
            error!("Grid energy save task failed: {e}");
        }
    }
}

/// Owns the accumulation window and the grid energy totals.
pub struct EnergyAccumulator {
    settings: AccumulatorSettings,
    store: Arc<PersistenceStore>,
    totals: EnergyTotals,
    window: Option<AccumulationWindow>,
    durable_written_at: Option<DateTime<Utc>>,
    pending: Option<PendingSave>,
}

impl EnergyAccumulator {
    /// Resumes from whatever the store holds.
    pub fn new(store: PersistenceStore, settings: AccumulatorSettings) -> Self {
        let totals = store.load_totals();
        let durable_written_at = store.last_write(Tier::Durable);
        Self {
            settings,
            store: Arc::new(store),
            totals,
            window: None,
            durable_written_at,
            pending: None,
        }
    }

    pub fn totals(&self) -> &EnergyTotals {
        &self.totals
    }

    /// The save queued by the last window close, if not taken yet.
    pub fn take_pending_save(&mut self) -> Option<PendingSave> {
        self.pending.take()
    }

    /// Combines a sample with the polled counters into a snapshot and
    /// advances the grid window.
    ///
    /// Fails when the sample or the counters lack one of the meters;
    /// nothing is accumulated in that case.
    pub fn process(
        &mut self,
        sample: &MeterSample,
        counters: &HistoricCounters,
    ) -> Result<Snapshot> {
        let mut meters = BTreeMap::new();
        for kind in MeterKind::ALL {
            let readings = sample
                .meter(kind)
                .ok_or_else(|| EnvoyError::decode(format!("sample lacks {}", kind.wire_name())))?;
            let meter_counters = counters.meter(kind).ok_or_else(|| {
                EnvoyError::decode(format!("no historic counters for {}", kind.wire_name()))
            })?;
            meters.insert(kind, normalize_meter(kind, readings, meter_counters));
        }

        if let Some(grid) = meters.get(&MeterKind::NetConsumption) {
            let flows = GridFlows::from_meter(grid);
            self.accumulate(sample.captured_at, flows);
        }

        if let Some(grid) = meters.get_mut(&MeterKind::NetConsumption) {
            grid.energy_forward = self.totals.energy_forward;
            grid.energy_reverse = Some(self.totals.energy_reverse);
            for (phase, values) in grid.phases.iter_mut() {
                let flow = self.totals.phases.get(phase).copied().unwrap_or_default();
                values.energy_forward = flow.energy_forward;
                values.energy_reverse = Some(flow.energy_reverse);
            }
        }

        Ok(Snapshot {
            captured_at: sample.captured_at,
            meters,
        })
    }

    fn accumulate(&mut self, at: DateTime<Utc>, flows: GridFlows) {
        let window_len = chrono::Duration::from_std(self.settings.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        match self.window.as_mut() {
            None => self.window = Some(AccumulationWindow::open(at, flows)),
            Some(window) if at < window.started_at + window_len => {
                window.add(&flows);
                debug!(
                    "Grid window: {} samples, forward sum {:.1} W, reverse sum {:.1} W",
                    window.samples, window.flows.forward.total, window.flows.reverse.total
                );
            }
            Some(_) => {
                if let Some(closed) = self.window.replace(AccumulationWindow::open(at, flows)) {
                    self.close_window(&closed, at);
                }
            }
        }
    }

    fn close_window(&mut self, window: &AccumulationWindow, at: DateTime<Utc>) {
        self.totals = window.apply_to(&self.totals, at);
        debug!(
            "Grid window closed after {} samples: forward {:.3} kWh, reverse {:.3} kWh",
            window.samples, self.totals.energy_forward, self.totals.energy_reverse
        );

        // An untaken durable save carries over into the newer one.
        let mut durable = self.pending.take().is_some_and(|save| save.durable);
        if self.durable_due(at) {
            self.durable_written_at = Some(at);
            durable = true;
        }
        self.pending = Some(PendingSave {
            store: self.store.clone(),
            totals: self.totals.clone(),
            durable,
        });
    }

    fn durable_due(&self, at: DateTime<Utc>) -> bool {
        let Some(last) = self.durable_written_at else {
            return true;
        };
        match (at - last).to_std() {
            Ok(elapsed) => elapsed >= self.settings.durable_save_interval,
            // The clock went backwards; wait for it to pass `last` again.
            Err(_) => false,
        }
    }
}

fn floor_pv(power: &mut f64, current: &mut f64) {
    if *power < PV_NOISE_FLOOR_W {
        *power = 0.0;
        *current = 0.0;
    }
}

/// Builds one meter's snapshot from the metered phases.
///
/// Aggregates are summed from the raw phase readings before the PV floor
/// is applied per phase. Energy figures for production and consumption
/// come straight from the lifetime counters; grid energy is filled in by
/// the caller.
fn normalize_meter(
    kind: MeterKind,
    readings: &MeterReadings,
    counters: &MeterCounters,
) -> MeterSnapshot {
    let is_pv = kind == MeterKind::Production;
    let lifetime_kwh = |c: &EnergyCounters| match kind {
        MeterKind::NetConsumption => 0.0,
        _ => c.wh_lifetime / 1000.0,
    };
    let reverse = (kind == MeterKind::NetConsumption).then_some(0.0);

    let mut total = MeterSnapshot {
        power: 0.0,
        current: 0.0,
        voltage: 0.0,
        power_react: 0.0,
        power_apparent: 0.0,
        counters: counters.total,
        energy_forward: lifetime_kwh(&counters.total),
        energy_reverse: reverse,
        phases: BTreeMap::new(),
    };

    for (phase, reading) in &readings.phases {
        total.power += reading.power;
        total.current += reading.current;
        total.voltage += reading.voltage;
        total.power_react += reading.power_react;
        total.power_apparent += reading.power_apparent;

        let phase_counters = counters.phases.get(phase).copied().unwrap_or_default();
        let mut values = PhaseSnapshot {
            power: reading.power,
            current: reading.current,
            voltage: reading.voltage,
            power_react: reading.power_react,
            power_apparent: reading.power_apparent,
            power_factor: reading.power_factor,
            frequency: reading.frequency,
            counters: phase_counters,
            energy_forward: lifetime_kwh(&phase_counters),
            energy_reverse: reverse,
        };
        if is_pv {
            floor_pv(&mut values.power, &mut values.current);
        }
        total.phases.insert(*phase, values);
    }

    if is_pv {
        floor_pv(&mut total.power, &mut total.current);
    }
    total
}
