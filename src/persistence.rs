//! Two-tier storage for the grid energy totals.
//!
//! The fast tier is rewritten on every window close and should live on
//! volatile storage; the durable tier survives reboots and is written
//! sparingly. Backends are passive byte stores, all policy lives in the
//! energy accumulator.

use crate::error::{EnvoyError, Result};
use crate::model::Phase;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Forward (imported) and reverse (exported) energy in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyFlow {
    pub energy_forward: f64,
    pub energy_reverse: f64,
}

/// Accumulated grid energy, aggregate plus each metered phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyTotals {
    pub energy_forward: f64,
    pub energy_reverse: f64,
    #[serde(flatten)]
    pub phases: BTreeMap<Phase, EnergyFlow>,
}

/// On-disk document: `{"grid": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PersistedState {
    grid: EnergyTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Durable,
}

pub trait StateBackend: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` when nothing was written yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;
    fn store(&self, bytes: &[u8]) -> Result<()>;
    fn last_write(&self) -> Result<Option<DateTime<Utc>>>;
}

impl<T: StateBackend + ?Sized> StateBackend for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        (**self).load()
    }

    fn store(&self, bytes: &[u8]) -> Result<()> {
        (**self).store(bytes)
    }

    fn last_write(&self) -> Result<Option<DateTime<Utc>>> {
        (**self).last_write()
    }
}

/// A JSON file replaced atomically through a sibling temp file.
pub struct FileBackend {
    name: String,
    path: PathBuf,
}

impl FileBackend {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl StateBackend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, bytes: &[u8]) -> Result<()> {
        write_atomically(&self.path, bytes)
    }

    fn last_write(&self) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(meta.modified()?.into())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes `bytes` to a temp file next to `path` and renames it over `path`,
/// so readers never see a half written document.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| EnvoyError::Io(e.error))?;
    Ok(())
}

/// Process memory only. Used for the fast tier when no volatile path is
/// configured.
#[derive(Default)]
pub struct MemoryBackend {
    name: String,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    bytes: Option<Vec<u8>>,
    last_write: Option<DateTime<Utc>>,
    writes: usize,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::default(),
        }
    }

    pub fn with_contents(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let backend = Self::new(name);
        if let Ok(mut state) = backend.state.lock() {
            state.bytes = Some(bytes);
        }
        backend
    }

    pub fn writes(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or_default()
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.state.lock().ok().and_then(|s| s.bytes.clone())
    }
}

impl StateBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn store(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EnvoyError::Io(std::io::Error::other("memory backend poisoned")))?;
        state.bytes = Some(bytes.to_vec());
        state.last_write = Some(Utc::now());
        state.writes += 1;
        Ok(())
    }

    fn last_write(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().ok().and_then(|s| s.last_write))
    }
}

/// The fast and durable backends behind one interface.
pub struct PersistenceStore {
    fast: Box<dyn StateBackend>,
    durable: Box<dyn StateBackend>,
}

impl PersistenceStore {
    pub fn new(fast: Box<dyn StateBackend>, durable: Box<dyn StateBackend>) -> Self {
        Self { fast, durable }
    }

    fn backend(&self, tier: Tier) -> &dyn StateBackend {
        match tier {
            Tier::Fast => self.fast.as_ref(),
            Tier::Durable => self.durable.as_ref(),
        }
    }

    /// Loads the totals from the fast tier, falling back to the durable
    /// tier, then to zero. An unreadable tier is skipped with a warning.
    pub fn load_totals(&self) -> EnergyTotals {
        for tier in [Tier::Fast, Tier::Durable] {
            let backend = self.backend(tier);
            match backend.load() {
                Ok(Some(bytes)) => match serde_json::from_slice::<PersistedState>(&bytes) {
                    Ok(state) => {
                        info!("Loaded grid energy totals from {}", backend.name());
                        debug!("{:?}", state.grid);
                        return state.grid;
                    }
                    Err(e) => warn!("Ignoring unreadable {} state: {e}", backend.name()),
                },
                Ok(None) => {}
                Err(e) => warn!("Could not read {} state: {e}", backend.name()),
            }
        }
        info!("No stored grid energy totals, starting from zero");
        EnergyTotals::default()
    }

    pub fn save(&self, tier: Tier, totals: &EnergyTotals) -> Result<()> {
        let document = serde_json::to_vec(&PersistedState {
            grid: totals.clone(),
        })?;
        self.backend(tier).store(&document)
    }

    pub fn last_write(&self, tier: Tier) -> Option<DateTime<Utc>> {
        match self.backend(tier).last_write() {
            Ok(at) => at,
            Err(e) => {
                warn!("Could not stat {} state: {e}", self.backend(tier).name());
                None
            }
        }
    }
}
