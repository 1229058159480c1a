//! Long-lived reader for the gateway's live meter stream.

use crate::energy_accumulator::EnergyAccumulator;
use crate::error::{EnvoyError, Result};
use crate::historic_counters::HistoricCounterCache;
use crate::model::MeterSample;
use crate::shutdown::Shutdown;
use crate::snapshot_bus::SnapshotBus;
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

/// Frames are single lines starting with this marker.
pub const FRAME_MARKER: &[u8] = b"data: ";
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens a fresh connection to the meter stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self) -> Result<ChunkStream>;
}

#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Longest wait for the next chunk before the connection is dropped.
    pub chunk_timeout: Duration,
    pub timeout_retry: Duration,
    pub error_retry: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(5),
            timeout_retry: Duration::from_secs(1),
            error_retry: Duration::from_secs(5),
        }
    }
}

/// Reassembles newline terminated frames from arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    /// Feeds a chunk and returns the payloads of all completed frames.
    /// Lines without the marker are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = line.strip_suffix(b"\n").unwrap_or(&line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(payload) = line.strip_prefix(FRAME_MARKER) {
                frames.push(payload.to_vec());
            }
        }
        frames
    }
}

/// Reads the meter stream, feeds every frame through the accumulator and
/// publishes the resulting snapshot.
pub struct StreamReader {
    source: Arc<dyn StreamSource>,
    accumulator: EnergyAccumulator,
    historic: HistoricCounterCache,
    bus: Arc<SnapshotBus>,
    shutdown: Shutdown,
    timing: StreamTiming,
    consecutive_errors: u32,
}

impl StreamReader {
    pub fn new(
        source: Arc<dyn StreamSource>,
        accumulator: EnergyAccumulator,
        historic: HistoricCounterCache,
        bus: Arc<SnapshotBus>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            accumulator,
            historic,
            bus,
            shutdown,
            timing: StreamTiming::default(),
            consecutive_errors: 0,
        }
    }

    pub fn with_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Spawns the reader in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = self;
            reader.run().await;
        })
    }

    async fn run(&mut self) {
        info!("Starting meter stream reader, waiting for historic counters");
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Meter stream reader exiting");
                return;
            }
            _ = self.historic.wait_ready() => {}
        }

        while self.shutdown.is_running() {
            let e = match self.read_stream().await {
                Ok(()) => break,
                Err(e) => e,
            };

            self.consecutive_errors += 1;
            error!(
                "Meter stream error ({}/{}): {}",
                self.consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
            );
            if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                self.shutdown.raise_fatal(format!(
                    "meter stream failed {} times in a row",
                    self.consecutive_errors
                ));
                break;
            }

            let delay = if e.is_timeout() {
                self.timing.timeout_retry
            } else {
                self.timing.error_retry
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!("Meter stream reader exiting");
    }

    /// Reads one connection until it fails. `Ok` only when a stop was
    /// requested.
    async fn read_stream(&mut self) -> Result<()> {
        let mut chunks = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            connected = self.source.connect() => connected?,
        };
        info!("Connected to meter stream");

        let mut splitter = FrameSplitter::default();
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = timeout(self.timing.chunk_timeout, chunks.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(EnvoyError::Timeout("meter stream data".into())),
                Ok(None) => {
                    return Err(EnvoyError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "meter stream closed by gateway",
                    )))
                }
                Ok(Some(chunk)) => chunk?,
            };

            for frame in splitter.push(&chunk) {
                if !self.shutdown.is_running() {
                    return Ok(());
                }
                self.process_frame(&frame)?;
                self.consecutive_errors = 0;
                if let Some(save) = self.accumulator.take_pending_save() {
                    save.write_off_thread().await;
                }
            }
        }
    }

    fn process_frame(&mut self, frame: &[u8]) -> Result<()> {
        let counters = self.historic.latest().ok_or(EnvoyError::NotReady)?;
        let sample = MeterSample::decode(frame, Utc::now())?;
        let snapshot = self.accumulator.process(&sample, &counters)?;
        debug!("{}", serde_json::to_string(&snapshot).unwrap_or_default());
        if self.bus.latest().is_err() {
            info!("First meter snapshot available");
        }
        self.bus.publish_snapshot(snapshot);
        Ok(())
    }
}
