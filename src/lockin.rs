//! Lock-in amplifier acquisition.
//!
//! The vendor session is consumed through [`AcquisitionSession`]; connecting
//! one is up to a [`SessionProvider`]. While recording, a worker thread owns
//! the session, polls demodulator samples into per-channel buffers and
//! rotates them into numbered JSON files:
//!
//! ```text
//! <base>/session_<YYYYmmdd_HHMMSS>/stream<NNNN>/stream_<NNNNN>.json
//! ```
//!
//! Buffers are only released by a flush, so memory grows with sample rate
//! times the rotation interval.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Demodulator sample nodes, prefixed with `/<device>`
const DEMOD_PATTERN: &str = "/demods/*/sample";

/// Poll arguments: block 1 ms, 10 ms timeout, throw on data loss, flat result
const POLL_BLOCK: Duration = Duration::from_millis(1);
const POLL_TIMEOUT_MS: u32 = 10;
const POLL_FLAGS: u32 = 0x04;
const POLL_FLAT: bool = true;

// ============================================================================
// Session Interface
// ============================================================================

/// Samples one demodulator delivered in a single poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemodSamples {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub timestamp: Vec<u64>,
    pub frequency: Vec<f64>,
    pub dio: Vec<u32>,
    pub dataloss: bool,
    pub invalid_timestamp: bool,
}

/// Poll result keyed by channel path.
pub type PollBatch = BTreeMap<String, DemodSamples>;

/// The vendor data server session.
pub trait AcquisitionSession: Send {
    fn subscribe(&mut self, path: &str) -> Result<()>;
    /// Drop everything buffered server-side.
    fn sync(&mut self) -> Result<()>;
    fn poll(&mut self, block: Duration, timeout_ms: u32, flags: u32, flat: bool) -> Result<PollBatch>;
    fn unsubscribe(&mut self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub device_id: String,
    pub server: String,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.device_id, self.server)
    }
}

/// Opens sessions to a device by id.
pub trait SessionProvider: Send + Sync {
    fn connect(&self, device_id: &str) -> Result<(Box<dyn AcquisitionSession>, SessionInfo)>;
}

// ============================================================================
// Buffers and Files
// ============================================================================

/// Accumulated samples of one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleBuffer {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub timestamp: Vec<u64>,
    pub frequency: Vec<f64>,
    pub dio: Vec<u32>,
}

impl SampleBuffer {
    pub fn append(&mut self, samples: &DemodSamples) {
        self.x.extend_from_slice(&samples.x);
        self.y.extend_from_slice(&samples.y);
        self.timestamp.extend_from_slice(&samples.timestamp);
        self.frequency.extend_from_slice(&samples.frequency);
        self.dio.extend_from_slice(&samples.dio);
    }

    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }
}

/// Sticky warnings raised during the current recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordFlags {
    pub dataloss: bool,
    pub invalid_timestamp: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    /// Files written since the last start.
    pub file_sequence: u32,
    /// Stream folders created in this session.
    pub folder_sequence: u32,
}

#[derive(Serialize)]
struct DemodRecord<'a> {
    channel: &'a str,
    #[serde(flatten)]
    samples: &'a SampleBuffer,
}

#[derive(Serialize)]
struct StreamFile<'a> {
    demods: Vec<DemodRecord<'a>>,
}

#[derive(Debug, Default)]
struct PollState {
    buffers: BTreeMap<String, SampleBuffer>,
    file_sequence: u32,
    stream_folder: PathBuf,
    device_name: String,
    flags: RecordFlags,
}

impl PollState {
    fn absorb(&mut self, batch: PollBatch) {
        for (channel, samples) in batch {
            if samples.dataloss && !self.flags.dataloss {
                warn!("dataloss reported on {channel}, data might be corrupted");
                self.flags.dataloss = true;
            }
            if samples.invalid_timestamp && !self.flags.invalid_timestamp {
                warn!("invalid timestamp reported on {channel}, data might be corrupted");
                self.flags.invalid_timestamp = true;
            }
            self.buffers.entry(channel).or_default().append(&samples);
        }
    }

    /// Write every buffer into the next stream file and release them.
    fn flush(&mut self) -> Result<PathBuf> {
        let path = self
            .stream_folder
            .join(format!("stream_{:05}.json", self.file_sequence));
        {
            let file = StreamFile {
                demods: self
                    .buffers
                    .iter()
                    .map(|(channel, samples)| DemodRecord { channel, samples })
                    .collect(),
            };
            let mut root = BTreeMap::new();
            root.insert(self.device_name.as_str(), file);

            let writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer(writer, &root).map_err(|e| {
                DriverError::Session(format!("cannot write '{}': {e}", path.display()))
            })?;
        }

        debug!(
            "wrote {} ({} channels)",
            path.display(),
            self.buffers.len()
        );
        self.buffers.clear();
        self.file_sequence += 1;
        Ok(path)
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockinSettings {
    /// Tried in order until one connects.
    pub device_ids: Vec<String>,
    pub base_folder: PathBuf,
    pub rotation_interval_ms: u64,
}

impl Default for LockinSettings {
    fn default() -> Self {
        Self {
            device_ids: vec!["dev10".to_string(), "dev275".to_string()],
            base_folder: PathBuf::from("./streams"),
            rotation_interval_ms: 30_000,
        }
    }
}

/// Human-readable recording state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordStatus {
    Recording,
    Paused,
    #[default]
    Stopped,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordStatus::Recording => "Recording...",
            RecordStatus::Paused => "Paused...",
            RecordStatus::Stopped => "Stopped.",
        })
    }
}

// ============================================================================
// Poll Worker
// ============================================================================

struct PollContext {
    path: String,
    state: Arc<Mutex<PollState>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    rotation: Duration,
}

fn poll_loop(mut session: Box<dyn AcquisitionSession>, ctx: PollContext) -> Box<dyn AcquisitionSession> {
    let started = session.subscribe(&ctx.path).and_then(|_| session.sync());
    if let Err(e) = started {
        error!("could not subscribe to {}: {e}", ctx.path);
        ctx.connected.store(false, Ordering::SeqCst);
        ctx.running.store(false, Ordering::SeqCst);
        return session;
    }
    debug!("polling {}", ctx.path);

    let mut window_start = Instant::now();
    while ctx.running.load(Ordering::SeqCst) {
        let mut state = ctx.state.lock();
        match session.poll(POLL_BLOCK, POLL_TIMEOUT_MS, POLL_FLAGS, POLL_FLAT) {
            Ok(batch) => state.absorb(batch),
            Err(e) => {
                error!("poll failed, lock-in disconnected: {e}");
                ctx.connected.store(false, Ordering::SeqCst);
                ctx.running.store(false, Ordering::SeqCst);
                break;
            }
        }
        if window_start.elapsed() >= ctx.rotation {
            if let Err(e) = state.flush() {
                error!("stream rotation failed: {e}");
            }
            window_start = Instant::now();
        }
    }

    if let Err(e) = session.unsubscribe(&ctx.path) {
        warn!("could not unsubscribe {}: {e}", ctx.path);
    }
    session
}

fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

// ============================================================================
// Device
// ============================================================================

pub struct LockIn {
    provider: Box<dyn SessionProvider>,
    settings: LockinSettings,
    session: Option<Box<dyn AcquisitionSession>>,
    info: Option<SessionInfo>,
    subscription: String,
    session_stamp: String,
    folder_sequence: u32,
    state: Arc<Mutex<PollState>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<Box<dyn AcquisitionSession>>>,
    status: RecordStatus,
}

impl LockIn {
    pub fn new(provider: Box<dyn SessionProvider>, settings: LockinSettings) -> Self {
        Self {
            provider,
            settings,
            session: None,
            info: None,
            subscription: String::new(),
            session_stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            folder_sequence: 0,
            state: Arc::new(Mutex::new(PollState::default())),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            worker: None,
            status: RecordStatus::Stopped,
        }
    }

    /// Name the session folder explicitly instead of by start time.
    pub fn with_session_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.session_stamp = stamp.into();
        self
    }

    /// Connect to the first configured device id that answers.
    pub fn detect(&mut self) -> Result<SessionInfo> {
        if self.worker.is_some() {
            self.stop_poll(false)?;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.session = None;
        self.info = None;

        for device in &self.settings.device_ids {
            info!("trying to detect {device}");
            match self.provider.connect(device) {
                Ok((session, info)) => {
                    info!("created session for {info}");
                    self.subscription = format!("/{}{}", info.device_id, DEMOD_PATTERN);
                    self.state.lock().device_name = info.device_id.clone();
                    self.session = Some(session);
                    self.info = Some(info.clone());
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(info);
                }
                Err(e) => info!("{device} could not be found: {e}"),
            }
        }
        Err(DriverError::DeviceNotFound {
            descriptor: self.settings.device_ids.join(", "),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    pub fn subscription_path(&self) -> &str {
        &self.subscription
    }

    fn resolve_folder(&mut self, folder: Option<&Path>) -> Result<PathBuf> {
        if let Some(folder) = folder {
            if is_writable_dir(folder) {
                return Ok(folder.to_path_buf());
            }
            warn!("'{}' is not writable, using a new stream folder", folder.display());
        }
        let path = self
            .settings
            .base_folder
            .join(format!("session_{}", self.session_stamp))
            .join(format!("stream{:04}", self.folder_sequence));
        fs::create_dir_all(&path)?;
        self.folder_sequence += 1;
        Ok(path)
    }

    /// Start recording into `folder`, or into a fresh stream folder.
    pub fn start_poll(&mut self, folder: Option<&Path>) -> Result<()> {
        if self.is_polling() {
            warn!("lock-in is already recording");
            return Ok(());
        }
        if self.worker.is_some() {
            // the previous run ended on its own
            self.stop_poll(false)?;
        }
        if !self.is_connected() {
            return Err(DriverError::NotAlive("lock-in".into()));
        }
        let folder = self.resolve_folder(folder)?;
        let session = self
            .session
            .take()
            .ok_or_else(|| DriverError::NotAlive("lock-in".into()))?;

        {
            let mut state = self.state.lock();
            state.stream_folder = folder.clone();
            state.file_sequence = 0;
            state.flags = RecordFlags::default();
            state.buffers.clear();
        }

        let ctx = PollContext {
            path: self.subscription.clone(),
            state: self.state.clone(),
            running: self.running.clone(),
            connected: self.connected.clone(),
            rotation: Duration::from_millis(self.settings.rotation_interval_ms),
        };
        self.running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("lockin-poll".into())
            .spawn(move || poll_loop(session, ctx));
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        self.status = RecordStatus::Recording;
        info!("recording into {}", folder.display());
        Ok(())
    }

    /// Stop recording, write the last file and set the status.
    ///
    /// Stopping an idle engine is a no-op.
    pub fn stop_poll(&mut self, paused: bool) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        match worker.join() {
            Ok(session) => self.session = Some(session),
            Err(_) => {
                error!("lock-in poll worker panicked");
                self.connected.store(false, Ordering::SeqCst);
            }
        }

        let flushed = {
            let mut state = self.state.lock();
            let flushed = state.flush();
            state.file_sequence = 0;
            flushed
        };
        self.status = if paused {
            RecordStatus::Paused
        } else {
            RecordStatus::Stopped
        };
        info!("lock-in {}", self.status);

        flushed?;
        if !self.is_connected() {
            return Err(DriverError::NotAlive("lock-in".into()));
        }
        Ok(())
    }

    /// True while the worker is recording.
    pub fn is_polling(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Write the buffered samples now, without stopping.
    pub fn flush(&self) -> Result<PathBuf> {
        self.state.lock().flush()
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn record_flags(&self) -> RecordFlags {
        self.state.lock().flags
    }

    pub fn stream_folder(&self) -> PathBuf {
        self.state.lock().stream_folder.clone()
    }

    pub fn counters(&self) -> StreamCounters {
        StreamCounters {
            file_sequence: self.state.lock().file_sequence,
            folder_sequence: self.folder_sequence,
        }
    }

    /// Buffered sample count per channel.
    pub fn buffered_samples(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .buffers
            .iter()
            .map(|(k, b)| (k.clone(), b.len()))
            .collect()
    }
}

impl Drop for LockIn {
    fn drop(&mut self) {
        if let Err(e) = self.stop_poll(false) {
            warn!("lock-in shutdown: {e}");
        }
    }
}

impl fmt::Debug for LockIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockIn")
            .field("info", &self.info)
            .field("subscription", &self.subscription)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
