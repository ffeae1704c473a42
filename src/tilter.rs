//! Chip tilter driver.
//!
//! Parameters are written as 5-byte frames:
//!
//! ```text
//! [addr hi] [addr lo] [value] [(hi + lo + value) & 0xFF] ['#']
//! ```
//!
//! Setting a value through [`MotionSetup::set_value`] only appends frames to
//! the pending stream; [`ChipTilter::write_setup`] sends them. The tilter
//! drops frames now and then, which is what [`WriteMode::Force`] is for.
//!
//! A reader thread polls the telemetry stream, feeds the position state
//! machine and dispatches the registered [`TilterEvent`] handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::channel::{Channel, PortCandidate, ReadMode};
use crate::errors::{DriverError, Result};
use crate::events::{dispatch, EventCallback, EventRegistry, HandlerId, TilterEvent};
use crate::telemetry::{TelemetryDecoder, TelemetryField, TelemetrySample, TilterState};

// ============================================================================
// Constants
// ============================================================================

/// High address byte shared by every parameter
const ADDRESS_HI: u8 = 0xFF;

/// Frame terminator
const FRAME_END: u8 = b'#';

/// Status values written to the `status` address
const STATUS_START: u8 = 0x01;
const STATUS_STOP: u8 = 0x00;

/// Sleep slice while the reader waits for its next poll
const READER_TICK: Duration = Duration::from_millis(10);

// ============================================================================
// Parameters
// ============================================================================

/// Addressable tilter parameter; the discriminant is the low address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionParam {
    PosAngle,
    NegAngle,
    PosMotion,
    NegMotion,
    PosPauseMin,
    NegPauseMin,
    PosPauseSec,
    NegPauseSec,
    HorPauseMin,
    HorPauseSec,
    TotTimeHrs,
    TotTimeMin,
    Status,
}

impl MotionParam {
    pub const ALL: [MotionParam; 13] = [
        MotionParam::PosAngle,
        MotionParam::NegAngle,
        MotionParam::PosMotion,
        MotionParam::NegMotion,
        MotionParam::PosPauseMin,
        MotionParam::NegPauseMin,
        MotionParam::PosPauseSec,
        MotionParam::NegPauseSec,
        MotionParam::HorPauseMin,
        MotionParam::HorPauseSec,
        MotionParam::TotTimeHrs,
        MotionParam::TotTimeMin,
        MotionParam::Status,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MotionParam::PosAngle => "posAngle",
            MotionParam::NegAngle => "negAngle",
            MotionParam::PosMotion => "posMotion",
            MotionParam::NegMotion => "negMotion",
            MotionParam::PosPauseMin => "posPauseMin",
            MotionParam::NegPauseMin => "negPauseMin",
            MotionParam::PosPauseSec => "posPauseSec",
            MotionParam::NegPauseSec => "negPauseSec",
            MotionParam::HorPauseMin => "horPauseMin",
            MotionParam::HorPauseSec => "horPauseSec",
            MotionParam::TotTimeHrs => "totTimeHrs",
            MotionParam::TotTimeMin => "totTimeMin",
            MotionParam::Status => "status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn address(&self) -> [u8; 2] {
        [ADDRESS_HI, *self as u8]
    }

    /// The tilter misbehaves when these are zero.
    fn floors_at_one(&self) -> bool {
        matches!(
            self,
            MotionParam::PosAngle | MotionParam::NegAngle | MotionParam::PosMotion | MotionParam::NegMotion
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MotionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode one parameter write.
pub fn encode_param(address: [u8; 2], value: u8) -> [u8; 5] {
    let [hi, lo] = address;
    let checksum = hi.wrapping_add(lo).wrapping_add(value);
    [hi, lo, value, checksum, FRAME_END]
}

fn to_hex(frame: &[u8]) -> String {
    frame.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn parse_int(name: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| DriverError::InvalidValue(format!("{name}: '{raw}' is not an integer")))
}

fn to_byte(name: &str, value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| DriverError::InvalidValue(format!("{name}: {value} is outside 0..=255")))
}

/// Split `"a:b"` or `"b"` into `(a, b)`, carrying `b` above 59 into `a`.
fn split_sexagesimal(name: &str, raw: &str) -> Result<(u8, u8)> {
    let (major, minor) = match raw.split_once(':') {
        Some((major, minor)) => (parse_int(name, major)?, parse_int(name, minor)?),
        None => (0, parse_int(name, raw)?),
    };
    if major < 0 || minor < 0 {
        return Err(DriverError::InvalidValue(format!("{name}: '{raw}' is negative")));
    }
    let total = major
        .checked_mul(60)
        .and_then(|m| m.checked_add(minor))
        .ok_or_else(|| DriverError::InvalidValue(format!("{name}: '{raw}' is out of range")))?;
    Ok((to_byte(name, total / 60)?, to_byte(name, total % 60)?))
}

// ============================================================================
// Setup
// ============================================================================

/// Parameter values and the frames queued for the next write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotionSetup {
    values: [Option<u8>; 13],
    byte_stream: Vec<[u8; 5]>,
}

impl MotionSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, param: MotionParam) -> Option<u8> {
        self.values[param.index()]
    }

    fn set(&mut self, param: MotionParam, value: u8) {
        self.values[param.index()] = Some(value);
        self.byte_stream.push(encode_param(param.address(), value));
    }

    /// Set a value from user text.
    ///
    /// Besides the plain parameter names this accepts `posPause`, `negPause`
    /// and `horPause` as `"mm:ss"` or `"ss"`, and `totTime` as `"hh:mm"` or
    /// `"mm"`. Nothing changes when the input is rejected.
    pub fn set_value(&mut self, name: &str, raw: &str) -> Result<()> {
        let compound = match name {
            "posPause" => Some((MotionParam::PosPauseMin, MotionParam::PosPauseSec)),
            "negPause" => Some((MotionParam::NegPauseMin, MotionParam::NegPauseSec)),
            "horPause" => Some((MotionParam::HorPauseMin, MotionParam::HorPauseSec)),
            "totTime" => Some((MotionParam::TotTimeHrs, MotionParam::TotTimeMin)),
            _ => None,
        };
        if let Some((major, minor)) = compound {
            let (hi, lo) = split_sexagesimal(name, raw)?;
            self.set(major, hi);
            self.set(minor, lo);
            return Ok(());
        }

        let param = MotionParam::from_name(name)
            .ok_or_else(|| DriverError::InvalidValue(format!("unknown tilter parameter '{name}'")))?;
        let mut value = parse_int(name, raw)?;
        if param.floors_at_one() && value < 1 {
            value = 1;
        }
        let value = to_byte(name, value)?;
        self.set(param, value);
        Ok(())
    }

    /// Numeric view of a parameter or compound name; pauses in seconds, total time in minutes.
    pub fn value(&self, name: &str) -> Result<Option<u32>> {
        let pair = |major: MotionParam, minor: MotionParam| match (self.get(major), self.get(minor)) {
            (Some(a), Some(b)) => Some(u32::from(a) * 60 + u32::from(b)),
            _ => None,
        };
        match name {
            "posPause" => Ok(pair(MotionParam::PosPauseMin, MotionParam::PosPauseSec)),
            "negPause" => Ok(pair(MotionParam::NegPauseMin, MotionParam::NegPauseSec)),
            "horPause" => Ok(pair(MotionParam::HorPauseMin, MotionParam::HorPauseSec)),
            "totTime" => Ok(pair(MotionParam::TotTimeHrs, MotionParam::TotTimeMin)),
            _ => MotionParam::from_name(name)
                .map(|p| self.get(p).map(u32::from))
                .ok_or_else(|| DriverError::InvalidValue(format!("unknown tilter parameter '{name}'"))),
        }
    }

    pub fn frames(&self) -> &[[u8; 5]] {
        &self.byte_stream
    }

    pub fn clear_stream(&mut self) {
        self.byte_stream.clear();
    }

    /// Every address once: angles and motion times 1, everything else 0.
    pub fn reset_stream() -> Vec<[u8; 5]> {
        MotionParam::ALL
            .into_iter()
            .map(|p| encode_param(p.address(), u8::from(p.floors_at_one())))
            .collect()
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Normal,
    /// Write every frame `force_retries` times.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TilterSettings {
    pub force_retries: u32,
    pub frame_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Start the telemetry reader as soon as the tilter is detected.
    pub auto_read: bool,
}

impl Default for TilterSettings {
    fn default() -> Self {
        Self {
            force_retries: 3,
            frame_delay_ms: 50,
            poll_interval_ms: 1000,
            auto_read: true,
        }
    }
}

// ============================================================================
// Telemetry Reader
// ============================================================================

#[derive(Debug, Default)]
struct TelemetryShared {
    decoder: TelemetryDecoder,
    sample: TelemetrySample,
    state: TilterState,
}

/// Decode `text`, advancing the state machine once per completed message.
/// Handlers run between messages with no lock held.
fn ingest(
    shared: &Mutex<TelemetryShared>,
    events: &Mutex<EventRegistry>,
    text: &str,
) -> Vec<TilterEvent> {
    let messages = shared.lock().decoder.feed(text);
    let mut fired = Vec::new();
    for message in messages {
        let triggered = {
            let mut shared = shared.lock();
            shared.sample.apply_message(&message);
            let sample = shared.sample.clone();
            shared.state.advance(&sample)
        };
        for event in triggered {
            dispatch(events, event);
            fired.push(event);
        }
    }
    fired
}

fn read_loop(
    channel: Arc<Channel>,
    shared: Arc<Mutex<TelemetryShared>>,
    events: Arc<Mutex<EventRegistry>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    {
        let mut shared = shared.lock();
        shared.state.reset();
        shared.decoder.reset();
    }
    debug!("tilter reader started");

    while running.load(Ordering::SeqCst) {
        match channel.read(ReadMode::Line, true) {
            Ok(bytes) if !bytes.is_empty() => {
                let text = String::from_utf8_lossy(&bytes);
                ingest(&shared, &events, &text);
            }
            Ok(_) => {}
            Err(e) if channel.is_alive() => debug!("tilter read skipped: {e}"),
            Err(e) => {
                error!("tilter reader stopped: {e}");
                break;
            }
        }

        let next = Instant::now() + interval;
        while running.load(Ordering::SeqCst) && Instant::now() < next {
            thread::sleep(READER_TICK.min(interval));
        }
    }

    if channel.is_alive() {
        if let Err(e) = channel.close() {
            warn!("could not close tilter port: {e}");
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("tilter reader finished");
}

struct Reader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

// ============================================================================
// Driver
// ============================================================================

pub struct ChipTilter {
    channel: Arc<Channel>,
    settings: TilterSettings,
    setup: MotionSetup,
    shared: Arc<Mutex<TelemetryShared>>,
    events: Arc<Mutex<EventRegistry>>,
    reader: Option<Reader>,
    is_tilting: bool,
}

impl ChipTilter {
    pub fn new(channel: Arc<Channel>, settings: TilterSettings) -> Self {
        Self {
            channel,
            settings,
            setup: MotionSetup::new(),
            shared: Arc::new(Mutex::new(TelemetryShared::default())),
            events: Arc::new(Mutex::new(EventRegistry::new())),
            reader: None,
            is_tilting: false,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_alive()
    }

    pub fn port_info(&self) -> Option<PortCandidate> {
        self.channel.port_info()
    }

    /// Detect the tilter and, if configured, start reading telemetry.
    pub fn detect(&mut self) -> Result<PortCandidate> {
        self.stop_reader();
        let port = self.channel.detect()?;
        if self.settings.auto_read {
            self.start_reader()?;
        }
        Ok(port)
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    pub fn setup(&self) -> &MotionSetup {
        &self.setup
    }

    pub fn setup_mut(&mut self) -> &mut MotionSetup {
        &mut self.setup
    }

    pub fn set_value(&mut self, name: &str, raw: &str) -> Result<()> {
        self.setup.set_value(name, raw)
    }

    pub fn value(&self, name: &str) -> Result<Option<u32>> {
        self.setup.value(name)
    }

    fn write_frame(&self, frame: &[u8; 5], mode: WriteMode) -> Result<()> {
        let repeats = match mode {
            WriteMode::Normal => 1,
            WriteMode::Force => self.settings.force_retries.max(1),
        };
        for _ in 0..repeats {
            self.channel.write(frame, true)?;
            thread::sleep(Duration::from_millis(self.settings.frame_delay_ms));
            debug!("sent {} to tilter", to_hex(frame));
        }
        Ok(())
    }

    /// Open, write every frame (stopping at the first failure), then close.
    fn write_frames(&self, frames: &[[u8; 5]], mode: WriteMode) -> Result<()> {
        self.channel.open()?;
        let written = frames.iter().try_for_each(|f| self.write_frame(f, mode));
        let closed = self.channel.close();
        written?;
        closed
    }

    /// Send the pending setup frames.
    pub fn write_setup(&self, mode: WriteMode) -> Result<()> {
        self.write_frames(self.setup.frames(), mode)?;
        info!("tilter setup updated ({} frames)", self.setup.frames().len());
        Ok(())
    }

    /// Write the reset stream, putting every parameter back to its safe default.
    pub fn reset_setup(&self, mode: WriteMode) -> Result<()> {
        self.write_frames(&MotionSetup::reset_stream(), mode)?;
        info!("tilter setup reset");
        Ok(())
    }

    pub fn write_value(&self, param: MotionParam, value: u8) -> Result<()> {
        self.write_frames(&[encode_param(param.address(), value)], WriteMode::Normal)
    }

    // ------------------------------------------------------------------------
    // Motion
    // ------------------------------------------------------------------------

    pub fn start_tilter(&mut self) -> Result<()> {
        if !self.channel.is_alive() {
            error!("cannot start tilting, tilter is not connected");
            return Err(DriverError::NotAlive(self.channel.name().to_string()));
        }
        self.write_value(MotionParam::Status, STATUS_START)?;
        self.is_tilting = true;
        info!("started tilting");
        Ok(())
    }

    pub fn stop_tilter(&mut self) -> Result<()> {
        if !self.channel.is_alive() {
            error!("cannot stop tilting, tilter is not connected");
            return Err(DriverError::NotAlive(self.channel.name().to_string()));
        }
        self.write_value(MotionParam::Status, STATUS_STOP)?;
        self.is_tilting = false;
        info!("stopped tilting");
        Ok(())
    }

    pub fn is_tilting(&self) -> bool {
        self.is_tilting
    }

    // ------------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------------

    pub fn start_reader(&mut self) -> Result<()> {
        if self.is_reading() {
            return Ok(());
        }
        self.stop_reader();
        if !self.channel.is_alive() {
            return Err(DriverError::NotAlive(self.channel.name().to_string()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let channel = self.channel.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let flag = running.clone();
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        let handle = thread::Builder::new()
            .name("tilter-reader".into())
            .spawn(move || read_loop(channel, shared, events, flag, interval))?;
        self.reader = Some(Reader { running, handle });
        Ok(())
    }

    pub fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.running.store(false, Ordering::SeqCst);
            if reader.handle.join().is_err() {
                error!("tilter reader panicked");
            }
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|r| r.running.load(Ordering::SeqCst))
    }

    /// Feed raw telemetry text as if it came from the device.
    pub fn ingest(&self, text: &str) -> Vec<TilterEvent> {
        ingest(&self.shared, &self.events, text)
    }

    pub fn telemetry(&self) -> TelemetrySample {
        self.shared.lock().sample.clone()
    }

    pub fn parameter(&self, field: TelemetryField) -> Option<i64> {
        self.shared.lock().sample.get(field)
    }

    pub fn state(&self) -> TilterState {
        self.shared.lock().state.clone()
    }

    pub fn reset_state(&self) {
        self.shared.lock().state.reset();
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn set_event(
        &self,
        event: TilterEvent,
        callback: EventCallback,
        every_nth: u32,
        delay: Duration,
    ) -> HandlerId {
        self.events.lock().register(event, callback, every_nth, delay)
    }

    pub fn unset_event(&self, event: TilterEvent, id: HandlerId) -> bool {
        self.events.lock().unregister(event, id)
    }

    pub fn clear_event(&self, event: TilterEvent) {
        self.events.lock().clear(event);
    }

    pub fn handler_count(&self, event: TilterEvent) -> usize {
        self.events.lock().handler_count(event)
    }
}

impl Drop for ChipTilter {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

impl fmt::Debug for ChipTilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipTilter")
            .field("channel", &self.channel)
            .field("setup", &self.setup)
            .field("is_tilting", &self.is_tilting)
            .field("is_reading", &self.is_reading())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SerialSettings;
    use crate::mock::{MockConnector, MockDevice};
    use std::sync::atomic::AtomicUsize;

    fn fast() -> TilterSettings {
        TilterSettings {
            frame_delay_ms: 1,
            poll_interval_ms: 5,
            auto_read: false,
            ..TilterSettings::default()
        }
    }

    fn tilter(settings: TilterSettings) -> (ChipTilter, MockDevice) {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM5", "USB Serial Port (COM5)");
        let channel = Arc::new(Channel::new(
            "tilter",
            "USB Serial Port",
            SerialSettings::default(),
            connector,
        ));
        let mut t = ChipTilter::new(channel, settings);
        t.detect().unwrap();
        (t, dev)
    }

    #[test]
    fn frame_checksum_wraps() {
        assert_eq!(encode_param([0xFF, 0x00], 30), [0xFF, 0x00, 30, 29, b'#']);
        assert_eq!(encode_param([0xFF, 0x0C], 0x01), [0xFF, 0x0C, 0x01, 0x0C, 0x23]);
        assert_eq!(encode_param([0x01, 0x02], 0x03), [0x01, 0x02, 0x03, 0x06, b'#']);
    }

    #[test]
    fn addresses_follow_parameter_order() {
        assert_eq!(MotionParam::PosAngle.address(), [0xFF, 0x00]);
        assert_eq!(MotionParam::HorPauseSec.address(), [0xFF, 0x09]);
        assert_eq!(MotionParam::Status.address(), [0xFF, 0x0C]);
    }

    #[test]
    fn angles_and_motion_floor_at_one() {
        let mut setup = MotionSetup::new();
        setup.set_value("posAngle", "0").unwrap();
        setup.set_value("negMotion", "-4").unwrap();
        setup.set_value("posPauseSec", "0").unwrap();
        assert_eq!(setup.get(MotionParam::PosAngle), Some(1));
        assert_eq!(setup.get(MotionParam::NegMotion), Some(1));
        assert_eq!(setup.get(MotionParam::PosPauseSec), Some(0));
        assert_eq!(setup.frames().len(), 3);
    }

    #[test]
    fn pauses_split_and_carry() {
        let mut setup = MotionSetup::new();
        setup.set_value("posPause", "2:05").unwrap();
        setup.set_value("negPause", "75").unwrap();
        setup.set_value("horPause", "1:90").unwrap();
        assert_eq!(setup.get(MotionParam::PosPauseMin), Some(2));
        assert_eq!(setup.get(MotionParam::PosPauseSec), Some(5));
        assert_eq!(setup.get(MotionParam::NegPauseMin), Some(1));
        assert_eq!(setup.get(MotionParam::NegPauseSec), Some(15));
        assert_eq!(setup.get(MotionParam::HorPauseMin), Some(2));
        assert_eq!(setup.get(MotionParam::HorPauseSec), Some(30));
        assert_eq!(setup.value("negPause").unwrap(), Some(75));
        assert_eq!(
            setup.frames()[0..2],
            [
                encode_param([0xFF, 0x04], 2),
                encode_param([0xFF, 0x06], 5)
            ]
        );
    }

    #[test]
    fn total_time_is_hours_and_minutes() {
        let mut setup = MotionSetup::new();
        setup.set_value("totTime", "3:20").unwrap();
        assert_eq!(setup.get(MotionParam::TotTimeHrs), Some(3));
        assert_eq!(setup.get(MotionParam::TotTimeMin), Some(20));
        setup.set_value("totTime", "150").unwrap();
        assert_eq!(setup.get(MotionParam::TotTimeHrs), Some(2));
        assert_eq!(setup.get(MotionParam::TotTimeMin), Some(30));
    }

    #[test]
    fn rejected_input_leaves_setup_untouched() {
        let mut setup = MotionSetup::new();
        setup.set_value("posAngle", "20").unwrap();
        let before = setup.clone();
        for (name, raw) in [
            ("posAngle", "steep"),
            ("negAngle", "256"),
            ("posPause", "1:xx"),
            ("totTime", "-5"),
            ("posPause", "1:9223372036854775807"),
            ("horPause", "9223372036854775807:0"),
            ("sideways", "1"),
        ] {
            assert!(matches!(
                setup.set_value(name, raw),
                Err(DriverError::InvalidValue(_))
            ));
        }
        assert_eq!(setup, before);
        assert_eq!(setup.get(MotionParam::NegAngle), None);
    }

    #[test]
    fn reset_stream_covers_every_address() {
        let stream = MotionSetup::reset_stream();
        assert_eq!(stream.len(), 13);
        assert_eq!(stream[0], encode_param([0xFF, 0x00], 1));
        assert_eq!(stream[3], encode_param([0xFF, 0x03], 1));
        assert_eq!(stream[4], encode_param([0xFF, 0x04], 0));
        assert_eq!(stream[12], encode_param([0xFF, 0x0C], 0));
    }

    #[test]
    fn write_setup_sends_pending_frames_and_closes() {
        let (mut t, dev) = tilter(fast());
        t.set_value("posAngle", "30").unwrap();
        t.set_value("posMotion", "5").unwrap();
        t.write_setup(WriteMode::Normal).unwrap();

        let mut expected = Vec::new();
        expected.extend(encode_param([0xFF, 0x00], 30));
        expected.extend(encode_param([0xFF, 0x02], 5));
        assert_eq!(dev.written(), expected);
        assert!(!t.channel().is_open());
    }

    #[test]
    fn force_mode_repeats_each_frame() {
        let (mut t, dev) = tilter(fast());
        t.set_value("negAngle", "10").unwrap();
        t.set_value("status", "0").unwrap();
        t.write_setup(WriteMode::Force).unwrap();
        let written = dev.written();
        assert_eq!(written.len(), 2 * 3 * 5);
        assert_eq!(written[..5], written[5..10]);
        assert_eq!(written[25..], encode_param([0xFF, 0x0C], 0));
    }

    #[test]
    fn failed_write_aborts_setup() {
        let (mut t, dev) = tilter(fast());
        t.set_value("posAngle", "30").unwrap();
        dev.fail_io(true);
        assert!(t.write_setup(WriteMode::Normal).is_err());
        assert!(!t.is_connected());
    }

    #[test]
    fn start_and_stop_toggle_tilting() {
        let (mut t, dev) = tilter(fast());
        t.start_tilter().unwrap();
        assert!(t.is_tilting());
        t.stop_tilter().unwrap();
        assert!(!t.is_tilting());

        let mut expected = Vec::new();
        expected.extend(encode_param([0xFF, 0x0C], 0x01));
        expected.extend(encode_param([0xFF, 0x0C], 0x00));
        assert_eq!(dev.written(), expected);
    }

    #[test]
    fn start_without_device_fails() {
        let connector = Arc::new(MockConnector::new());
        let channel = Arc::new(Channel::new(
            "tilter",
            "USB Serial Port",
            SerialSettings::default(),
            connector,
        ));
        let mut t = ChipTilter::new(channel, fast());
        assert!(matches!(t.start_tilter(), Err(DriverError::NotAlive(_))));
        assert!(!t.is_tilting());
    }

    #[test]
    fn ingest_dispatches_handlers() {
        let (t, _) = tilter(fast());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        t.set_event(
            TilterEvent::OnPosDown,
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            1,
            Duration::ZERO,
        );
        let fired = t.ingest("ID1;m5;p0#");
        assert_eq!(fired, vec![TilterEvent::OnPosDown]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(t.parameter(TelemetryField::MotionLeft), Some(5));
    }

    #[test]
    fn reader_thread_decodes_device_stream() {
        let (mut t, dev) = tilter(fast());
        dev.push_incoming(b"ID1;A+65;A-6");
        t.start_reader().unwrap();
        assert!(t.is_reading());
        dev.push_incoming(b"5;m7;p0#");

        let deadline = Instant::now() + Duration::from_secs(2);
        while t.parameter(TelemetryField::MotionLeft).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        t.stop_reader();
        assert!(!t.is_reading());
        assert_eq!(t.parameter(TelemetryField::NegAngle), Some(65));
        assert_eq!(t.parameter(TelemetryField::MotionLeft), Some(7));
        assert_eq!(t.state().cycle_count, 0);
    }

    #[test]
    fn reader_ends_when_device_dies() {
        let (mut t, dev) = tilter(fast());
        t.start_reader().unwrap();
        dev.fail_io(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.is_reading() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!t.is_reading());
        assert!(!t.is_connected());
    }
}
