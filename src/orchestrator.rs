//! Measurement sequencing across the three instruments.
//!
//! The switchboard and the lock-in are mandatory, the tilter is optional.
//! A measurement either starts right away or, synced with the tilter, is
//! started on every `onPosUp` and stopped on every `onNegUp` by tilter
//! event handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::channel::{Channel, Connector, PortCandidate};
use crate::config::RigConfig;
use crate::errors::{DeviceFailure, DeviceKind, DriverError, Result};
use crate::events::{EventCallback, HandlerId, TilterEvent};
use crate::lockin::{LockIn, SessionProvider};
use crate::switchboard::{
    DefinedPairs, ElectrodePair, PairId, SelectionOptions, SelectionStrategy, Switchboard,
};
use crate::tilter::ChipTilter;

// ============================================================================
// Selection Policy
// ============================================================================

/// Odd ids count cells, even ids check viability.
///
/// Counting pairs come first, then viability pairs, each ascending; with
/// `per_chamber` the included pairs are merged into one ascending list.
/// Calibration pairs always go last.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingViabilityStrategy;

impl SelectionStrategy for CountingViabilityStrategy {
    fn select(&self, pairs: &DefinedPairs, options: &SelectionOptions) -> Vec<ElectrodePair> {
        let included = |pair: &&ElectrodePair| match pair.id {
            PairId::Numeric(id) if id % 2 == 1 => options.counting,
            PairId::Numeric(_) => options.viability,
            PairId::Calibration(_) => true,
        };

        if options.per_chamber {
            return pairs.values().filter(included).copied().collect();
        }

        let (numeric, calibration): (Vec<&ElectrodePair>, Vec<&ElectrodePair>) = pairs
            .values()
            .filter(included)
            .partition(|p| p.id.numeric().is_some());
        let (counting, viability): (Vec<&ElectrodePair>, Vec<&ElectrodePair>) = numeric
            .into_iter()
            .partition(|p| p.id.numeric().is_some_and(|id| id % 2 == 1));

        counting
            .into_iter()
            .chain(viability)
            .chain(calibration)
            .copied()
            .collect()
    }
}

// ============================================================================
// Measurement Flags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeasurementFlags {
    pub use_tilter: bool,
    /// Start on `onPosUp`, stop on `onNegUp` instead of right away.
    pub sync_with_tilter: bool,
    /// Re-upload the schedule on `onPosUp`, and viability-only on `onNegWait`.
    pub switch_with_tilter: bool,
    pub switch_delay_ms: u64,
    pub selection: SelectionOptions,
}

impl Default for MeasurementFlags {
    fn default() -> Self {
        Self {
            use_tilter: false,
            sync_with_tilter: false,
            switch_with_tilter: false,
            switch_delay_ms: 0,
            selection: SelectionOptions::default(),
        }
    }
}

impl MeasurementFlags {
    pub fn switch_delay(&self) -> Duration {
        Duration::from_millis(self.switch_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigState {
    Idle,
    Armed,
    Recording,
}

impl fmt::Display for RigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RigState::Idle => "idle",
            RigState::Armed => "armed",
            RigState::Recording => "recording",
        })
    }
}

fn fail(device: DeviceKind) -> impl FnOnce(DriverError) -> DeviceFailure {
    move |source| DeviceFailure::new(device, source)
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    switchboard: Arc<Mutex<Switchboard>>,
    lockin: Arc<Mutex<LockIn>>,
    tilter: ChipTilter,
    registered: Vec<(TilterEvent, HandlerId)>,
    /// Cleared on stop so handlers already dispatched do nothing.
    armed: Arc<AtomicBool>,
    running: bool,
}

impl Orchestrator {
    pub fn new(switchboard: Switchboard, tilter: ChipTilter, lockin: LockIn) -> Self {
        let switchboard = switchboard.with_strategy(Box::new(CountingViabilityStrategy));
        Self {
            switchboard: Arc::new(Mutex::new(switchboard)),
            lockin: Arc::new(Mutex::new(lockin)),
            tilter,
            registered: Vec::new(),
            armed: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }

    /// Build all three devices from a config, loading the lookup tables.
    pub fn from_config(
        config: &RigConfig,
        connector: Arc<dyn Connector>,
        provider: Box<dyn SessionProvider>,
    ) -> Result<Self> {
        let tables = config.tables.load()?;
        let switching = Channel::new(
            "switchboard",
            config.switching.descriptor.clone(),
            config.switching.serial.clone(),
            connector.clone(),
        )
        .with_lock_timeout(config.lock_timeout());
        let tilting = Channel::new(
            "tilter",
            config.tilter.descriptor.clone(),
            config.tilter.serial.clone(),
            connector,
        )
        .with_lock_timeout(config.lock_timeout());

        Ok(Self::new(
            Switchboard::new(Arc::new(switching), tables),
            ChipTilter::new(Arc::new(tilting), config.tilter.settings.clone()),
            LockIn::new(provider, config.lockin.clone()),
        ))
    }

    /// Replace the electrode-pair selection policy.
    pub fn with_strategy(self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.switchboard.lock().set_strategy(strategy);
        self
    }

    pub fn switchboard(&self) -> &Arc<Mutex<Switchboard>> {
        &self.switchboard
    }

    pub fn lockin(&self) -> &Arc<Mutex<LockIn>> {
        &self.lockin
    }

    pub fn tilter(&self) -> &ChipTilter {
        &self.tilter
    }

    pub fn tilter_mut(&mut self) -> &mut ChipTilter {
        &mut self.tilter
    }

    // ------------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------------

    /// Detect one device and describe where it was found.
    pub fn detect(&mut self, device: DeviceKind) -> std::result::Result<String, DeviceFailure> {
        match device {
            DeviceKind::Switching => self
                .switchboard
                .lock()
                .detect()
                .map(|p| p.to_string())
                .map_err(fail(device)),
            DeviceKind::Tilter => self
                .tilter
                .detect()
                .map(|p| p.to_string())
                .map_err(fail(device)),
            DeviceKind::Lockin => self
                .lockin
                .lock()
                .detect()
                .map(|i| i.to_string())
                .map_err(fail(device)),
        }
    }

    /// Detect every device; failures are logged and reported per device.
    pub fn detect_all(&mut self) -> Vec<(DeviceKind, std::result::Result<String, DeviceFailure>)> {
        DeviceKind::ALL
            .into_iter()
            .map(|device| {
                let result = self.detect(device);
                match &result {
                    Ok(place) => info!("{device} found: {place}"),
                    Err(e) => warn!("{e}"),
                }
                (device, result)
            })
            .collect()
    }

    pub fn is_connected(&self, device: DeviceKind) -> bool {
        match device {
            DeviceKind::Switching => self.switchboard.lock().is_connected(),
            DeviceKind::Tilter => self.tilter.is_connected(),
            DeviceKind::Lockin => self.lockin.lock().is_connected(),
        }
    }

    pub fn detection_status(&self) -> Vec<(DeviceKind, bool)> {
        DeviceKind::ALL
            .into_iter()
            .map(|d| (d, self.is_connected(d)))
            .collect()
    }

    pub fn port_info(&self, device: DeviceKind) -> Option<String> {
        let port = |p: Option<PortCandidate>| p.map(|p| p.to_string());
        match device {
            DeviceKind::Switching => port(self.switchboard.lock().channel().port_info()),
            DeviceKind::Tilter => port(self.tilter.port_info()),
            DeviceKind::Lockin => self.lockin.lock().session_info().map(|i| i.to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Electrode Pairs
    // ------------------------------------------------------------------------

    pub fn define_pair(&self, id: impl Into<PairId>, interval_us: u32) {
        self.switchboard.lock().define_pair(id, interval_us);
    }

    pub fn undefine_all(&self) {
        self.switchboard.lock().undefine_all();
    }

    pub fn select(&self, options: &SelectionOptions) -> Vec<ElectrodePair> {
        self.switchboard.lock().select(options)
    }

    /// Upload the electrode schedule for `options`.
    pub fn setup_switching(&self, options: &SelectionOptions) -> std::result::Result<(), DeviceFailure> {
        self.switchboard
            .lock()
            .setup(options)
            .map_err(fail(DeviceKind::Switching))
    }

    // ------------------------------------------------------------------------
    // Measurement
    // ------------------------------------------------------------------------

    pub fn state(&self) -> RigState {
        if self.running {
            RigState::Recording
        } else if self.is_connected(DeviceKind::Switching) && self.is_connected(DeviceKind::Lockin) {
            RigState::Armed
        } else {
            RigState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn register(&mut self, event: TilterEvent, callback: EventCallback, delay: Duration) {
        let id = self.tilter.set_event(event, callback, 1, delay);
        self.registered.push((event, id));
    }

    fn unregister_all(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
        for (event, id) in self.registered.drain(..) {
            self.tilter.unset_event(event, id);
        }
    }

    fn register_switching(&mut self, flags: &MeasurementFlags) {
        let board = self.switchboard.clone();
        let armed = self.armed.clone();
        let selection = flags.selection;
        self.register(
            TilterEvent::OnPosUp,
            Arc::new(move || {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = board.lock().setup(&selection) {
                    error!("switchboard setup on onPosUp failed: {e}");
                }
            }),
            Duration::ZERO,
        );

        let board = self.switchboard.clone();
        let armed = self.armed.clone();
        let viability = flags.selection.viability_only();
        self.register(
            TilterEvent::OnNegWait,
            Arc::new(move || {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = board.lock().setup(&viability) {
                    error!("switchboard setup on onNegWait failed: {e}");
                }
            }),
            flags.switch_delay(),
        );
    }

    fn register_sync(&mut self) {
        let board = self.switchboard.clone();
        let lockin = self.lockin.clone();
        let armed = self.armed.clone();
        self.register(
            TilterEvent::OnPosUp,
            Arc::new(move || {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = board.lock().start() {
                    error!("switchboard start on onPosUp failed: {e}");
                }
                if let Err(e) = lockin.lock().start_poll(None) {
                    error!("lock-in start on onPosUp failed: {e}");
                }
            }),
            Duration::ZERO,
        );

        let board = self.switchboard.clone();
        let lockin = self.lockin.clone();
        let armed = self.armed.clone();
        self.register(
            TilterEvent::OnNegUp,
            Arc::new(move || {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = board.lock().stop() {
                    error!("switchboard stop on onNegUp failed: {e}");
                }
                if let Err(e) = lockin.lock().stop_poll(true) {
                    error!("lock-in stop on onNegUp failed: {e}");
                }
            }),
            Duration::ZERO,
        );
    }

    fn start_devices(&mut self, flags: &MeasurementFlags) -> std::result::Result<(), DeviceFailure> {
        if !self.is_connected(DeviceKind::Switching) {
            return Err(DeviceFailure::new(
                DeviceKind::Switching,
                DriverError::NotAlive("switchboard".into()),
            ));
        }
        if !self.is_connected(DeviceKind::Lockin) {
            return Err(DeviceFailure::new(
                DeviceKind::Lockin,
                DriverError::NotAlive("lock-in".into()),
            ));
        }

        let mut start_right_away = true;
        self.armed.store(true, Ordering::SeqCst);
        if flags.use_tilter {
            if self.tilter.is_connected() {
                if flags.switch_with_tilter {
                    self.register_switching(flags);
                }
                if flags.sync_with_tilter {
                    self.register_sync();
                    start_right_away = false;
                }
                self.tilter.start_tilter().map_err(fail(DeviceKind::Tilter))?;
            } else {
                warn!("tilter requested but not connected, starting without it");
            }
        }

        if start_right_away {
            self.switchboard
                .lock()
                .start()
                .map_err(fail(DeviceKind::Switching))?;
            self.lockin
                .lock()
                .start_poll(None)
                .map_err(fail(DeviceKind::Lockin))?;
        }
        Ok(())
    }

    /// Start a measurement; on failure every device is stopped again.
    pub fn start(&mut self, flags: &MeasurementFlags) -> std::result::Result<(), DeviceFailure> {
        self.unregister_all();
        match self.start_devices(flags) {
            Ok(()) => {
                self.running = true;
                info!("measurement started");
                Ok(())
            }
            Err(failure) => {
                error!("measurement start aborted: {failure}");
                self.unregister_all();
                self.halt_all();
                Err(failure)
            }
        }
    }

    /// Best-effort stop of every connected device, errors only logged.
    fn halt_all(&mut self) {
        if self.is_connected(DeviceKind::Switching) {
            if let Err(e) = self.switchboard.lock().stop() {
                warn!("switchboard stop: {e}");
            }
        }
        if let Err(e) = self.lockin.lock().stop_poll(false) {
            warn!("lock-in stop: {e}");
        }
        if self.tilter.is_connected() {
            if let Err(e) = self.tilter.stop_tilter() {
                warn!("tilter stop: {e}");
            }
        }
    }

    /// Stop every device; all are attempted, the first failure is reported.
    ///
    /// A connected tilter is stopped whatever `_flags` say, since it may
    /// still be moving from an earlier start.
    pub fn stop(&mut self, _flags: &MeasurementFlags) -> std::result::Result<(), DeviceFailure> {
        self.unregister_all();

        let switching = self
            .switchboard
            .lock()
            .stop()
            .map_err(fail(DeviceKind::Switching));
        let lockin = self
            .lockin
            .lock()
            .stop_poll(false)
            .map_err(fail(DeviceKind::Lockin));
        let tilter = if self.tilter.is_connected() {
            self.tilter.stop_tilter().map_err(fail(DeviceKind::Tilter))
        } else {
            Ok(())
        };

        self.running = false;
        info!("measurement stopped");
        switching.and(lockin).and(tilter)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tilter", &self.tilter)
            .field("registered", &self.registered.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SerialSettings;
    use crate::lockin::{LockinSettings, RecordStatus};
    use crate::mock::{MockConnector, MockDevice, MockSessionProvider};
    use crate::switchboard::{CalibrationTag, SwitchTables};
    use crate::tilter::{encode_param, MotionParam, TilterSettings};
    use std::thread;
    use std::time::Instant;

    fn pairs(ids: &[u32]) -> DefinedPairs {
        ids.iter()
            .map(|&id| {
                let id = PairId::Numeric(id);
                (id, ElectrodePair { id, interval_us: 1000 })
            })
            .collect()
    }

    fn ids(selected: &[ElectrodePair]) -> Vec<PairId> {
        selected.iter().map(|p| p.id).collect()
    }

    #[test]
    fn counting_before_viability() {
        let selected =
            CountingViabilityStrategy.select(&pairs(&[4, 1, 2, 3]), &SelectionOptions::default());
        assert_eq!(ids(&selected), [1, 3, 2, 4].map(PairId::Numeric).to_vec());
    }

    #[test]
    fn per_chamber_merges_ascending() {
        let options = SelectionOptions {
            per_chamber: true,
            ..SelectionOptions::default()
        };
        let selected = CountingViabilityStrategy.select(&pairs(&[4, 1, 2, 3]), &options);
        assert_eq!(ids(&selected), [1, 2, 3, 4].map(PairId::Numeric).to_vec());

        let viability = options.viability_only();
        let selected = CountingViabilityStrategy.select(&pairs(&[4, 1, 2, 3]), &viability);
        assert_eq!(ids(&selected), [2, 4].map(PairId::Numeric).to_vec());
    }

    #[test]
    fn disabled_groups_are_left_out() {
        let defined = pairs(&[1, 2, 3, 4]);
        let viability = SelectionOptions::default().viability_only();
        assert_eq!(
            ids(&CountingViabilityStrategy.select(&defined, &viability)),
            [2, 4].map(PairId::Numeric).to_vec()
        );
        let none = SelectionOptions {
            counting: false,
            viability: false,
            ..SelectionOptions::default()
        };
        assert!(CountingViabilityStrategy.select(&defined, &none).is_empty());
    }

    #[test]
    fn calibration_pairs_go_last() {
        let mut defined = pairs(&[2, 1]);
        let short = PairId::Calibration(CalibrationTag::Short);
        defined.insert(short, ElectrodePair { id: short, interval_us: 5 });
        let selected = CountingViabilityStrategy.select(&defined, &SelectionOptions::default());
        assert_eq!(
            ids(&selected),
            vec![PairId::Numeric(1), PairId::Numeric(2), short]
        );
    }

    struct Rig {
        orchestrator: Orchestrator,
        board: MockDevice,
        tilt: MockDevice,
        _dir: tempfile::TempDir,
    }

    fn rig(lockin_ids: &[&str]) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::new());
        let board = connector.add_port("COM3", "Arduino Uno (COM3)");
        let tilt = connector.add_port("COM5", "USB Serial Port (COM5)");
        let channel = |name: &str, descriptor: &str| {
            Arc::new(Channel::new(
                name,
                descriptor,
                SerialSettings::default(),
                connector.clone(),
            ))
        };
        let switchboard = Switchboard::new(channel("switchboard", "Arduino Uno"), SwitchTables::default());
        let tilter = ChipTilter::new(
            channel("tilter", "USB Serial Port"),
            TilterSettings {
                frame_delay_ms: 1,
                auto_read: false,
                ..TilterSettings::default()
            },
        );
        let lockin = LockIn::new(
            Box::new(MockSessionProvider::new(lockin_ids)),
            LockinSettings {
                base_folder: dir.path().to_path_buf(),
                ..LockinSettings::default()
            },
        );
        let mut orchestrator = Orchestrator::new(switchboard, tilter, lockin);
        orchestrator.detect_all();
        Rig {
            orchestrator,
            board,
            tilt,
            _dir: dir,
        }
    }

    #[test]
    fn armed_needs_switching_and_lockin() {
        assert_eq!(rig(&["dev10"]).orchestrator.state(), RigState::Armed);
        assert_eq!(rig(&[]).orchestrator.state(), RigState::Idle);
    }

    #[test]
    fn immediate_start_and_stop() {
        let mut rig = rig(&["dev10"]);
        let flags = MeasurementFlags::default();
        rig.orchestrator.start(&flags).unwrap();
        assert_eq!(rig.orchestrator.state(), RigState::Recording);
        assert!(rig.orchestrator.lockin().lock().is_polling());
        assert_eq!(rig.board.written(), b"start\r".to_vec());

        rig.orchestrator.stop(&flags).unwrap();
        assert_eq!(rig.orchestrator.state(), RigState::Armed);
        assert_eq!(rig.orchestrator.lockin().lock().status(), RecordStatus::Stopped);
        assert_eq!(rig.board.written(), b"start\rstop\r".to_vec());
        assert_eq!(rig.tilt.written(), stop_frame());
    }

    fn stop_frame() -> Vec<u8> {
        encode_param(MotionParam::Status.address(), 0).to_vec()
    }

    #[test]
    fn stop_halts_tilter_started_earlier() {
        let mut rig = rig(&["dev10"]);
        let tilting = MeasurementFlags {
            use_tilter: true,
            ..MeasurementFlags::default()
        };
        rig.orchestrator.start(&tilting).unwrap();
        assert!(rig.orchestrator.tilter().is_tilting());
        rig.tilt.clear_written();

        rig.orchestrator.stop(&MeasurementFlags::default()).unwrap();
        assert!(!rig.orchestrator.tilter().is_tilting());
        assert_eq!(rig.tilt.written(), stop_frame());
    }

    #[test]
    fn stop_failure_names_the_device_and_stops_the_rest() {
        let mut rig = rig(&["dev10"]);
        let flags = MeasurementFlags {
            use_tilter: true,
            ..MeasurementFlags::default()
        };
        rig.orchestrator.start(&flags).unwrap();
        rig.tilt.clear_written();
        rig.board.fail_io(true);

        let failure = rig.orchestrator.stop(&flags).unwrap_err();
        assert_eq!(failure.device, DeviceKind::Switching);
        assert!(!rig.orchestrator.is_running());
        assert!(!rig.orchestrator.lockin().lock().is_polling());
        assert_eq!(rig.orchestrator.lockin().lock().status(), RecordStatus::Stopped);
        assert!(!rig.orchestrator.tilter().is_tilting());
        assert_eq!(rig.tilt.written(), stop_frame());
    }

    #[test]
    fn handlers_in_flight_do_nothing_after_stop() {
        let mut rig = rig(&["dev10"]);
        rig.orchestrator.define_pair(PairId::Calibration(CalibrationTag::Short), 100);
        let flags = MeasurementFlags {
            use_tilter: true,
            switch_with_tilter: true,
            switch_delay_ms: 150,
            ..MeasurementFlags::default()
        };
        rig.orchestrator.start(&flags).unwrap();
        rig.tilt.push_incoming(b"m5;p0#m0;p3#m4;p0#m5;p0#m0;p2#\n");
        rig.orchestrator.tilter_mut().start_reader().unwrap();

        // onPosUp uploads right away, onNegWait is still sleeping
        let deadline = Instant::now() + Duration::from_secs(2);
        while !String::from_utf8_lossy(&rig.board.written()).contains("setelectrodes")
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(2));
        }
        rig.orchestrator.stop(&flags).unwrap();

        thread::sleep(Duration::from_millis(300));
        rig.orchestrator.tilter_mut().stop_reader();
        assert!(rig.board.written().ends_with(b"stop\r"));
    }

    #[test]
    fn missing_lockin_is_named() {
        let mut rig = rig(&[]);
        let failure = rig.orchestrator.start(&MeasurementFlags::default()).unwrap_err();
        assert_eq!(failure.device, DeviceKind::Lockin);
        assert!(!rig.orchestrator.is_running());
    }

    #[test]
    fn start_failure_stops_everything() {
        let mut rig = rig(&["dev10"]);
        rig.tilt.fail_io(true);
        let flags = MeasurementFlags {
            use_tilter: true,
            ..MeasurementFlags::default()
        };
        let failure = rig.orchestrator.start(&flags).unwrap_err();
        assert_eq!(failure.device, DeviceKind::Tilter);
        assert!(!rig.orchestrator.lockin().lock().is_polling());
        assert_eq!(rig.board.written(), b"stop\r".to_vec());
        assert_eq!(rig.orchestrator.tilter().handler_count(TilterEvent::OnPosUp), 0);
    }

    #[test]
    fn synced_start_waits_for_tilter() {
        let mut rig = rig(&["dev10"]);
        let flags = MeasurementFlags {
            use_tilter: true,
            sync_with_tilter: true,
            ..MeasurementFlags::default()
        };
        rig.orchestrator.start(&flags).unwrap();
        assert!(rig.orchestrator.tilter().is_tilting());
        assert!(!rig.orchestrator.lockin().lock().is_polling());
        assert!(rig.board.written().is_empty());

        let tilter = rig.orchestrator.tilter();
        tilter.ingest("m5;p0#");
        tilter.ingest("m0;p3#");
        tilter.ingest("m4;p0#");
        assert!(rig.orchestrator.lockin().lock().is_polling());
        assert_eq!(rig.board.written(), b"start\r".to_vec());

        tilter.ingest("m5;p0#m0;p2#m4;p0#");
        assert!(!rig.orchestrator.lockin().lock().is_polling());
        assert_eq!(rig.orchestrator.lockin().lock().status(), RecordStatus::Paused);
        assert_eq!(rig.board.written(), b"start\rstop\r".to_vec());

        rig.orchestrator.stop(&flags).unwrap();
        assert!(!rig.orchestrator.tilter().is_tilting());
        for event in TilterEvent::ALL {
            assert_eq!(rig.orchestrator.tilter().handler_count(event), 0);
        }
    }

    #[test]
    fn switch_with_tilter_reuploads_schedule() {
        let mut rig = rig(&["dev10"]);
        rig.orchestrator.define_pair(PairId::Calibration(CalibrationTag::Resistor), 100);
        let flags = MeasurementFlags {
            use_tilter: true,
            switch_with_tilter: true,
            ..MeasurementFlags::default()
        };
        rig.orchestrator.start(&flags).unwrap();
        assert_eq!(rig.orchestrator.tilter().handler_count(TilterEvent::OnPosUp), 1);
        assert_eq!(rig.orchestrator.tilter().handler_count(TilterEvent::OnNegWait), 1);
        rig.board.clear_written();

        rig.orchestrator.tilter().ingest("m5;p0#m0;p3#m4;p0#");
        let sent = String::from_utf8(rig.board.written()).unwrap();
        assert_eq!(sent, "debug 0\rsetelectrodes 1 3e3f0000000064\r");
        rig.orchestrator.stop(&flags).unwrap();
    }
}
