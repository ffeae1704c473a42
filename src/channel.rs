//! Exclusive-access transport over a single point-to-point link.
//!
//! A [`Channel`] finds its device by matching a descriptor string against the
//! enumerated ports, then serializes every open/close/read/write behind one
//! mutex. Lock acquisition is bounded: a caller that cannot get the channel
//! within `lock_timeout` gets [`DriverError::LockTimeout`] instead of waiting
//! forever.
//!
//! Any I/O failure (read timeouts excluded) drops the link and marks the
//! channel dead. A dead channel refuses all traffic until [`Channel::detect`]
//! or [`Channel::bind`] succeeds again.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate for the rig's USB-serial devices
const BAUD_RATE: u32 = 9600;

/// Per-call read timeout of the underlying port
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// How long any operation may wait for exclusive access
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between availability checks while draining
const DRAIN_TICK: Duration = Duration::from_millis(1);

/// Upper bound on a single line read
const MAX_LINE: usize = 4096;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// A byte link that can report how many bytes are waiting to be read.
pub trait Link: Read + Write + Send {
    fn bytes_to_read(&self) -> io::Result<usize>;
}

/// One enumerated port and the text its descriptor is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub description: String,
}

impl fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.name)
    }
}

/// Enumerates and opens ports. The real implementation is [`SerialConnector`].
pub trait Connector: Send + Sync {
    fn enumerate(&self) -> Result<Vec<PortCandidate>>;
    fn open(&self, port: &PortCandidate, settings: &SerialSettings) -> Result<Box<dyn Link>>;
}

/// Line settings for a serial link (8N1, no flow control).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub timeout_ms: u64,
    /// Level DTR is forced to after opening; low keeps Arduino boards out of reset.
    pub dtr: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            timeout_ms: READ_TIMEOUT.as_millis() as u64,
            dtr: false,
        }
    }
}

impl SerialSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Serial Port Backend
// ============================================================================

struct SerialLink(Box<dyn SerialPort>);

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Link for SerialLink {
    fn bytes_to_read(&self) -> io::Result<usize> {
        Ok(self.0.bytes_to_read()? as usize)
    }
}

/// Connector backed by the operating system's serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl SerialConnector {
    fn describe(port_type: &SerialPortType) -> String {
        match port_type {
            SerialPortType::UsbPort(info) => {
                let product = info.product.clone().unwrap_or_default();
                match &info.manufacturer {
                    Some(manufacturer) if !product.contains(manufacturer.as_str()) => {
                        format!("{product} [{manufacturer}]")
                    }
                    _ => product,
                }
            }
            SerialPortType::BluetoothPort => "Bluetooth Port".to_string(),
            SerialPortType::PciPort => "PCI Port".to_string(),
            SerialPortType::Unknown => String::new(),
        }
    }
}

impl Connector for SerialConnector {
    fn enumerate(&self) -> Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| PortCandidate {
                description: Self::describe(&p.port_type),
                name: p.port_name,
            })
            .collect())
    }

    fn open(&self, port: &PortCandidate, settings: &SerialSettings) -> Result<Box<dyn Link>> {
        let mut serial = serialport::new(&port.name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout())
            .open()?;
        if let Err(e) = serial.write_data_terminal_ready(settings.dtr) {
            warn!("could not set DTR on {}: {}", port.name, e);
        }
        Ok(Box::new(SerialLink(serial)))
    }
}

// ============================================================================
// Read Modes
// ============================================================================

/// How a [`Channel::read`] collects bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// One read call, at most one byte.
    Single,
    /// Read until `\n` or until the port stops delivering.
    Line,
    /// Wait up to `wait` for the first byte, then keep draining until `idle`
    /// of consecutive silence.
    Drain { wait: Duration, idle: Duration },
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// One read call where a port timeout means "nothing there".
fn read_some(link: &mut dyn Link, buf: &mut [u8]) -> io::Result<usize> {
    match link.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if is_timeout(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

fn read_line(link: &mut dyn Link) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while line.len() < MAX_LINE {
        if read_some(link, &mut byte)? == 0 {
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(line)
}

fn drain(link: &mut dyn Link, wait: Duration, idle: Duration) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();

    let deadline = Instant::now() + wait;
    while link.bytes_to_read()? == 0 && Instant::now() < deadline {
        thread::sleep(DRAIN_TICK);
    }

    let mut silent_since = Instant::now();
    loop {
        let waiting = link.bytes_to_read()?;
        if waiting > 0 {
            let mut buf = vec![0u8; waiting];
            let n = read_some(link, &mut buf)?;
            data.extend_from_slice(&buf[..n]);
            silent_since = Instant::now();
            continue;
        }
        if silent_since.elapsed() >= idle {
            break;
        }
        thread::sleep(DRAIN_TICK);
    }
    Ok(data)
}

// ============================================================================
// Channel
// ============================================================================

struct ChannelState {
    candidates: Vec<PortCandidate>,
    bound: Option<PortCandidate>,
    link: Option<Box<dyn Link>>,
    alive: bool,
}

/// Shared, mutually exclusive access to one device link.
pub struct Channel {
    name: String,
    descriptor: String,
    settings: SerialSettings,
    connector: Arc<dyn Connector>,
    lock_timeout: Duration,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Create an unbound channel; call [`Channel::detect`] before any traffic.
    pub fn new(
        name: impl Into<String>,
        descriptor: impl Into<String>,
        settings: SerialSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            settings,
            connector,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            state: Mutex::new(ChannelState {
                candidates: Vec::new(),
                bound: None,
                link: None,
                alive: false,
            }),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChannelState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| DriverError::LockTimeout(self.name.clone()))
    }

    /// Enumerate ports and bind the single one whose description contains the descriptor.
    pub fn detect(&self) -> Result<PortCandidate> {
        let mut state = self.lock()?;
        state.link = None;
        state.bound = None;
        state.alive = false;

        info!("trying to detect {} ('{}')", self.name, self.descriptor);
        let matches: Vec<PortCandidate> = self
            .connector
            .enumerate()?
            .into_iter()
            .filter(|p| p.description.contains(&self.descriptor))
            .collect();
        for port in &matches {
            info!("found '{}' on '{}'", port.description, port.name);
        }
        state.candidates = matches.clone();

        match matches.len() {
            0 => {
                info!("{} could not be found", self.name);
                Err(DriverError::DeviceNotFound {
                    descriptor: self.descriptor.clone(),
                })
            }
            1 => {
                let port = matches.into_iter().next().ok_or_else(|| {
                    DriverError::DeviceNotFound {
                        descriptor: self.descriptor.clone(),
                    }
                })?;
                state.bound = Some(port.clone());
                state.alive = true;
                Ok(port)
            }
            _ => {
                warn!(
                    "{} ports match '{}', choose one with bind()",
                    matches.len(),
                    self.descriptor
                );
                Err(DriverError::AmbiguousDevice {
                    descriptor: self.descriptor.clone(),
                    ports: matches.iter().map(|p| p.name.clone()).collect(),
                })
            }
        }
    }

    /// Ports that matched during the last [`Channel::detect`].
    pub fn candidates(&self) -> Vec<PortCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Resolve an ambiguous detection by choosing one of the candidates.
    pub fn bind(&self, index: usize) -> Result<PortCandidate> {
        let mut state = self.lock()?;
        let port = state.candidates.get(index).cloned().ok_or_else(|| {
            DriverError::Config(format!(
                "{}: no candidate port at index {index}",
                self.name
            ))
        })?;
        state.link = None;
        state.bound = Some(port.clone());
        state.alive = true;
        info!("{} bound to '{}'", self.name, port.name);
        Ok(port)
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().link.is_some()
    }

    pub fn port_info(&self) -> Option<PortCandidate> {
        self.state.lock().bound.clone()
    }

    fn fail(&self, state: &mut ChannelState, what: &str, e: &dyn fmt::Display) {
        let port = state
            .bound
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        error!("{}: {} failed on '{}': {}", self.name, what, port, e);
        state.link = None;
        state.alive = false;
    }

    fn ensure_open<'a>(&self, state: &'a mut ChannelState) -> Result<&'a mut Box<dyn Link>> {
        if !state.alive {
            return Err(DriverError::NotAlive(self.name.clone()));
        }
        if state.link.is_none() {
            let port = state
                .bound
                .clone()
                .ok_or_else(|| DriverError::NotAlive(self.name.clone()))?;
            match self.connector.open(&port, &self.settings) {
                Ok(link) => {
                    debug!("{}: opened '{}'", self.name, port.name);
                    state.link = Some(link);
                }
                Err(e) => {
                    self.fail(state, "open", &e);
                    return Err(e);
                }
            }
        }
        state
            .link
            .as_mut()
            .ok_or_else(|| DriverError::NotAlive(self.name.clone()))
    }

    /// Open the link if it is not open yet.
    pub fn open(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.ensure_open(&mut state).map(|_| ())
    }

    /// Close the link if it is open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.alive {
            return Err(DriverError::NotAlive(self.name.clone()));
        }
        if let Some(mut link) = state.link.take() {
            if let Err(e) = link.flush() {
                self.fail(&mut state, "close", &e);
                return Err(e.into());
            }
            debug!("{}: closed", self.name);
        }
        Ok(())
    }

    /// Write all bytes; the link is closed afterwards unless `keep_open`.
    pub fn write(&self, data: &[u8], keep_open: bool) -> Result<()> {
        let mut state = self.lock()?;
        let link = self.ensure_open(&mut state)?;
        let result = link.write_all(data).and_then(|_| link.flush());
        if let Err(e) = result {
            self.fail(&mut state, "write", &e);
            return Err(e.into());
        }
        if !keep_open {
            state.link = None;
        }
        Ok(())
    }

    /// Read according to `mode`; the link is closed afterwards unless `keep_open`.
    pub fn read(&self, mode: ReadMode, keep_open: bool) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        let link = self.ensure_open(&mut state)?;
        let result = match mode {
            ReadMode::Single => {
                let mut byte = [0u8; 1];
                read_some(link.as_mut(), &mut byte).map(|n| byte[..n].to_vec())
            }
            ReadMode::Line => read_line(link.as_mut()),
            ReadMode::Drain { wait, idle } => drain(link.as_mut(), wait, idle),
        };
        match result {
            Ok(data) => {
                if !keep_open {
                    state.link = None;
                }
                Ok(data)
            }
            Err(e) => {
                self.fail(&mut state, "read", &e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;

    fn channel(connector: &Arc<MockConnector>) -> Channel {
        Channel::new(
            "switchboard",
            "Arduino Uno",
            SerialSettings::default(),
            connector.clone(),
        )
    }

    #[test]
    fn detect_binds_single_match() {
        let connector = Arc::new(MockConnector::new());
        connector.add_port("COM3", "Arduino Uno (COM3)");
        connector.add_port("COM4", "USB Serial Port (COM4)");
        let ch = channel(&connector);

        let port = ch.detect().unwrap();
        assert_eq!(port.name, "COM3");
        assert!(ch.is_alive());
        assert!(!ch.is_open());
    }

    #[test]
    fn detect_reports_missing_device() {
        let connector = Arc::new(MockConnector::new());
        let ch = channel(&connector);
        assert!(matches!(
            ch.detect(),
            Err(DriverError::DeviceNotFound { .. })
        ));
        assert!(matches!(ch.open(), Err(DriverError::NotAlive(_))));
    }

    #[test]
    fn unplugged_port_kills_the_channel() {
        let connector = Arc::new(MockConnector::new());
        connector.add_port("COM3", "Arduino Uno (COM3)");
        let ch = channel(&connector);
        ch.detect().unwrap();

        connector.remove_port("COM3");
        assert!(matches!(ch.write(b"start\r", true), Err(DriverError::Connection(_))));
        assert!(!ch.is_alive());
        assert!(matches!(
            ch.detect(),
            Err(DriverError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn ambiguous_detection_leaves_channel_unbound() {
        let connector = Arc::new(MockConnector::new());
        connector.add_port("COM3", "Arduino Uno (COM3)");
        connector.add_port("COM7", "Arduino Uno (COM7)");
        let ch = channel(&connector);

        match ch.detect() {
            Err(DriverError::AmbiguousDevice { ports, .. }) => {
                assert_eq!(ports, vec!["COM3".to_string(), "COM7".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ch.is_alive());
        assert!(ch.port_info().is_none());

        let port = ch.bind(1).unwrap();
        assert_eq!(port.name, "COM7");
        assert!(ch.is_alive());
    }

    #[test]
    fn write_closes_unless_kept_open() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        ch.write(b"start\r", true).unwrap();
        assert!(ch.is_open());
        ch.write(b"stop\r", false).unwrap();
        assert!(!ch.is_open());
        assert_eq!(dev.written(), b"start\rstop\r".to_vec());
        assert_eq!(dev.open_count(), 1);
    }

    #[test]
    fn open_and_close_are_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        ch.open().unwrap();
        ch.open().unwrap();
        assert_eq!(dev.open_count(), 1);
        ch.close().unwrap();
        ch.close().unwrap();
        assert!(!ch.is_open());
    }

    #[test]
    fn io_failure_kills_channel_until_redetected() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        dev.fail_io(true);
        assert!(ch.write(b"x", true).is_err());
        assert!(!ch.is_alive());

        dev.fail_io(false);
        assert!(matches!(
            ch.write(b"x", true),
            Err(DriverError::NotAlive(_))
        ));
        assert!(matches!(
            ch.read(ReadMode::Single, false),
            Err(DriverError::NotAlive(_))
        ));

        ch.detect().unwrap();
        ch.write(b"y", false).unwrap();
        assert_eq!(dev.written(), b"y".to_vec());
    }

    #[test]
    fn line_read_stops_at_newline() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        dev.push_incoming(b"ok\nrest");
        assert_eq!(ch.read(ReadMode::Line, true).unwrap(), b"ok\n".to_vec());
        assert_eq!(ch.read(ReadMode::Line, true).unwrap(), b"rest".to_vec());
        assert_eq!(ch.read(ReadMode::Single, true).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn drain_collects_everything_waiting() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        dev.push_incoming(b"debug on\nelectrodes: 2\n");
        let data = ch
            .read(
                ReadMode::Drain {
                    wait: Duration::from_millis(20),
                    idle: Duration::from_millis(5),
                },
                false,
            )
            .unwrap();
        assert_eq!(data, b"debug on\nelectrodes: 2\n".to_vec());
    }

    #[test]
    fn drain_gives_up_after_wait_without_data() {
        let connector = Arc::new(MockConnector::new());
        connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector);
        ch.detect().unwrap();

        let started = Instant::now();
        let data = ch
            .read(
                ReadMode::Drain {
                    wait: Duration::from_millis(30),
                    idle: Duration::from_millis(5),
                },
                false,
            )
            .unwrap();
        assert!(data.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let connector = Arc::new(MockConnector::new());
        let dev = connector.add_port("COM3", "Arduino Uno");
        let ch = Arc::new(channel(&connector));
        ch.detect().unwrap();

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let ch = ch.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        ch.write(&[i; 8], true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let written = dev.written();
        assert_eq!(written.len(), 4 * 25 * 8);
        for chunk in written.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[test]
    fn lock_timeout_is_reported() {
        let connector = Arc::new(MockConnector::new());
        connector.add_port("COM3", "Arduino Uno");
        let ch = channel(&connector).with_lock_timeout(Duration::from_millis(10));
        ch.detect().unwrap();

        let _held = ch.state.lock();
        assert!(matches!(ch.open(), Err(DriverError::LockTimeout(_))));
    }
}
