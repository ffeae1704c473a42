//! In-memory stand-ins for the rig hardware.
//!
//! `MockConnector` hands out `MockLink`s over shared byte queues so tests can
//! inject incoming bytes and inspect what was written. `MockSessionProvider`
//! plays the vendor acquisition session: it replays queued batches or
//! generates synthetic demodulator samples, which is also what
//! `paralyzer run --simulate-lockin` uses.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Connector, Link, PortCandidate, SerialSettings};
use crate::errors::{DriverError, Result};
use crate::lockin::{AcquisitionSession, DemodSamples, PollBatch, SessionInfo, SessionProvider};

// ============================================================================
// Serial Devices
// ============================================================================

#[derive(Default)]
struct DeviceState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    fail: bool,
    opens: usize,
}

/// Test handle to one fake serial device.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// Queue bytes the device "sends" to the host.
    pub fn push_incoming(&self, data: &[u8]) {
        self.state.lock().incoming.extend(data.iter().copied());
    }

    /// Everything the host wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Make every subsequent open/read/write fail like an unplugged device.
    pub fn fail_io(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn pending_incoming(&self) -> usize {
        self.state.lock().incoming.len()
    }
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

/// Link over a [`MockDevice`]'s queues; an empty queue reads as a timeout.
pub struct MockLink {
    device: MockDevice,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.state.lock();
        if state.fail {
            return Err(unplugged());
        }
        if state.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.state.lock();
        if state.fail {
            return Err(unplugged());
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for MockLink {
    fn bytes_to_read(&self) -> io::Result<usize> {
        let state = self.device.state.lock();
        if state.fail {
            return Err(unplugged());
        }
        Ok(state.incoming.len())
    }
}

/// Connector that enumerates a fixed, test-controlled set of fake ports.
#[derive(Default)]
pub struct MockConnector {
    ports: Mutex<Vec<(PortCandidate, MockDevice)>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a fake device and return its handle.
    pub fn add_port(&self, name: &str, description: &str) -> MockDevice {
        let device = MockDevice::default();
        self.ports.lock().push((
            PortCandidate {
                name: name.to_string(),
                description: description.to_string(),
            },
            device.clone(),
        ));
        device
    }

    pub fn remove_port(&self, name: &str) {
        self.ports.lock().retain(|(p, _)| p.name != name);
    }
}

impl Connector for MockConnector {
    fn enumerate(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.ports.lock().iter().map(|(p, _)| p.clone()).collect())
    }

    fn open(&self, port: &PortCandidate, _settings: &SerialSettings) -> Result<Box<dyn Link>> {
        let device = self
            .ports
            .lock()
            .iter()
            .find(|(p, _)| p.name == port.name)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| DriverError::Connection(format!("port '{}' vanished", port.name)))?;
        {
            let mut state = device.state.lock();
            if state.fail {
                return Err(unplugged().into());
            }
            state.opens += 1;
        }
        Ok(Box::new(MockLink { device }))
    }
}

// ============================================================================
// Acquisition Session
// ============================================================================

#[derive(Default)]
struct SessionState {
    queued: VecDeque<PollBatch>,
    generator: Option<(usize, usize)>,
    ticks: u64,
    polls: usize,
    fail_polls: bool,
    log: Vec<String>,
}

impl SessionState {
    fn synthesize(&mut self, channels: usize, per_poll: usize) -> PollBatch {
        let mut batch = PollBatch::new();
        for ch in 0..channels {
            let mut samples = DemodSamples::default();
            for i in 0..per_poll {
                let t = self.ticks + i as u64;
                let phase = t as f64 * 1e-3;
                samples.x.push(phase.sin() * 1e-6);
                samples.y.push(phase.cos() * 1e-6);
                samples.timestamp.push(t);
                samples.frequency.push(500_000.0);
                samples.dio.push(ch as u32);
            }
            batch.insert(ch.to_string(), samples);
        }
        self.ticks += per_poll as u64;
        batch
    }
}

/// Test handle shared by a [`MockSessionProvider`] and every session it opens.
#[derive(Clone, Default)]
pub struct MockSessionHandle {
    state: Arc<Mutex<SessionState>>,
}

impl MockSessionHandle {
    /// Batch returned by the next poll call.
    pub fn queue(&self, batch: PollBatch) {
        self.state.lock().queued.push_back(batch);
    }

    /// Make every poll call fail, as if the device dropped off the bus.
    pub fn fail_polls(&self, fail: bool) {
        self.state.lock().fail_polls = fail;
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().polls
    }

    /// Calls seen so far, e.g. `subscribe:/dev10/demods/*/sample`, `sync`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

/// One fake vendor session.
pub struct MockSession {
    state: Arc<Mutex<SessionState>>,
}

impl AcquisitionSession for MockSession {
    fn subscribe(&mut self, path: &str) -> Result<()> {
        self.state.lock().log.push(format!("subscribe:{path}"));
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.state.lock().log.push("sync".to_string());
        Ok(())
    }

    fn poll(&mut self, block: Duration, _timeout_ms: u32, _flags: u32, _flat: bool) -> Result<PollBatch> {
        thread::sleep(block);
        let mut state = self.state.lock();
        state.polls += 1;
        if state.fail_polls {
            return Err(DriverError::Session("poll failed: device disconnected".into()));
        }
        if let Some(batch) = state.queued.pop_front() {
            return Ok(batch);
        }
        match state.generator {
            Some((channels, per_poll)) => Ok(state.synthesize(channels, per_poll)),
            None => Ok(PollBatch::new()),
        }
    }

    fn unsubscribe(&mut self, path: &str) -> Result<()> {
        self.state.lock().log.push(format!("unsubscribe:{path}"));
        Ok(())
    }
}

/// Session provider answering for a fixed set of device ids.
pub struct MockSessionProvider {
    devices: Vec<String>,
    handle: MockSessionHandle,
}

impl MockSessionProvider {
    pub fn new(devices: &[&str]) -> Self {
        Self {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            handle: MockSessionHandle::default(),
        }
    }

    /// Emit `per_poll` synthetic samples on each of `channels` demodulators
    /// whenever no scripted batch is queued.
    pub fn with_generator(self, channels: usize, per_poll: usize) -> Self {
        self.handle.state.lock().generator = Some((channels, per_poll));
        self
    }

    pub fn handle(&self) -> MockSessionHandle {
        self.handle.clone()
    }
}

impl SessionProvider for MockSessionProvider {
    fn connect(&self, device_id: &str) -> Result<(Box<dyn AcquisitionSession>, SessionInfo)> {
        if !self.devices.iter().any(|d| d == device_id) {
            return Err(DriverError::Connection(format!(
                "device '{device_id}' not reachable"
            )));
        }
        self.handle.state.lock().log.push(format!("connect:{device_id}"));
        Ok((
            Box::new(MockSession {
                state: self.handle.state.clone(),
            }),
            SessionInfo {
                device_id: device_id.to_string(),
                server: "mock".to_string(),
            },
        ))
    }
}

/// Batch with `per_channel` samples for each named channel.
pub fn batch(channels: &[&str], per_channel: usize) -> PollBatch {
    let mut batch = PollBatch::new();
    for name in channels {
        let mut samples = DemodSamples::default();
        for i in 0..per_channel {
            samples.x.push(i as f64);
            samples.y.push(-(i as f64));
            samples.timestamp.push(i as u64);
            samples.frequency.push(1000.0);
            samples.dio.push(0);
        }
        batch.insert(name.to_string(), samples);
    }
    batch
}
