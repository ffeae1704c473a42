//! Device core for the ParaLyzer assay rig.
//!
//! Three instruments take part in a measurement:
//!
//! - the electrode-switching PCB ([`Switchboard`]), an Arduino on a serial port
//! - the chip tilter ([`ChipTilter`]), which reports its position as telemetry
//!   and raises [`TilterEvent`]s while it swings
//! - the lock-in amplifier ([`LockIn`]), whose demodulator samples are polled
//!   on a worker thread and written to rotating stream files
//!
//! The [`Orchestrator`] starts and stops all of them together, optionally
//! synchronised to the tilter's motion.
//!
//! # Device discovery
//!
//! Serial devices are found by enumerating ports and matching a descriptor
//! substring against the port description. A [`Channel`] serialises access to
//! its port and is marked dead after any I/O failure until it is detected
//! again.

pub mod channel;
pub mod config;
pub mod errors;
pub mod events;
pub mod lockin;
pub mod logging;
pub mod mock;
pub mod orchestrator;
pub mod switchboard;
pub mod telemetry;
pub mod tilter;

pub use channel::{Channel, Connector, PortCandidate, ReadMode, SerialConnector, SerialSettings};
pub use config::RigConfig;
pub use errors::*;
pub use events::{EventCallback, HandlerId, TilterEvent};
pub use lockin::{AcquisitionSession, LockIn, LockinSettings, RecordStatus, SessionProvider};
pub use orchestrator::{CountingViabilityStrategy, MeasurementFlags, Orchestrator, RigState};
pub use switchboard::{
    CalibrationTag, ElectrodePair, PairId, SelectionOptions, SelectionStrategy, SwitchTables,
    Switchboard,
};
pub use telemetry::{TelemetryField, TelemetrySample, TilterState};
pub use tilter::{ChipTilter, MotionParam, MotionSetup, TilterSettings, WriteMode};
