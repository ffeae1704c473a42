use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no port matches '{descriptor}'")]
    DeviceNotFound { descriptor: String },
    #[error("multiple ports match '{descriptor}': {ports:?}")]
    AmbiguousDevice {
        descriptor: String,
        ports: Vec<String>,
    },
    /// The channel hit an unrecoverable I/O error (or was never detected).
    #[error("channel '{0}' is not alive, detect the device again")]
    NotAlive(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("timed out waiting for exclusive access to '{0}'")]
    LockTimeout(String),
    #[error("acquisition session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// The three instruments of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    Switching,
    Tilter,
    Lockin,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Switching, DeviceKind::Tilter, DeviceKind::Lockin];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Switching => "switchboard",
            DeviceKind::Tilter => "tilter",
            DeviceKind::Lockin => "lock-in",
        })
    }
}

/// A rig-level operation failed on one particular device.
#[derive(Debug, Error)]
#[error("{device} failed: {source}")]
pub struct DeviceFailure {
    pub device: DeviceKind,
    #[source]
    pub source: DriverError,
}

impl DeviceFailure {
    pub fn new(device: DeviceKind, source: DriverError) -> Self {
        Self { device, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_device_lists_ports() {
        let err = DriverError::AmbiguousDevice {
            descriptor: "Arduino Uno".into(),
            ports: vec!["COM3".into(), "COM4".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Arduino Uno"));
        assert!(msg.contains("COM4"));
    }

    #[test]
    fn device_failure_names_the_device() {
        let failure = DeviceFailure::new(DeviceKind::Lockin, DriverError::NotAlive("lock-in".into()));
        assert!(failure.to_string().starts_with("lock-in failed"));
        assert_eq!(failure.device, DeviceKind::Lockin);
    }

    #[test]
    fn io_errors_convert() {
        let err: DriverError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, DriverError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
