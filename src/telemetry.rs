//! Tilter telemetry: message framing, field parsing and the position state machine.
//!
//! The tilter reports its status about every two seconds as
//! `ID1;A+65;A-65;M+10;M-10;m4;P+0;P-0;p0;H0;T0;t0;S1#`. A serial read can
//! end anywhere inside a message, so text is buffered until a `#` arrives.

use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::events::TilterEvent;

// ============================================================================
// Fields
// ============================================================================

/// One telemetry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryField {
    Id,
    PosAngle,
    NegAngle,
    PosMotion,
    NegMotion,
    MotionLeft,
    PosPause,
    NegPause,
    PauseLeft,
    HorPause,
    TotalTime,
    TimeLeft,
    Status,
}

impl TelemetryField {
    pub const ALL: [TelemetryField; 13] = [
        TelemetryField::Id,
        TelemetryField::PosAngle,
        TelemetryField::NegAngle,
        TelemetryField::PosMotion,
        TelemetryField::NegMotion,
        TelemetryField::MotionLeft,
        TelemetryField::PosPause,
        TelemetryField::NegPause,
        TelemetryField::PauseLeft,
        TelemetryField::HorPause,
        TelemetryField::TotalTime,
        TelemetryField::TimeLeft,
        TelemetryField::Status,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            TelemetryField::Id => "ID",
            TelemetryField::PosAngle => "A+",
            TelemetryField::NegAngle => "A-",
            TelemetryField::PosMotion => "M+",
            TelemetryField::NegMotion => "M-",
            TelemetryField::MotionLeft => "m",
            TelemetryField::PosPause => "P+",
            TelemetryField::NegPause => "P-",
            TelemetryField::PauseLeft => "p",
            TelemetryField::HorPause => "H",
            TelemetryField::TotalTime => "T",
            TelemetryField::TimeLeft => "t",
            TelemetryField::Status => "S",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Field whose key is the longest prefix of `text`.
    fn match_prefix(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter(|f| text.starts_with(f.key()))
            .max_by_key(|f| f.key().len())
    }
}

/// Latest reported value of every field; `None` until first reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySample {
    values: [Option<i64>; 13],
}

impl TelemetrySample {
    pub fn get(&self, field: TelemetryField) -> Option<i64> {
        self.values[field.index()]
    }

    pub fn set(&mut self, field: TelemetryField, value: i64) {
        self.values[field.index()] = Some(value);
    }

    /// Update from one complete message; returns how many fields were taken.
    ///
    /// Malformed fields are logged and skipped.
    pub fn apply_message(&mut self, message: &str) -> usize {
        let mut updated = 0;
        for part in message.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            match parse_field(part) {
                Ok((field, value)) => {
                    self.set(field, value);
                    updated += 1;
                }
                Err(e) => warn!("{e}"),
            }
        }
        updated
    }

    /// `(key, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (TelemetryField, Option<i64>)> + '_ {
        TelemetryField::ALL.into_iter().map(|f| (f, self.get(f)))
    }
}

/// Parse one `KEY<value>` field of a telemetry message.
pub fn parse_field(part: &str) -> Result<(TelemetryField, i64)> {
    let field = TelemetryField::match_prefix(part)
        .ok_or_else(|| DriverError::Protocol(format!("unknown telemetry field '{part}'")))?;
    let value = part[field.key().len()..]
        .trim()
        .parse::<i64>()
        .map_err(|_| DriverError::Protocol(format!("could not extract number from '{part}'")))?;
    Ok((field, value))
}

// ============================================================================
// Framing
// ============================================================================

/// Splits a byte stream of text into `#`-terminated messages.
#[derive(Debug, Clone, Default)]
pub struct TelemetryDecoder {
    pending: String,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `text` and return every message it completed.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        if !self.pending.contains('#') {
            return Vec::new();
        }
        let mut parts: Vec<String> = self.pending.split('#').map(str::to_string).collect();
        self.pending = parts.pop().unwrap_or_default();
        parts.retain(|m| !m.trim().is_empty());
        parts
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// Position State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    PosDown,
    PosUp,
    NegDown,
    NegUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPhase {
    #[default]
    None,
    PosWait,
    NegWait,
}

/// Moving and waiting exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Idle,
    Moving,
    Waiting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TilterState {
    pub motion: Option<MotionPhase>,
    pub wait: WaitPhase,
    pub activity: Activity,
    pub move_time_last: i64,
    pub cycle_count: u32,
}

impl TilterState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance on one decoded message and return the events it triggered, in order.
    pub fn advance(&mut self, sample: &TelemetrySample) -> Vec<TilterEvent> {
        let mut events = Vec::new();
        let pause_left = sample.get(TelemetryField::PauseLeft).unwrap_or(-1);
        let motion_left = sample.get(TelemetryField::MotionLeft).unwrap_or(-1);

        if pause_left > 0 && self.activity != Activity::Waiting {
            if self.wait == WaitPhase::PosWait {
                self.wait = WaitPhase::NegWait;
                events.push(TilterEvent::OnNegWait);
            } else {
                self.wait = WaitPhase::PosWait;
                events.push(TilterEvent::OnPosWait);
            }
            self.activity = Activity::Waiting;
        }

        if motion_left > 0 {
            if self.activity != Activity::Moving {
                match self.motion {
                    None => {
                        self.motion = Some(MotionPhase::PosDown);
                        events.push(TilterEvent::OnPosDown);
                    }
                    Some(MotionPhase::PosDown) => {
                        self.motion = Some(MotionPhase::PosUp);
                        events.push(TilterEvent::OnPosUp);
                    }
                    Some(MotionPhase::NegDown) => {
                        self.motion = Some(MotionPhase::NegUp);
                        events.push(TilterEvent::OnNegUp);
                    }
                    Some(MotionPhase::PosUp) | Some(MotionPhase::NegUp) => {}
                }
                self.activity = Activity::Moving;
            } else if motion_left > self.move_time_last {
                // a new swing started without a pause in between
                match self.motion {
                    Some(MotionPhase::PosUp) => {
                        self.motion = Some(MotionPhase::NegDown);
                        events.push(TilterEvent::OnNegDown);
                    }
                    Some(MotionPhase::NegUp) => {
                        self.motion = Some(MotionPhase::PosDown);
                        self.cycle_count += 1;
                        events.push(TilterEvent::OnPosDown);
                    }
                    _ => {}
                }
            }
        }

        self.move_time_last = motion_left;
        if !events.is_empty() {
            debug!("tilter state {:?}/{:?}: {:?}", self.motion, self.wait, events);
        }
        events
    }
}
