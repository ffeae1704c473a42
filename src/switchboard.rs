//! Electrode-switching controller protocol.
//!
//! The switching PCB is an Arduino that accepts text commands terminated by
//! `\r`. An electrode-pair selection is sent as one `setelectrodes` command
//! whose payload is the hex encoding of a frame per pair:
//!
//! ```text
//! [switch index]* [pair id & 0x1F] [residence time, u32 BE, microseconds]
//! ```
//!
//! Switch indices come from two lookup tables: the chamber table maps a pair
//! id to its stimulation and recording pads, the switch table lists which pad
//! each switch connects. The device applies switches in order and
//! daisy-chains boards, so indices are always sent ascending.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, PortCandidate, ReadMode};
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Switches wired to the 1k calibration resistor
const RESISTOR_SWITCHES: [u8; 2] = [62, 63];

/// Switches wired to the calibration short
const SHORT_SWITCHES: [u8; 2] = [60, 61];

/// Only the low five bits of a pair id are transmitted
const PAIR_ID_MASK: u32 = 0x1F;

/// How long debug mode waits for the board's reply
const DEBUG_REPLY_WAIT: Duration = Duration::from_secs(1);

/// Silence that ends a debug reply
const DEBUG_REPLY_IDLE: Duration = Duration::from_millis(25);

// ============================================================================
// Pair Identity
// ============================================================================

/// Reserved calibration configurations on the switching PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CalibrationTag {
    Resistor,
    Short,
}

/// Identity of an electrode pair: a chamber index or a calibration tag.
///
/// Numeric ids order before calibration tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PairId {
    Numeric(u32),
    Calibration(CalibrationTag),
}

impl PairId {
    pub fn numeric(&self) -> Option<u32> {
        match self {
            PairId::Numeric(id) => Some(*id),
            PairId::Calibration(_) => None,
        }
    }

    /// Id byte carried in the frame.
    pub fn wire_id(&self) -> u8 {
        match self {
            PairId::Numeric(id) => (id & PAIR_ID_MASK) as u8,
            PairId::Calibration(_) => 0x00,
        }
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairId::Numeric(id) => write!(f, "{id}"),
            PairId::Calibration(CalibrationTag::Resistor) => f.write_str("resistor"),
            PairId::Calibration(CalibrationTag::Short) => f.write_str("short"),
        }
    }
}

impl FromStr for PairId {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "res" | "resistor" => Ok(PairId::Calibration(CalibrationTag::Resistor)),
            "short" => Ok(PairId::Calibration(CalibrationTag::Short)),
            other => other
                .parse::<u32>()
                .map(PairId::Numeric)
                .map_err(|_| DriverError::InvalidValue(format!("'{s}' is not an electrode pair id"))),
        }
    }
}

impl From<u32> for PairId {
    fn from(id: u32) -> Self {
        PairId::Numeric(id)
    }
}

/// A pair together with how long it stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectrodePair {
    pub id: PairId,
    pub interval_us: u32,
}

pub type DefinedPairs = BTreeMap<PairId, ElectrodePair>;

// ============================================================================
// Lookup Tables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChamberEntry {
    pub e_pair_id: u32,
    pub stim_pad_id: i32,
    pub rec_pad_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadType {
    Stim,
    Rec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchEntry {
    pub pad_id: i32,
    pub pad_type: PadType,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChipFile {
    Wrapped {
        #[serde(rename = "chamberToPad")]
        chamber_to_pad: Vec<ChamberEntry>,
    },
    Bare(Vec<ChamberEntry>),
}

fn read_table(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| DriverError::Config(format!("cannot read '{}': {e}", path.display())))
}

/// Chamber table: pair id to stimulation/recording pads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChamberMap {
    entries: Vec<ChamberEntry>,
}

impl ChamberMap {
    pub fn new(entries: Vec<ChamberEntry>) -> Self {
        Self { entries }
    }

    /// Parse either `{"chamberToPad": [...]}` or a bare list.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: ChipFile = serde_json::from_str(text)
            .map_err(|e| DriverError::Config(format!("invalid chamber table: {e}")))?;
        let entries = match file {
            ChipFile::Wrapped { chamber_to_pad } => chamber_to_pad,
            ChipFile::Bare(entries) => entries,
        };
        Ok(Self { entries })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&read_table(path.as_ref())?)
    }

    pub fn get(&self, id: u32) -> Option<&ChamberEntry> {
        self.entries.iter().find(|e| e.e_pair_id == id)
    }

    pub fn entries(&self) -> &[ChamberEntry] {
        &self.entries
    }
}

/// Switch table: the position in the list is the switch index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchMap {
    switches: Vec<SwitchEntry>,
}

impl SwitchMap {
    pub fn new(switches: Vec<SwitchEntry>) -> Self {
        Self { switches }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let switches = serde_json::from_str(text)
            .map_err(|e| DriverError::Config(format!("invalid switch table: {e}")))?;
        Ok(Self { switches })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&read_table(path.as_ref())?)
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    fn indices_of(&self, pad_id: i32, pad_type: PadType) -> impl Iterator<Item = usize> + '_ {
        self.switches
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.pad_id == pad_id && s.pad_type == pad_type)
            .map(|(i, _)| i)
    }
}

/// Both lookup tables; either may still be missing.
#[derive(Debug, Clone, Default)]
pub struct SwitchTables {
    pub chambers: Option<ChamberMap>,
    pub switches: Option<SwitchMap>,
}

impl SwitchTables {
    pub fn new(chambers: ChamberMap, switches: SwitchMap) -> Self {
        Self {
            chambers: Some(chambers),
            switches: Some(switches),
        }
    }

    /// Switch indices that connect `id`, ascending.
    pub fn resolve_switches(&self, id: &PairId) -> Result<Vec<u8>> {
        let n = match id {
            PairId::Calibration(CalibrationTag::Resistor) => return Ok(RESISTOR_SWITCHES.to_vec()),
            PairId::Calibration(CalibrationTag::Short) => return Ok(SHORT_SWITCHES.to_vec()),
            PairId::Numeric(n) => *n,
        };

        let chambers = self
            .chambers
            .as_ref()
            .ok_or_else(|| DriverError::Config("chamber table is not loaded".into()))?;
        let switches = self
            .switches
            .as_ref()
            .ok_or_else(|| DriverError::Config("switch table is not loaded".into()))?;
        let pads = chambers
            .get(n)
            .ok_or_else(|| DriverError::Config(format!("electrode pair {n} is not in the chamber table")))?;
        debug!("pair {n}: stim pad {}, rec pad {}", pads.stim_pad_id, pads.rec_pad_id);

        let mut indices = switches
            .indices_of(pads.stim_pad_id, PadType::Stim)
            .chain(switches.indices_of(pads.rec_pad_id, PadType::Rec))
            .map(|i| {
                u8::try_from(i).map_err(|_| DriverError::Config(format!("switch index {i} exceeds one byte")))
            })
            .collect::<Result<Vec<u8>>>()?;
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    /// Binary frame for one pair.
    pub fn encode_frame(&self, id: &PairId, residence_us: u32) -> Result<Vec<u8>> {
        let switches = self.resolve_switches(id)?;
        let mut frame = Vec::with_capacity(switches.len() + 5);
        frame.extend_from_slice(&switches);
        frame.push(id.wire_id());
        frame.extend_from_slice(&residence_us.to_be_bytes());
        debug!(
            "pair {id}: switches {:?} on boards {:?}, frame {}",
            switches.iter().map(|s| s % 8).collect::<Vec<_>>(),
            switches.iter().map(|s| s / 8).collect::<Vec<_>>(),
            to_hex(&frame)
        );
        Ok(frame)
    }

    /// The `debug` and `setelectrodes` commands (without terminators) for an ordered selection.
    pub fn build_commands(&self, pairs: &[ElectrodePair], debug_mode: bool) -> Result<Vec<String>> {
        if pairs.is_empty() {
            return Err(DriverError::Config("no electrode pairs selected".into()));
        }
        let mut payload = Vec::new();
        for pair in pairs {
            payload.extend(self.encode_frame(&pair.id, pair.interval_us)?);
        }
        Ok(vec![
            format!("debug {}", u8::from(debug_mode)),
            format!("setelectrodes {} {}", pairs.len(), to_hex(&payload)),
        ])
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// Selection
// ============================================================================

/// Which pairs a measurement switches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectionOptions {
    /// Odd ids.
    pub counting: bool,
    /// Even ids.
    pub viability: bool,
    /// One ascending merge instead of counting-then-viability; the
    /// `counting` and `viability` filters still apply.
    pub per_chamber: bool,
    pub debug: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            counting: true,
            viability: true,
            per_chamber: false,
            debug: false,
        }
    }
}

impl SelectionOptions {
    pub fn viability_only(&self) -> Self {
        Self {
            counting: false,
            viability: true,
            ..*self
        }
    }
}

/// Turns the defined pairs into the ordered list that gets sent.
pub trait SelectionStrategy: Send {
    fn select(&self, pairs: &DefinedPairs, options: &SelectionOptions) -> Vec<ElectrodePair>;
}

impl<F> SelectionStrategy for F
where
    F: Fn(&DefinedPairs, &SelectionOptions) -> Vec<ElectrodePair> + Send,
{
    fn select(&self, pairs: &DefinedPairs, options: &SelectionOptions) -> Vec<ElectrodePair> {
        self(pairs, options)
    }
}

/// Every defined pair, ascending by id.
#[derive(Debug, Default, Clone, Copy)]
pub struct AscendingById;

impl SelectionStrategy for AscendingById {
    fn select(&self, pairs: &DefinedPairs, _options: &SelectionOptions) -> Vec<ElectrodePair> {
        pairs.values().copied().collect()
    }
}

// ============================================================================
// Device
// ============================================================================

/// The switching controller: a channel, its lookup tables and the defined pairs.
pub struct Switchboard {
    channel: Arc<Channel>,
    tables: SwitchTables,
    defined: DefinedPairs,
    strategy: Box<dyn SelectionStrategy>,
    debug_mode: bool,
}

impl Switchboard {
    pub fn new(channel: Arc<Channel>, tables: SwitchTables) -> Self {
        Self {
            channel,
            tables,
            defined: DefinedPairs::new(),
            strategy: Box::new(AscendingById),
            debug_mode: false,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_strategy(&mut self, strategy: Box<dyn SelectionStrategy>) {
        self.strategy = strategy;
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn detect(&self) -> Result<PortCandidate> {
        self.channel.detect()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_alive()
    }

    pub fn tables(&self) -> &SwitchTables {
        &self.tables
    }

    pub fn set_tables(&mut self, tables: SwitchTables) {
        self.tables = tables;
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Define a pair, replacing the interval if it already exists.
    pub fn define_pair(&mut self, id: impl Into<PairId>, interval_us: u32) {
        let id = id.into();
        self.defined.insert(id, ElectrodePair { id, interval_us });
        debug!("selected electrode pair {id} with interval {interval_us} us");
    }

    pub fn undefine_all(&mut self) {
        self.defined.clear();
    }

    pub fn defined_pairs(&self) -> &DefinedPairs {
        &self.defined
    }

    pub fn select(&self, options: &SelectionOptions) -> Vec<ElectrodePair> {
        self.strategy.select(&self.defined, options)
    }

    /// Send one command; in debug mode the board's reply is read back and logged.
    pub fn send_message(&self, message: &str) -> Result<()> {
        let mut wire = String::with_capacity(message.len() + 1);
        wire.push_str(message);
        wire.push('\r');
        self.channel.write(wire.as_bytes(), true)?;

        if self.debug_mode {
            let reply = self.channel.read(
                ReadMode::Drain {
                    wait: DEBUG_REPLY_WAIT,
                    idle: DEBUG_REPLY_IDLE,
                },
                true,
            )?;
            debug!(
                "received from switchboard: {}",
                String::from_utf8_lossy(&reply).trim_end().replace('\n', ", ")
            );
        }
        Ok(())
    }

    /// Select, encode and upload the electrode schedule.
    pub fn setup(&mut self, options: &SelectionOptions) -> Result<()> {
        self.debug_mode = options.debug;

        let pairs = self.select(options);
        if pairs.is_empty() {
            return Err(DriverError::Config("selection produced no electrode pairs".into()));
        }
        let commands = self.tables.build_commands(&pairs, self.debug_mode)?;
        info!("uploading {} electrode pairs to switchboard", pairs.len());
        for command in &commands {
            self.send_message(command)?;
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.send_message("start")
    }

    pub fn stop(&self) -> Result<()> {
        self.send_message("stop")
    }
}

impl fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switchboard")
            .field("channel", &self.channel)
            .field("defined", &self.defined)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}
