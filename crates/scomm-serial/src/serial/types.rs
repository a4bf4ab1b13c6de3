//! Shared types for the serial terminal crate.
//!
//! Covers device configuration and session state, text encodings,
//! transcript entries, send-cycle settings, statistics, and the event
//! payloads pushed to the presentation layer.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::serial::error::TerminalError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Device Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Baud rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaudRate(pub u32);

impl BaudRate {
    /// Rates offered by the baud selector.
    pub const STANDARD: [u32; 13] = [
        300, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
    ];

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_standard(&self) -> bool {
        Self::STANDARD.contains(&self.0)
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self(115200)
    }
}

/// An RS-232 output control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlLine {
    /// Request To Send.
    Rts,
    /// Data Terminal Ready.
    Dtr,
}

impl ControlLine {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rts => "RTS",
            Self::Dtr => "DTR",
        }
    }
}

/// Output line state. `None` means "never touched": the driver default is
/// left alone on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLines {
    pub rts: Option<bool>,
    pub dtr: Option<bool>,
}

impl ControlLines {
    pub fn get(&self, line: ControlLine) -> Option<bool> {
        match line {
            ControlLine::Rts => self.rts,
            ControlLine::Dtr => self.dtr,
        }
    }

    pub fn set(&mut self, line: ControlLine, state: bool) {
        match line {
            ControlLine::Rts => self.rts = Some(state),
            ControlLine::Dtr => self.dtr = Some(state),
        }
    }
}

/// Parameters used to open the device. Framing is fixed at 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Port name (e.g. `COM3`, `/dev/ttyUSB0`).
    pub port_name: String,

    #[serde(default)]
    pub baud_rate: BaudRate,

    /// Upper bound for a single blocking read, in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Upper bound for a single write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Line states to apply right after opening.
    #[serde(default)]
    pub control_lines: ControlLines,
}

fn default_read_timeout() -> u64 {
    20
}
fn default_write_timeout() -> u64 {
    1000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BaudRate::default(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            control_lines: ControlLines::default(),
        }
    }
}

impl DeviceConfig {
    /// Shorthand notation (e.g. "115200-8N1").
    pub fn shorthand(&self) -> String {
        format!("{}-8N1", self.baud_rate.value())
    }
}

/// The open/closed connection and its parameters.
///
/// While open, the port name and baud rate are locked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub config: DeviceConfig,
    pub is_open: bool,
    pub opened_at: Option<DateTime<Local>>,
}

impl DeviceSession {
    pub fn set_port_name(&mut self, name: impl Into<String>) -> Result<(), TerminalError> {
        self.ensure_unlocked("port")?;
        self.config.port_name = name.into();
        Ok(())
    }

    pub fn set_baud_rate(&mut self, baud: BaudRate) -> Result<(), TerminalError> {
        self.ensure_unlocked("baud")?;
        self.config.baud_rate = baud;
        Ok(())
    }

    fn ensure_unlocked(&self, field: &'static str) -> Result<(), TerminalError> {
        if self.is_open {
            return Err(TerminalError::SessionLocked(field));
        }
        Ok(())
    }

    pub(crate) fn mark_open(&mut self) {
        self.is_open = true;
        self.opened_at = Some(Local::now());
    }

    pub(crate) fn mark_closed(&mut self) {
        self.is_open = false;
        self.opened_at = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Text Encodings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Character encoding used for text-mode send and receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}

/// Returned when an encoding name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown encoding: {0}")]
pub struct UnknownEncoding(pub String);

impl FromStr for TextEncoding {
    type Err = UnknownEncoding;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect();
        match normalized.as_str() {
            "utf8" => Ok(Self::Utf8),
            "ascii" | "usascii" => Ok(Self::Ascii),
            "latin1" | "iso88591" | "l1" => Ok(Self::Latin1),
            _ => Err(UnknownEncoding(name.to_string())),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
            Self::Latin1 => "latin-1",
        }
    }

    /// Decode bytes, dropping any sequence that is invalid in this encoding.
    pub fn decode_lossy(&self, data: &[u8]) -> String {
        match self {
            Self::Utf8 => decode_utf8_dropping_invalid(data),
            Self::Ascii => data
                .iter()
                .filter(|b| b.is_ascii())
                .map(|&b| b as char)
                .collect(),
            Self::Latin1 => data.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encode text, skipping characters this encoding cannot represent.
    /// Returns the bytes and the number of characters skipped.
    pub fn encode_lossy(&self, text: &str) -> (Vec<u8>, usize) {
        match self {
            Self::Utf8 => (text.as_bytes().to_vec(), 0),
            Self::Ascii => encode_single_byte(text, 0x7F),
            Self::Latin1 => encode_single_byte(text, 0xFF),
        }
    }
}

fn encode_single_byte(text: &str, max: u32) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(text.len());
    let mut skipped = 0;
    for ch in text.chars() {
        let code = ch as u32;
        if code <= max {
            out.push(code as u8);
        } else {
            skipped += 1;
        }
    }
    (out, skipped)
}

fn decode_utf8_dropping_invalid(mut data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    loop {
        match std::str::from_utf8(data) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, rest) = data.split_at(e.valid_up_to());
                // `valid_up_to` guarantees this prefix is well formed.
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(bad) => data = &rest[bad..],
                    // Truncated sequence at the end of the buffer.
                    None => return out,
                }
            }
        }
    }
}

/// How received and sent bytes are rendered in the transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderMode {
    /// Two uppercase hex digits per byte, space separated.
    Hex,
    /// Decoded with the configured text encoding.
    #[default]
    Text,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transcript
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Direction of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Sent,
    Received,
}

impl Category {
    /// Decoration tag the presentation layer maps to a colour.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent => "TX",
            Self::Received => "RX",
        }
    }
}

/// A single line of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    /// Monotonic position marker, unique per terminal.
    pub id: u64,
    pub timestamp: DateTime<Local>,
    pub category: Category,
    /// Hex or decoded text of the entry's bytes.
    pub text: String,
    /// Concatenated decode-rule output (received entries only).
    #[serde(default)]
    pub annotation: String,
}

impl TranscriptEntry {
    pub fn tag(&self) -> &'static str {
        self.category.tag()
    }

    /// Rendered text with the annotation appended.
    pub fn display_text(&self) -> String {
        format!("{}{}", self.text, self.annotation)
    }

    /// `[HH:MM:SS.mmm] RX: text annotation`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.category.label(),
            self.display_text()
        )
    }
}

/// Change to apply to the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op", content = "entry")]
pub enum TranscriptUpdate {
    /// A new entry at the end of the transcript.
    Append(TranscriptEntry),
    /// New content for the existing entry with the same `id`.
    ReplaceTail(TranscriptEntry),
}

impl TranscriptUpdate {
    pub fn entry(&self) -> &TranscriptEntry {
        match self {
            Self::Append(e) | Self::ReplaceTail(e) => e,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Send Cycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Smallest interval the periodic sender will honour.
pub const MIN_CYCLE_INTERVAL_MS: u64 = 10;

/// Periodic repetition of the cached outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCycle {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for SendCycle {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1000,
        }
    }
}

impl SendCycle {
    pub fn every(interval_ms: u64) -> Self {
        Self {
            enabled: true,
            interval_ms,
        }
    }

    pub fn effective_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms.max(MIN_CYCLE_INTERVAL_MS))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters for the current terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub chunks_rx: u64,
    pub payloads_tx: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub build_errors: u64,
    pub decode_failures: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Information
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Information about a discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortInfo {
    /// System port name (e.g. `COM3`, `/dev/ttyUSB0`).
    pub port_name: String,
    pub port_type: PortType,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    /// Friendly name for the port selector.
    pub display_name: String,
}

/// Type of serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    UsbSerial,
    Native,
    Pci,
    Bluetooth,
    Virtual,
    Unknown,
}

impl PortType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UsbSerial => "USB-Serial",
            Self::Native => "Native",
            Self::Pci => "PCI",
            Self::Bluetooth => "Bluetooth",
            Self::Virtual => "Virtual",
            Self::Unknown => "Unknown",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Events (core → presentation)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// One-line status for the status bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub text: String,
}

impl StatusMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Info,
            text: text.into(),
        }
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Warn,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Error,
            text: text.into(),
        }
    }
}

/// Messages queued by worker tasks for the presentation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalEvent {
    Transcript(TranscriptUpdate),
    Status(StatusMessage),
    Opened { port_name: String, shorthand: String },
    Closed { reason: String },
    PortsDiscovered(Vec<SerialPortInfo>),
}
