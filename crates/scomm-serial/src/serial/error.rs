//! Error types for the serial terminal core.
//!
//! Each operation family has its own enum so callers can match on the
//! failures that operation can actually produce. [`TerminalError`] wraps
//! them for the public façade.

use thiserror::Error;

use crate::serial::types::UnknownEncoding;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("device {0} is busy")]
    DeviceBusy(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("device {0} is already open")]
    AlreadyOpen(String),
    #[error("failed to open device: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum CloseError {
    #[error("failed to close device: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("device not open")]
    NotOpen,
    #[error("read failed: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("device not open")]
    NotOpen,
    #[error("write timed out after {written} bytes")]
    WriteTimeout { written: usize },
    #[error("write failed: {0}")]
    DeviceError(String),
}

#[derive(Error, Debug)]
pub enum LineError {
    #[error("device not open")]
    NotOpen,
    #[error("failed to set {line}: {reason}")]
    Device { line: &'static str, reason: String },
}

/// Failure to turn user input into payload bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("malformed hex input: {0}")]
    MalformedHex(String),
    #[error(transparent)]
    Encoding(#[from] UnknownEncoding),
}

/// Failure to parse or evaluate a decode expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at {pos}: {msg}")]
    Syntax { pos: usize, msg: String },
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("{name}() expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("index {index} out of range for buffer of {len} bytes")]
    Index { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression nested too deeply")]
    TooDeep,
}

/// A decode rule that failed to compile or evaluate.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("decode rule `{rule}`: {source}")]
pub struct DecodeRuleError {
    pub rule: String,
    #[source]
    pub source: ExprError,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors surfaced by the [`Terminal`](crate::serial::Terminal) façade.
#[derive(Error, Debug)]
pub enum TerminalError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Close(#[from] CloseError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Line(#[from] LineError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Decode(#[from] DecodeRuleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot change {0} while the device is open")]
    SessionLocked(&'static str),
    #[error("device not open")]
    NotOpen,
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            OpenError::DeviceNotFound("COM9".into()).to_string(),
            "device COM9 not found"
        );
        assert_eq!(
            WriteError::WriteTimeout { written: 3 }.to_string(),
            "write timed out after 3 bytes"
        );
        assert_eq!(
            TerminalError::SessionLocked("baud").to_string(),
            "cannot change baud while the device is open"
        );
    }

    #[test]
    fn test_terminal_error_wraps_transparently() {
        let err: TerminalError = BuildError::MalformedHex("4".into()).into();
        assert_eq!(err.to_string(), "malformed hex input: 4");
        let err: TerminalError = BuildError::from(UnknownEncoding("koi8".into())).into();
        assert_eq!(err.to_string(), "unknown encoding: koi8");
    }

    #[test]
    fn test_decode_rule_error_names_rule() {
        let err = DecodeRuleError {
            rule: "temp".into(),
            source: ExprError::DivisionByZero,
        };
        assert_eq!(err.to_string(), "decode rule `temp`: division by zero");
    }
}
