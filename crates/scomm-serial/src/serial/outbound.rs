//! Outbound payload construction and caching.
//!
//! A payload is built from the current input (text or hex digits, encoding,
//! CR/LF flags) and cached. Cached sends reuse the last build; fresh sends
//! rebuild first and may carry one-shot control-line overrides.

use crate::serial::error::BuildError;
use crate::serial::types::{ControlLines, TextEncoding};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Build payload bytes from raw user input.
///
/// In hex mode whitespace is ignored and the remaining characters must be
/// an even number of hex digits. In text mode characters the encoding
/// cannot represent are skipped. `\r` then `\n` are appended per the flags.
pub fn build_payload(
    raw: &str,
    encoding_name: &str,
    hex_mode: bool,
    append_cr: bool,
    append_lf: bool,
) -> Result<Vec<u8>, BuildError> {
    let encoding: TextEncoding = encoding_name.parse()?;
    PayloadSource {
        text: raw.to_string(),
        hex: hex_mode,
        encoding,
        append_cr,
        append_lf,
    }
    .build()
}

fn parse_hex(raw: &str) -> Result<Vec<u8>, BuildError> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).map_err(|e| BuildError::MalformedHex(format!("{:?}: {}", raw, e)))
}

/// The user input a payload is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSource {
    pub text: String,
    pub hex: bool,
    pub encoding: TextEncoding,
    pub append_cr: bool,
    pub append_lf: bool,
}

impl PayloadSource {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn hex(digits: impl Into<String>) -> Self {
        Self {
            text: digits.into(),
            hex: true,
            ..Default::default()
        }
    }

    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut bytes = if self.hex {
            parse_hex(&self.text)?
        } else {
            let (bytes, skipped) = self.encoding.encode_lossy(&self.text);
            if skipped > 0 {
                log::debug!(
                    "Skipped {} character(s) not representable in {}",
                    skipped,
                    self.encoding
                );
            }
            bytes
        };
        if self.append_cr {
            bytes.push(b'\r');
        }
        if self.append_lf {
            bytes.push(b'\n');
        }
        Ok(bytes)
    }
}

/// Bytes ready for the transport plus the control lines to set first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundPayload {
    pub bytes: Vec<u8>,
    pub overrides: ControlLines,
}

#[derive(Debug, Default)]
struct QueueState {
    source: PayloadSource,
    cached: Option<Vec<u8>>,
    pending_overrides: ControlLines,
}

/// Holds the next payload to transmit.
///
/// Shared by the interactive sender and the periodic sender; callers
/// serialise "prepare then take then write" with their own send lock.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn source(&self) -> PayloadSource {
        self.with_state(|s| s.source.clone())
    }

    /// Replace the input. The cache is kept until the next rebuild.
    pub fn set_source(&self, source: PayloadSource) {
        self.with_state(|s| s.source = source);
    }

    /// Edit the input in place (e.g. toggle hex mode).
    pub fn update_source(&self, f: impl FnOnce(&mut PayloadSource)) {
        self.with_state(|s| f(&mut s.source));
    }

    /// Build from the current input and cache the result. A failed build
    /// clears the cache so nothing stale goes out.
    pub fn rebuild(&self) -> Result<usize, BuildError> {
        self.with_state(|s| match s.source.build() {
            Ok(bytes) => {
                let len = bytes.len();
                s.cached = Some(bytes);
                Ok(len)
            }
            Err(e) => {
                s.cached = None;
                Err(e)
            }
        })
    }

    /// Replace the input, rebuild, and arm one-shot line overrides for the
    /// next [`take`](Self::take).
    pub fn prepare_fresh(
        &self,
        source: PayloadSource,
        overrides: ControlLines,
    ) -> Result<usize, BuildError> {
        self.with_state(|s| {
            s.source = source;
            s.pending_overrides = ControlLines::default();
            match s.source.build() {
                Ok(bytes) => {
                    let len = bytes.len();
                    s.cached = Some(bytes);
                    s.pending_overrides = overrides;
                    Ok(len)
                }
                Err(e) => {
                    s.cached = None;
                    Err(e)
                }
            }
        })
    }

    /// The cached payload (built now if nothing is cached) together with
    /// any pending overrides, which are cleared.
    pub fn take(&self) -> Result<OutboundPayload, BuildError> {
        self.with_state(|s| {
            let bytes = match &s.cached {
                Some(bytes) => bytes.clone(),
                None => {
                    let bytes = s.source.build()?;
                    s.cached = Some(bytes.clone());
                    bytes
                }
            };
            Ok(OutboundPayload {
                bytes,
                overrides: std::mem::take(&mut s.pending_overrides),
            })
        })
    }

    #[cfg(test)]
    fn cached_len(&self) -> Option<usize> {
        self.with_state(|s| s.cached.as_ref().map(Vec::len))
    }
}
