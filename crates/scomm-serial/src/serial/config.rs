//! Application configuration store.
//!
//! The file is a flat JSON object: scalar settings (`baud`, `split`,
//! `cycle`, `encoding`, `uservar`), presets under `btn-dataNN` and decode
//! scripts under `btn-unpackNN`. Unknown keys are kept as-is. The file is
//! loaded once and rewritten wholesale on every change.

use crate::serial::decode::DecodeRule;
use crate::serial::error::ConfigError;
use crate::serial::types::{BaudRate, SendCycle, TextEncoding};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PRESET_PREFIX: &str = "btn-data";
pub const DECODER_PREFIX: &str = "btn-unpack";

const DEFAULT_SPLIT_MS: u64 = 20;
const DEFAULT_CYCLE_MS: u64 = 1000;

/// Parse `"20ms"` or `"20"` into milliseconds.
pub fn parse_millis(text: &str) -> Option<u64> {
    let t = text.trim();
    let digits = t.strip_suffix("ms").unwrap_or(t).trim();
    digits.parse().ok()
}

pub fn format_millis(ms: u64) -> String {
    format!("{}ms", ms)
}

fn flag_from_json<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    match Value::deserialize(d)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => Ok(matches!(s.trim(), "1" | "true")),
        _ => Ok(false),
    }
}

fn flag_to_json<S: Serializer>(flag: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(u8::from(*flag))
}

/// A one-click payload (`btn-dataNN`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub value: String,
    /// Stored as `0` / `1`.
    #[serde(
        default,
        deserialize_with = "flag_from_json",
        serialize_with = "flag_to_json"
    )]
    pub hex: bool,
}

/// A stored decode rule (`btn-unpackNN`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeScript {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Typed view of the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub baud: BaudRate,
    pub split_ms: u64,
    pub cycle_ms: u64,
    pub encoding: TextEncoding,
    pub uservar: String,
    pub presets: BTreeMap<String, Preset>,
    pub decoders: BTreeMap<String, DecodeScript>,
    /// Keys this program does not interpret.
    pub extra: Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            baud: BaudRate::default(),
            split_ms: DEFAULT_SPLIT_MS,
            cycle_ms: DEFAULT_CYCLE_MS,
            encoding: TextEncoding::Utf8,
            uservar: String::new(),
            presets: BTreeMap::new(),
            decoders: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

fn invalid(key: &str, value: &Value) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn millis_value(key: &str, value: &Value) -> Result<u64, ConfigError> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(key, value)),
        Value::String(s) => parse_millis(s).ok_or_else(|| invalid(key, value)),
        _ => Err(invalid(key, value)),
    }
}

impl AppConfig {
    /// Interpret a parsed JSON object.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, ConfigError> {
        let mut cfg = AppConfig::default();
        for (key, value) in map {
            match key.as_str() {
                "baud" => {
                    let baud = match &value {
                        Value::Number(n) => n.as_u64(),
                        Value::String(s) => s.trim().parse().ok(),
                        _ => None,
                    };
                    let baud = baud
                        .and_then(|b| u32::try_from(b).ok())
                        .filter(|b| *b > 0)
                        .ok_or_else(|| invalid(&key, &value))?;
                    cfg.baud = BaudRate(baud);
                }
                "split" => cfg.split_ms = millis_value(&key, &value)?,
                "cycle" => cfg.cycle_ms = millis_value(&key, &value)?,
                "encoding" => {
                    cfg.encoding = value
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| invalid(&key, &value))?;
                }
                "uservar" => {
                    cfg.uservar = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                }
                k if k.starts_with(PRESET_PREFIX) => {
                    let preset: Preset = serde_json::from_value(value)?;
                    cfg.presets.insert(key, preset);
                }
                k if k.starts_with(DECODER_PREFIX) => {
                    let script: DecodeScript = serde_json::from_value(value)?;
                    cfg.decoders.insert(key, script);
                }
                _ => {
                    cfg.extra.insert(key, value);
                }
            }
        }
        Ok(cfg)
    }

    /// The flat JSON object written to disk.
    pub fn to_map(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut map = self.extra.clone();
        map.insert("baud".into(), Value::from(self.baud.value()));
        map.insert("split".into(), Value::from(format_millis(self.split_ms)));
        map.insert("cycle".into(), Value::from(format_millis(self.cycle_ms)));
        map.insert("encoding".into(), Value::from(self.encoding.name()));
        map.insert("uservar".into(), Value::from(self.uservar.clone()));
        for (name, preset) in &self.presets {
            map.insert(name.clone(), serde_json::to_value(preset)?);
        }
        for (name, script) in &self.decoders {
            map.insert(name.clone(), serde_json::to_value(script)?);
        }
        Ok(map)
    }

    pub fn gap_window(&self) -> Duration {
        Duration::from_millis(self.split_ms)
    }

    /// Send-cycle settings (disabled until the user turns it on).
    pub fn send_cycle(&self) -> SendCycle {
        SendCycle {
            enabled: false,
            interval_ms: self.cycle_ms,
        }
    }

    /// Decode scripts as rules keyed by their button name.
    pub fn decode_rules(&self) -> BTreeMap<String, DecodeRule> {
        self.decoders
            .iter()
            .map(|(name, script)| {
                (
                    name.clone(),
                    DecodeRule {
                        name: name.clone(),
                        title: script.title.clone(),
                        expression: script.value.clone(),
                        enabled: script.enabled,
                    },
                )
            })
            .collect()
    }
}

/// The configuration file and its typed contents.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let map: Map<String, Value> = serde_json::from_str(&text)?;
            let config = AppConfig::from_map(map)?;
            log::info!(
                "Loaded config from {} ({} presets, {} decoders)",
                path.display(),
                config.presets.len(),
                config.decoders.len()
            );
            config
        } else {
            log::info!("No config at {}; using defaults", path.display());
            AppConfig::default()
        };
        Ok(Self { path, config })
    }

    pub fn in_memory(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Rewrite the whole file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let map = self.config.to_map()?;
        let text = serde_json::to_string_pretty(&Value::Object(map))?;
        std::fs::write(&self.path, text)?;
        log::debug!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// Apply `f` and persist the result.
    pub fn update(&mut self, f: impl FnOnce(&mut AppConfig)) -> Result<(), ConfigError> {
        f(&mut self.config);
        self.save()
    }

    pub fn baud(&self) -> BaudRate {
        self.config.baud
    }

    pub fn encoding(&self) -> TextEncoding {
        self.config.encoding
    }

    pub fn gap_window(&self) -> Duration {
        self.config.gap_window()
    }

    pub fn send_cycle(&self) -> SendCycle {
        self.config.send_cycle()
    }

    pub fn uservar(&self) -> &str {
        &self.config.uservar
    }

    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.config.presets.get(name)
    }

    pub fn decode_rules(&self) -> BTreeMap<String, DecodeRule> {
        self.config.decode_rules()
    }
}
