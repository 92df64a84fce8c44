// src/config.rs
//! YAML configuration held as a key-path map.
//!
//! The document is kept as an opaque `serde_json::Value` tree so unknown
//! sections round-trip untouched. Typed views are deserialised on demand.
use crate::error::ForceError;
use crate::types::{GroupKind, SensorKind};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Read;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE: &str = "config.yaml";
pub const CUSTOM_FILE: &str = "custom.yaml";

/// Well-known key paths.
pub mod paths {
    pub const TEST_NAME: &str = "general_settings.test.name";
    pub const RECORD_INTERVAL_MS: &str = "general_settings.recording.data_interval_ms";
    pub const RECORD_TARE_AMOUNT: &str = "general_settings.recording.tare_data_amount";
    pub const FILTER_FC_HZ: &str = "general_settings.filter.fc_hz";
    pub const FILTER_ORDER: &str = "general_settings.filter.order";
    pub const SENSOR_GROUPS: &str = "sensor_groups";
    pub const SENSORS: &str = "sensors";
}

pub const INTERVAL_RANGE_MS: RangeInclusive<u64> = 10..=1000;
pub const TARE_AMOUNT_RANGE: RangeInclusive<usize> = 10..=500;
pub const FILTER_ORDER_RANGE: RangeInclusive<usize> = 2..=6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordingSettings {
    pub interval_ms: u64,
    pub tare_amount: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterSettings {
    pub fc_hz: Option<f64>,
    pub order: usize,
}

/// Phidget serial numbers are integers, IMU ports are paths.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum SerialAddress {
    Number(i64),
    Path(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub channel: Option<i32>,
    #[serde(default)]
    pub serial: Option<SerialAddress>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct CalibrationConfig {
    #[serde(default = "one")]
    pub slope: f64,
    #[serde(default)]
    pub intercept: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SensorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    #[serde(default = "enabled")]
    pub read: bool,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub initial_position: i64,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GroupKind,
    #[serde(default = "enabled")]
    pub read: bool,
    #[serde(default)]
    pub sensor_list: Vec<String>,
    #[serde(default)]
    pub properties: Value,
}

fn one() -> f64 {
    1.0
}

fn enabled() -> bool {
    true
}

pub struct ConfigStore {
    dir: Option<PathBuf>,
    current: Option<PathBuf>,
    document: Value,
}

impl ConfigStore {
    /// Loads `custom.yaml` from `dir` when present, `config.yaml` otherwise.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ForceError> {
        let dir = dir.as_ref().to_path_buf();
        let custom = dir.join(CUSTOM_FILE);
        let current = if custom.exists() {
            custom
        } else {
            dir.join(DEFAULT_FILE)
        };
        let text = fs::read_to_string(&current)?;
        let document = parse_document(&text)?;
        info!("Configuration loaded from {}", current.display());
        Ok(Self {
            dir: Some(dir),
            current: Some(current),
            document,
        })
    }

    /// In-memory store; `save` is a no-op.
    pub fn from_yaml(text: &str) -> Result<Self, ForceError> {
        Ok(Self {
            dir: None,
            current: None,
            document: parse_document(text)?,
        })
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn is_custom(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|name| name == CUSTOM_FILE)
            .unwrap_or(false)
    }

    pub fn get_value(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.document, |node, key| node.as_object()?.get(key))
    }

    /// Typed lookup, falling back to `default` when the key is absent or malformed.
    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        match self.get_value(path) {
            Some(value) => match T::deserialize(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Config value at {path} has the wrong shape ({e}), using default");
                    default
                }
            },
            None => default,
        }
    }

    /// Writes `value` at `path`, creating intermediate sections.
    pub fn set_value<T: Serialize>(&mut self, path: &str, value: T) -> Result<(), ForceError> {
        let value = serde_json::to_value(value)?;
        let mut keys: Vec<&str> = path.split('.').collect();
        let last = keys
            .pop()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ForceError::Configuration(format!("empty key path '{path}'")))?;
        let mut node = &mut self.document;
        for key in keys {
            node = ensure_object(node)
                .entry(key.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(node).insert(last.to_owned(), value);
        debug!("Config value {path} updated");
        Ok(())
    }

    pub fn save(&self) -> Result<(), ForceError> {
        let Some(path) = &self.current else {
            debug!("In-memory configuration, nothing to save");
            return Ok(());
        };
        fs::write(path, serde_yaml::to_string(&self.document)?)?;
        debug!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Replaces the custom document with an uploaded one and makes it current.
    pub fn update_custom(&mut self, mut reader: impl Read) -> Result<(), ForceError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        self.document = parse_document(&text)?;
        if let Some(dir) = &self.dir {
            self.current = Some(dir.join(CUSTOM_FILE));
        }
        self.save()?;
        info!("Custom configuration updated");
        Ok(())
    }

    pub fn recording_settings(&self) -> RecordingSettings {
        RecordingSettings {
            interval_ms: self.get_or(paths::RECORD_INTERVAL_MS, 100),
            tare_amount: self.get_or(paths::RECORD_TARE_AMOUNT, 300),
        }
    }

    pub fn set_recording_interval(&mut self, interval_ms: u64) -> Result<(), ForceError> {
        if !INTERVAL_RANGE_MS.contains(&interval_ms) {
            return Err(ForceError::Configuration(format!(
                "recording interval {interval_ms} ms outside {INTERVAL_RANGE_MS:?}"
            )));
        }
        self.set_value(paths::RECORD_INTERVAL_MS, interval_ms)?;
        self.save()
    }

    pub fn set_tare_amount(&mut self, amount: usize) -> Result<(), ForceError> {
        if !TARE_AMOUNT_RANGE.contains(&amount) {
            return Err(ForceError::Configuration(format!(
                "tare amount {amount} outside {TARE_AMOUNT_RANGE:?}"
            )));
        }
        self.set_value(paths::RECORD_TARE_AMOUNT, amount)?;
        self.save()
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            fc_hz: self.get_or(paths::FILTER_FC_HZ, None),
            order: self.get_or(paths::FILTER_ORDER, 6),
        }
    }

    pub fn test_name(&self) -> String {
        self.get_or(paths::TEST_NAME, String::from("Test"))
    }

    /// Sensor declarations in document order; malformed entries are skipped.
    pub fn sensors(&self) -> Vec<(String, SensorConfig)> {
        self.section(paths::SENSORS)
    }

    pub fn groups(&self) -> Vec<(String, GroupConfig)> {
        self.section(paths::SENSOR_GROUPS)
    }

    fn section<T: DeserializeOwned>(&self, path: &str) -> Vec<(String, T)> {
        let Some(entries) = self.get_value(path).and_then(Value::as_object) else {
            warn!("Configuration has no '{path}' section");
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|(id, raw)| match T::deserialize(raw) {
                Ok(entry) => Some((id.clone(), entry)),
                Err(e) => {
                    warn!("Skipping {path}.{id}: {e}");
                    None
                }
            })
            .collect()
    }
}

fn parse_document(text: &str) -> Result<Value, ForceError> {
    let document: Value = serde_yaml::from_str(text)?;
    Ok(match document {
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}
