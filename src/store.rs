//! # Persistent Variable Storage
//!
//! Calibration results and probe history must survive restarts. The engine
//! only needs a flat key-value contract ([`KeyValueStore`]) and defines the
//! key namespace and value encoding itself; how the values reach disk is the
//! host's business.
//!
//! ## Key Namespace
//!
//! All keys share a sanitised prefix (default `auto_z_tap`):
//!
//! | Key suffix | Value |
//! |---|---|
//! | `calibrated` | JSON boolean |
//! | `reference_probe_height`, `paper_delta` | height, 6 decimals |
//! | `reference_x`, `reference_y` | position, 6 decimals |
//! | `cal_bed_temp`, `cal_hotend_temp`, `cal_chamber_temp` | temperature, 1 decimal |
//! | `cal_probe_type` | string |
//! | `last_probe_height`, `last_probe_spread`, `last_offset`, `last_drift` | height, 6 decimals |
//! | `last_profiles` | array of profile names |
//! | `last_run_at` | RFC 3339 timestamp |
//! | `probe_history` | array of compact health records |
//!
//! ## Backends
//!
//! - [`MemoryStore`]: plain map, used by tests and hosts with their own persistence
//! - [`JsonFileStore`]: one JSON object on disk, rewritten on every `set`
//!
//! Missing or corrupted files load as an empty store so a fresh machine can
//! start from scratch; write failures surface as [`StoreError`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while persisting variables.
#[derive(Error, Debug)]
pub enum StoreError {
    /// File operations failed (permissions, disk space)
    #[error("store IO: {0}")]
    Io(#[from] io::Error),

    /// Value could not be encoded
    #[error("store encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Flat key-value persistence contract.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Fallback prefix when the configured one sanitises to nothing.
pub const DEFAULT_PREFIX: &str = "auto_z_tap";

/// Normalise a user supplied prefix to `[a-z0-9_]`, trimming stray
/// underscores.
pub fn sanitize_prefix(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        DEFAULT_PREFIX.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builds namespaced keys for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableKeys {
    prefix: String,
}

impl VariableKeys {
    pub fn new(raw_prefix: &str) -> Self {
        Self {
            prefix: sanitize_prefix(raw_prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    pub fn calibrated(&self) -> String {
        self.key("calibrated")
    }

    pub fn reference_probe_height(&self) -> String {
        self.key("reference_probe_height")
    }

    pub fn paper_delta(&self) -> String {
        self.key("paper_delta")
    }

    pub fn reference_x(&self) -> String {
        self.key("reference_x")
    }

    pub fn reference_y(&self) -> String {
        self.key("reference_y")
    }

    pub fn probe_history(&self) -> String {
        self.key("probe_history")
    }
}

/// Round to `decimals` places; used for every persisted float.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// JSON number for a height-like value (6 decimals).
pub fn height_value(value: f64) -> Value {
    Value::from(round_to(value, 6))
}

/// JSON number for a temperature (1 decimal).
pub fn temperature_value(value: f64) -> Value {
    Value::from(round_to(value, 1))
}

/// Lenient float decoding: stored numbers, or numeric strings written by
/// other tools.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Lenient boolean decoding: `true`/`false`, non-zero numbers, and the usual
/// truthy strings.
pub fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    }
}

/// In-memory store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file yields an empty store; a
    /// corrupted one is logged and treated as empty rather than blocking the
    /// machine.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match load_map(&path) {
            Ok(values) => {
                info!("Loaded {} stored variables from {:?}", values.len(), path);
                values
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No variables file at {:?}, starting empty", path);
                Map::new()
            }
            Err(e) => {
                warn!("Ignoring unreadable variables file {:?}: {}", path, e);
                Map::new()
            }
        };
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(&self.values)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        self.save()
    }
}

fn load_map(path: &Path) -> Result<Map<String, Value>, io::Error> {
    let data = fs::read(path)?;
    let values = serde_json::from_slice(&data)?;
    Ok(values)
}
