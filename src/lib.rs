//! # Auto Z Tap Core Library
//!
//! Computes a safe, temperature-compensated Z offset for a probe-equipped
//! printer. A one-time interactive paper calibration records how far the
//! paper-drag height sits from the probe trigger height; every later run
//! re-probes the same spot, corrects for environmental change and applies the
//! result.
//!
//! ## Design Philosophy
//!
//! ### Safety First
//! - **Bounded drift**: a probe that triggers far from its calibration height
//!   stops the run instead of being trusted silently
//! - **Bounded adjustment**: the summed compensation is capped
//! - **Safety envelope**: the final offset must fall inside a configured range
//!   before anything reaches the toolhead
//!
//! ### Host Independence
//! The library never talks to hardware directly. Motion, probing, sensors,
//! time and storage are traits in [`machine`] and [`store`]; the [`sim`]
//! module provides a deterministic stand-in for development and tests.
//!
//! ### Data Flow
//! 1. **Calibrate** (once): guarded probe → paper test → persist the delta
//! 2. **Run**: soak → guarded probe → drift check → compensation → cap →
//!    safety envelope → apply → health record → persist → report
//!
//! ## Core Types
//!
//! Shared per-run inputs live here:
//! - [`EnvironmentInput`]: what the caller knows about this run
//! - [`EnvironmentSnapshot`]: the resolved environment used for compensation

use serde::{Deserialize, Serialize};

// Module declarations
pub mod calibration;
pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod machine;
pub mod profile;
pub mod report;
pub mod sampler;
pub mod sim;
pub mod store;
pub mod thermal;

#[cfg(test)]
mod tests;

pub use error::ZOffsetError;

/// Lowercase, trimmed form used for every name comparison (profiles,
/// materials, surfaces, nozzles, probe types).
pub fn normalize_token(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Split a comma separated list into normalised, non-empty tokens.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(normalize_token)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Caller supplied facts about a run. Temperatures left as `None` are read
/// from the configured heaters.
///
/// # Example
/// ```
/// use auto_z_lib::EnvironmentInput;
///
/// let input = EnvironmentInput {
///     material: "PETG".into(),
///     surface: "textured_pei".into(),
///     first_layer_height: Some(0.25),
///     ..Default::default()
/// };
/// assert!(input.bed_temp.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInput {
    pub bed_temp: Option<f64>,
    pub hotend_temp: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub first_layer_height: Option<f64>,
    pub material: String,
    pub surface: String,
    pub nozzle: String,
}

/// Environment for one run, with every temperature resolved and every
/// filter token normalised. Never persisted.
///
/// # Example
/// ```
/// use auto_z_lib::EnvironmentSnapshot;
///
/// let env = EnvironmentSnapshot {
///     bed_temp: Some(70.0),
///     material: "pla".into(),
///     ..Default::default()
/// };
/// assert_eq!(env.hotend_temp, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub bed_temp: Option<f64>,
    pub hotend_temp: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub first_layer_height: Option<f64>,
    pub material: String,
    pub surface: String,
    pub nozzle: String,
}
