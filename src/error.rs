//! # Error Types
//!
//! Every fatal condition the offset engine can hit is a variant of
//! [`ZOffsetError`]. Messages carry the measured numbers and a suggested
//! remedy so the host can show them to the operator unchanged.
//!
//! Collaborator failures (motion, probing, storage) are wrapped rather than
//! flattened so the underlying cause stays visible in logs.

use crate::machine::MachineError;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Which side of the safety envelope an offset fell outside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeSide {
    /// Below `safe_offset_min`: nozzle collision risk.
    BelowMinimum,
    /// Above `safe_offset_max`: poor adhesion or air printing.
    AboveMaximum,
}

impl fmt::Display for EnvelopeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeSide::BelowMinimum => write!(
                f,
                "is below safe minimum; this could cause nozzle collision with the bed"
            ),
            EnvelopeSide::AboveMaximum => write!(
                f,
                "exceeds safe maximum; this could cause poor adhesion or air printing"
            ),
        }
    }
}

/// External capability a flow needed but was not given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Probe,
    Store,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Probe => write!(
                f,
                "probe (configure a probe before running auto Z offset)"
            ),
            Collaborator::Store => write!(
                f,
                "persistent store (configure a variables file, or set storage.require_store = false)"
            ),
        }
    }
}

fn drift_direction(drift: &f64) -> &'static str {
    if *drift < 0.0 {
        "closer to bed"
    } else {
        "further from bed"
    }
}

/// Errors produced by calibration and offset runs.
#[derive(Error, Debug)]
pub enum ZOffsetError {
    #[error(
        "auto Z offset is not calibrated. Run the interactive paper calibration once \
         (auto-z-tap calibrate) before applying offsets"
    )]
    NotCalibrated,

    #[error(
        "a calibration is already in progress. Accept or cancel the current paper test first"
    )]
    CalibrationAlreadyInProgress,

    #[error("no calibration is in progress (it was cancelled, cleared or already completed)")]
    NoCalibrationInProgress,

    #[error(
        "probe repeatability failed: spread {spread:.4}mm exceeds limit {limit:.4}mm after \
         {retries} retries. Clean the nozzle and bed, check the probe mount and wiring, or \
         raise max_spread / retries"
    )]
    RepeatabilityExceeded { spread: f64, limit: f64, retries: u32 },

    #[error(
        "drift {drift:.4}mm ({}) exceeds max drift {limit:.4}mm. The probe triggered \
         {:.4}mm away from its calibration height; re-run calibration at current \
         temperatures or raise max_drift",
        drift_direction(.drift),
        .drift.abs()
    )]
    DriftExceeded { drift: f64, limit: f64 },

    #[error(
        "adjustment {total:.4}mm exceeds max adjustment {cap:.4}mm. If this is expected, \
         raise max_total_adjustment or pass a larger per-run cap"
    )]
    AdjustmentCapExceeded { total: f64, cap: f64 },

    #[error(
        "SAFETY: offset {value:.4}mm {side} ({bound:.4}mm). Check probe calibration or adjust \
         the safe offset range"
    )]
    UnsafeOffset {
        value: f64,
        bound: f64,
        side: EnvelopeSide,
    },

    #[error("unknown adjustment profile '{name}'. Available profiles: {}", .available.join(", "))]
    UnknownProfile { name: String, available: Vec<String> },

    #[error("duplicate adjustment profile name '{0}' (names are case-insensitive)")]
    DuplicateProfileName(String),

    #[error("missing collaborator: {0}")]
    MissingCollaborator(Collaborator),

    #[error("XYZ must be homed before probing. Home the machine or enable motion.auto_home")]
    AxesNotHomed,

    #[error("thermal soak did not stabilise within {elapsed_secs:.0}s")]
    ThermalSoakTimeout { elapsed_secs: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_message_names_direction() {
        let err = ZOffsetError::DriftExceeded {
            drift: 1.2,
            limit: 0.8,
        };
        let text = err.to_string();
        assert!(text.contains("1.2000"));
        assert!(text.contains("further from bed"));

        let err = ZOffsetError::DriftExceeded {
            drift: -0.9,
            limit: 0.8,
        };
        assert!(err.to_string().contains("closer to bed"));
    }

    #[test]
    fn unsafe_offset_message_names_risk() {
        let err = ZOffsetError::UnsafeOffset {
            value: -0.7,
            bound: -0.5,
            side: EnvelopeSide::BelowMinimum,
        };
        assert!(err.to_string().contains("collision"));
    }

    #[test]
    fn unknown_profile_lists_available() {
        let err = ZOffsetError::UnknownProfile {
            name: "abs".into(),
            available: vec!["pei".into(), "pla".into()],
        };
        assert!(err.to_string().ends_with("pei, pla"));
    }
}
