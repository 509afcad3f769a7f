//! # Configuration Management
//!
//! Configuration is read from `auto-z-tap.toml` and resolved once, at
//! startup, into an immutable [`Settings`] value. Resolution is layered:
//!
//! 1. **Explicit** values from the TOML file
//! 2. **Probe-type preset** ([`ProbeType::preset`]) for the tuning knobs that
//!    depend on the probe (sample count, spread limit, soak, safety range...)
//! 3. **Hard-coded defaults** for everything else
//!
//! Nothing mutates settings afterwards; per-run tweaks go through
//! [`crate::engine::RunOverrides`].
//!
//! ## File Layout
//!
//! ```toml
//! [probe]
//! type = "tap"
//! samples = 5
//!
//! [safety]
//! safe_offset_min = -0.3
//!
//! [profiles.petg_textured]
//! material = "petg"
//! build_surface = "textured_pei"
//! offset = 0.02
//! ```

use crate::compensation::{CompensationModel, CompensationSet, Quantity, References, TermKind};
use crate::error::ZOffsetError;
use crate::normalize_token;
use crate::profile::ProfileSet;
use crate::sampler::Reduction;
use crate::store::VariableKeys;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Default configuration file name, relative to the working directory.
pub const CONFIG_FILE: &str = "auto-z-tap.toml";

/// Default variables file for [`crate::store::JsonFileStore`].
pub const VARIABLES_FILE: &str = "auto-z-tap-variables.json";

/// Supported probe families. Each maps to a table of tuned defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Tap,
    Microprobe,
    BlTouch,
    Inductive,
    Generic,
}

impl ProbeType {
    pub const ALL: [ProbeType; 5] = [
        ProbeType::BlTouch,
        ProbeType::Generic,
        ProbeType::Inductive,
        ProbeType::Microprobe,
        ProbeType::Tap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProbeType::Tap => "tap",
            ProbeType::Microprobe => "microprobe",
            ProbeType::BlTouch => "bltouch",
            ProbeType::Inductive => "inductive",
            ProbeType::Generic => "generic",
        }
    }

    /// Tuned defaults for this probe family.
    pub fn preset(self) -> ProbePreset {
        match self {
            ProbeType::Tap => ProbePreset {
                description: "CNC Tap (nozzle-as-probe)",
                probe_samples: 5,
                max_probe_spread: 0.015,
                probe_retries: 3,
                sample_retract_dist: 1.0,
                bed_temp_coeff: 0.00010,
                hotend_temp_coeff: 0.00005,
                chamber_temp_coeff: 0.00005,
                warmup_taps: 2,
                thermal_soak: true,
                thermal_soak_threshold: 0.3,
                thermal_soak_timeout: 300.0,
                max_drift: 0.80,
                max_total_adjustment: 0.500,
                safe_offset_min: -0.500,
                safe_offset_max: 0.500,
            },
            ProbeType::Microprobe => ProbePreset {
                description: "Microprobe / Klicky style",
                probe_samples: 5,
                max_probe_spread: 0.020,
                probe_retries: 2,
                sample_retract_dist: 1.5,
                bed_temp_coeff: 0.00005,
                hotend_temp_coeff: 0.00002,
                chamber_temp_coeff: 0.00003,
                warmup_taps: 0,
                thermal_soak: false,
                thermal_soak_threshold: 0.5,
                thermal_soak_timeout: 180.0,
                max_drift: 1.0,
                max_total_adjustment: 0.600,
                safe_offset_min: -0.600,
                safe_offset_max: 0.600,
            },
            ProbeType::BlTouch => ProbePreset {
                description: "BLTouch / servo deploy probe",
                probe_samples: 7,
                max_probe_spread: 0.030,
                probe_retries: 3,
                sample_retract_dist: 2.0,
                bed_temp_coeff: 0.00003,
                hotend_temp_coeff: 0.00001,
                chamber_temp_coeff: 0.00002,
                warmup_taps: 1,
                thermal_soak: false,
                thermal_soak_threshold: 0.5,
                thermal_soak_timeout: 120.0,
                max_drift: 1.2,
                max_total_adjustment: 0.700,
                safe_offset_min: -0.700,
                safe_offset_max: 0.700,
            },
            ProbeType::Inductive => ProbePreset {
                description: "Inductive / capacitive proximity probe",
                probe_samples: 7,
                max_probe_spread: 0.025,
                probe_retries: 2,
                sample_retract_dist: 2.0,
                bed_temp_coeff: 0.00080,
                hotend_temp_coeff: 0.00005,
                chamber_temp_coeff: 0.00010,
                warmup_taps: 1,
                thermal_soak: true,
                thermal_soak_threshold: 0.2,
                thermal_soak_timeout: 600.0,
                max_drift: 1.5,
                max_total_adjustment: 0.800,
                safe_offset_min: -0.800,
                safe_offset_max: 0.800,
            },
            ProbeType::Generic => ProbePreset {
                description: "Generic / unknown probe type",
                probe_samples: 5,
                max_probe_spread: 0.020,
                probe_retries: 2,
                sample_retract_dist: 1.5,
                bed_temp_coeff: 0.0,
                hotend_temp_coeff: 0.0,
                chamber_temp_coeff: 0.0,
                warmup_taps: 0,
                thermal_soak: false,
                thermal_soak_threshold: 0.3,
                thermal_soak_timeout: 300.0,
                max_drift: 1.0,
                max_total_adjustment: 0.600,
                safe_offset_min: -0.500,
                safe_offset_max: 0.500,
            },
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProbeType {
    type Err = ZOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_token(s);
        ProbeType::ALL
            .into_iter()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = ProbeType::ALL.iter().map(|t| t.name()).collect();
                ZOffsetError::InvalidConfig(format!(
                    "unknown probe type '{}'. Valid types: {}",
                    s.trim(),
                    known.join(", ")
                ))
            })
    }
}

/// Default tuning for one probe family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbePreset {
    pub description: &'static str,
    pub probe_samples: u32,
    pub max_probe_spread: f64,
    pub probe_retries: u32,
    pub sample_retract_dist: f64,
    pub bed_temp_coeff: f64,
    pub hotend_temp_coeff: f64,
    pub chamber_temp_coeff: f64,
    pub warmup_taps: u32,
    pub thermal_soak: bool,
    /// °C per minute
    pub thermal_soak_threshold: f64,
    /// Seconds
    pub thermal_soak_timeout: f64,
    pub max_drift: f64,
    pub max_total_adjustment: f64,
    pub safe_offset_min: f64,
    pub safe_offset_max: f64,
}

// ---------------------------------------------------------------------------
// File model: every field optional, resolution happens in `Settings`.
// ---------------------------------------------------------------------------

/// Application configuration as written in `auto-z-tap.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub probe: ProbeConfig,
    pub motion: MotionConfig,
    pub thermal_soak: ThermalSoakConfig,
    pub compensation: CompensationConfig,
    pub safety: SafetyConfig,
    pub storage: StorageConfig,
    pub health: HealthConfig,
    pub calibration: CalibrationConfig,
    pub report: ReportConfig,
    /// Adjustment profiles keyed by name
    pub profiles: BTreeMap<String, ProfileConfig>,
}

/// Probe selection and sampling
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(rename = "type")]
    pub probe_type: Option<String>,
    pub samples: Option<u32>,
    pub samples_result: Option<Reduction>,
    pub max_spread: Option<f64>,
    pub retries: Option<u32>,
    pub sample_retract_dist: Option<f64>,
    pub probe_speed: Option<f64>,
    pub lift_speed: Option<f64>,
    pub warmup_taps: Option<u32>,
    pub max_drift: Option<f64>,
}

/// Travel heights, speeds and reference position
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    pub safe_z: Option<f64>,
    pub probe_start_z: Option<f64>,
    pub travel_speed: Option<f64>,
    pub calibration_z_hop: Option<f64>,
    pub auto_home: Option<bool>,
    pub clear_bed_mesh_before_probe: Option<bool>,
    pub apply_move: Option<bool>,
    /// Explicit probing position
    pub reference_xy: Option<[f64; 2]>,
    /// Axis limits, used to derive the bed centre when no position is set
    pub axis_min: Option<[f64; 2]>,
    pub axis_max: Option<[f64; 2]>,
}

/// Thermal soak before probing
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThermalSoakConfig {
    pub enabled: Option<bool>,
    /// °C per minute
    pub threshold: Option<f64>,
    /// Seconds
    pub timeout: Option<f64>,
    pub sensors: Option<Vec<String>>,
    /// Seconds between polls
    pub poll_interval: Option<f64>,
    pub abort_on_timeout: Option<bool>,
}

/// Global compensation terms and references
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompensationConfig {
    pub global_offset: Option<f64>,
    pub bed_temp_coeff: Option<f64>,
    pub hotend_temp_coeff: Option<f64>,
    pub chamber_temp_coeff: Option<f64>,
    pub first_layer_coeff: Option<f64>,
    pub bed_temp_poly: Vec<f64>,
    pub hotend_temp_poly: Vec<f64>,
    pub chamber_temp_poly: Vec<f64>,
    pub bed_temp_reference: Option<f64>,
    pub hotend_temp_reference: Option<f64>,
    pub chamber_temp_reference: Option<f64>,
    pub first_layer_reference: Option<f64>,
    pub max_total_adjustment: Option<f64>,
    pub default_profiles: Vec<String>,
    pub bed_sensor: Option<String>,
    pub hotend_sensor: Option<String>,
    pub chamber_sensor: Option<String>,
}

/// Final offset envelope
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub safe_offset_min: Option<f64>,
    pub safe_offset_max: Option<f64>,
}

/// Where and how state is persisted
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub variable_prefix: Option<String>,
    pub path: Option<PathBuf>,
    pub require_store: Option<bool>,
    pub persist_last_run: Option<bool>,
}

/// Probe health tracking
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub tracking: Option<bool>,
    pub adaptive_samples: Option<bool>,
}

/// Calibration extras
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Re-probe after committing and report drift
    pub validate: Option<bool>,
}

/// Operator report options
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    pub breakdown: Option<bool>,
}

/// One `[profiles.<name>]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub material: Option<String>,
    #[serde(alias = "surface")]
    pub build_surface: Option<String>,
    pub nozzle: Option<String>,
    pub probe_type: Option<String>,
    pub offset: Option<f64>,
    pub bed_temp_coeff: Option<f64>,
    pub hotend_temp_coeff: Option<f64>,
    pub chamber_temp_coeff: Option<f64>,
    pub first_layer_coeff: Option<f64>,
    pub bed_temp_poly: Vec<f64>,
    pub hotend_temp_poly: Vec<f64>,
    pub chamber_temp_poly: Vec<f64>,
    pub bed_temp_reference: Option<f64>,
    pub hotend_temp_reference: Option<f64>,
    pub chamber_temp_reference: Option<f64>,
    pub first_layer_reference: Option<f64>,
}

impl Config {
    /// Load configuration from `auto-z-tap.toml` in the working directory.
    pub fn load() -> Result<Self, ZOffsetError> {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from the specified path.
    /// A missing file yields the default configuration; a malformed file is
    /// an error, since offsets computed from a half-read config are unsafe.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ZOffsetError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = Self::parse(&contents)?;
                info!(
                    "Loaded configuration from {:?} ({} profiles)",
                    path,
                    config.profiles.len()
                );
                Ok(config)
            }
            Err(_) => {
                info!("No config file at {:?}, using generic probe defaults", path);
                Ok(Self::default())
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ZOffsetError> {
        toml::from_str(contents)
            .map_err(|e| ZOffsetError::InvalidConfig(format!("malformed config file: {}", e)))
    }

    /// Save configuration to `path` as pretty TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!("Configuration saved to {:?}", path.as_ref());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Probing parameters after preset resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSettings {
    pub samples: u32,
    pub reduction: Reduction,
    pub max_spread: f64,
    pub retries: u32,
    pub retract_dist: f64,
    pub probe_speed: Option<f64>,
    pub lift_speed: f64,
    pub warmup_taps: u32,
}

/// Motion parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub safe_z: f64,
    pub probe_start_z: f64,
    pub travel_speed: f64,
    pub calibration_z_hop: f64,
    pub auto_home: bool,
    pub clear_bed_mesh: bool,
    pub apply_move: bool,
    pub reference_xy: Option<(f64, f64)>,
}

/// Thermal soak parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SoakSettings {
    pub enabled: bool,
    pub threshold_per_minute: f64,
    pub timeout: Duration,
    pub sensors: Vec<String>,
    pub poll_interval: Duration,
    pub abort_on_timeout: bool,
}

/// Heater names used to resolve the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorNames {
    pub bed: String,
    pub hotend: String,
    pub chamber: Option<String>,
}

/// Storage parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub keys: VariableKeys,
    pub path: PathBuf,
    pub require_store: bool,
    pub persist_last_run: bool,
}

/// Immutable, fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub probe_type: ProbeType,
    pub preset: ProbePreset,
    pub sampling: SamplingSettings,
    pub motion: MotionSettings,
    pub soak: SoakSettings,
    pub sensors: SensorNames,
    pub storage: StorageSettings,
    pub max_drift: f64,
    pub max_total_adjustment: f64,
    pub safe_offset_min: f64,
    pub safe_offset_max: f64,
    /// Global terms, each carrying the global reference for its quantity
    pub global: CompensationSet,
    /// Global references handed to profiles as their first fallback
    pub global_refs: References,
    pub default_profiles: Vec<String>,
    pub profiles: ProfileSet,
    pub health_tracking: bool,
    pub adaptive_samples: bool,
    pub calibration_validate: bool,
    pub report_breakdown: bool,
}

fn require(condition: bool, message: &str) -> Result<(), ZOffsetError> {
    if condition {
        Ok(())
    } else {
        Err(ZOffsetError::InvalidConfig(message.to_string()))
    }
}

fn global_term(
    quantity: Quantity,
    coeff: f64,
    poly: &[f64],
    reference: Option<f64>,
) -> Option<CompensationModel> {
    TermKind::from_config(coeff, poly).map(|kind| CompensationModel {
        quantity,
        kind,
        reference,
    })
}

impl Settings {
    /// Resolve explicit values over the probe preset over built-in defaults,
    /// then validate.
    pub fn resolve(config: &Config) -> Result<Self, ZOffsetError> {
        let probe_type = match &config.probe.probe_type {
            Some(name) => name.parse()?,
            None => ProbeType::Generic,
        };
        let preset = probe_type.preset();

        let p = &config.probe;
        let m = &config.motion;
        let c = &config.compensation;

        let travel_speed = m.travel_speed.unwrap_or(150.0);
        let sampling = SamplingSettings {
            samples: p.samples.unwrap_or(preset.probe_samples),
            reduction: p.samples_result.unwrap_or(Reduction::Median),
            max_spread: p.max_spread.unwrap_or(preset.max_probe_spread),
            retries: p.retries.unwrap_or(preset.probe_retries),
            retract_dist: p.sample_retract_dist.unwrap_or(preset.sample_retract_dist),
            probe_speed: p.probe_speed,
            lift_speed: p.lift_speed.unwrap_or(travel_speed),
            warmup_taps: p.warmup_taps.unwrap_or(preset.warmup_taps),
        };
        require(sampling.samples >= 1, "probe.samples must be at least 1")?;
        require(sampling.max_spread >= 0.0, "probe.max_spread must be >= 0")?;
        require(sampling.retract_dist > 0.0, "probe.sample_retract_dist must be > 0")?;
        require(sampling.lift_speed > 0.0, "probe.lift_speed must be > 0")?;
        require(
            sampling.probe_speed.map_or(true, |s| s > 0.0),
            "probe.probe_speed must be > 0",
        )?;

        let reference_xy = match (m.reference_xy, m.axis_min, m.axis_max) {
            (Some([x, y]), _, _) => Some((x, y)),
            (None, min, Some([xmax, ymax])) => {
                let [xmin, ymin] = min.unwrap_or([0.0, 0.0]);
                Some(((xmin + xmax) / 2.0, (ymin + ymax) / 2.0))
            }
            _ => None,
        };
        let motion = MotionSettings {
            safe_z: m.safe_z.unwrap_or(10.0),
            probe_start_z: m.probe_start_z.unwrap_or(8.0),
            travel_speed,
            calibration_z_hop: m.calibration_z_hop.unwrap_or(5.0),
            auto_home: m.auto_home.unwrap_or(true),
            clear_bed_mesh: m.clear_bed_mesh_before_probe.unwrap_or(true),
            apply_move: m.apply_move.unwrap_or(false),
            reference_xy,
        };
        require(motion.safe_z > 0.0, "motion.safe_z must be > 0")?;
        require(motion.probe_start_z > 0.0, "motion.probe_start_z must be > 0")?;
        require(motion.travel_speed > 0.0, "motion.travel_speed must be > 0")?;
        require(
            motion.calibration_z_hop > 0.0,
            "motion.calibration_z_hop must be > 0",
        )?;

        let s = &config.thermal_soak;
        let soak = SoakSettings {
            enabled: s.enabled.unwrap_or(preset.thermal_soak),
            threshold_per_minute: s.threshold.unwrap_or(preset.thermal_soak_threshold),
            timeout: Duration::from_secs_f64(
                s.timeout.unwrap_or(preset.thermal_soak_timeout).max(0.0),
            ),
            sensors: s
                .sensors
                .clone()
                .unwrap_or_else(|| vec!["heater_bed".to_string()])
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            poll_interval: Duration::from_secs_f64(s.poll_interval.unwrap_or(2.0).max(0.0)),
            abort_on_timeout: s.abort_on_timeout.unwrap_or(false),
        };
        require(
            soak.threshold_per_minute > 0.0,
            "thermal_soak.threshold must be > 0",
        )?;
        require(!soak.timeout.is_zero(), "thermal_soak.timeout must be > 0")?;
        require(
            !soak.poll_interval.is_zero(),
            "thermal_soak.poll_interval must be > 0",
        )?;

        let sensors = SensorNames {
            bed: c.bed_sensor.clone().unwrap_or_else(|| "heater_bed".into()),
            hotend: c.hotend_sensor.clone().unwrap_or_else(|| "extruder".into()),
            chamber: c
                .chamber_sensor
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        };

        let st = &config.storage;
        let storage = StorageSettings {
            keys: VariableKeys::new(st.variable_prefix.as_deref().unwrap_or("auto_z_tap")),
            path: st
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(VARIABLES_FILE)),
            require_store: st.require_store.unwrap_or(true),
            persist_last_run: st.persist_last_run.unwrap_or(true),
        };

        let max_drift = p.max_drift.unwrap_or(preset.max_drift);
        let max_total_adjustment = c
            .max_total_adjustment
            .unwrap_or(preset.max_total_adjustment);
        let safe_offset_min = config
            .safety
            .safe_offset_min
            .unwrap_or(preset.safe_offset_min);
        let safe_offset_max = config
            .safety
            .safe_offset_max
            .unwrap_or(preset.safe_offset_max);
        require(max_drift >= 0.0, "probe.max_drift must be >= 0")?;
        require(
            max_total_adjustment >= 0.0,
            "compensation.max_total_adjustment must be >= 0",
        )?;
        require(
            safe_offset_min <= safe_offset_max,
            "safety.safe_offset_min must not exceed safe_offset_max",
        )?;

        let global_refs = References {
            bed_temp: c.bed_temp_reference,
            hotend_temp: c.hotend_temp_reference,
            chamber_temp: c.chamber_temp_reference,
            first_layer: Some(c.first_layer_reference.unwrap_or(0.20)),
        };
        let global = CompensationSet {
            offset: c.global_offset.unwrap_or(0.0),
            terms: [
                global_term(
                    Quantity::BedTemp,
                    c.bed_temp_coeff.unwrap_or(preset.bed_temp_coeff),
                    &c.bed_temp_poly,
                    global_refs.bed_temp,
                ),
                global_term(
                    Quantity::HotendTemp,
                    c.hotend_temp_coeff.unwrap_or(preset.hotend_temp_coeff),
                    &c.hotend_temp_poly,
                    global_refs.hotend_temp,
                ),
                global_term(
                    Quantity::ChamberTemp,
                    c.chamber_temp_coeff.unwrap_or(preset.chamber_temp_coeff),
                    &c.chamber_temp_poly,
                    global_refs.chamber_temp,
                ),
                global_term(
                    Quantity::FirstLayer,
                    c.first_layer_coeff.unwrap_or(0.0),
                    &[],
                    global_refs.first_layer,
                ),
            ]
            .into_iter()
            .flatten()
            .collect(),
        };

        let profiles = ProfileSet::from_configs(&config.profiles)?;

        Ok(Settings {
            probe_type,
            preset,
            sampling,
            motion,
            soak,
            sensors,
            storage,
            max_drift,
            max_total_adjustment,
            safe_offset_min,
            safe_offset_max,
            global,
            global_refs,
            default_profiles: c
                .default_profiles
                .iter()
                .map(|name| normalize_token(name))
                .filter(|name| !name.is_empty())
                .collect(),
            profiles,
            health_tracking: config.health.tracking.unwrap_or(true),
            adaptive_samples: config.health.adaptive_samples.unwrap_or(false),
            calibration_validate: config.calibration.validate.unwrap_or(false),
            report_breakdown: config.report.breakdown.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = Settings::resolve(&Config::default()).unwrap();
        assert_eq!(settings.probe_type, ProbeType::Generic);
        assert_eq!(settings.sampling.samples, 5);
        assert_eq!(settings.sampling.reduction, Reduction::Median);
        assert_eq!(settings.max_drift, 1.0);
        assert_eq!(settings.safe_offset_min, -0.5);
        assert_eq!(settings.global_refs.first_layer, Some(0.20));
        assert!(settings.global.terms.is_empty());
        assert_eq!(settings.storage.keys.prefix(), "auto_z_tap");
    }

    #[test]
    fn test_preset_fills_unset_values() {
        let config = Config::parse("[probe]\ntype = \"TAP\"\n").unwrap();
        let settings = Settings::resolve(&config).unwrap();
        assert_eq!(settings.probe_type, ProbeType::Tap);
        assert_eq!(settings.sampling.max_spread, 0.015);
        assert_eq!(settings.sampling.warmup_taps, 2);
        assert!(settings.soak.enabled);
        assert_eq!(settings.max_drift, 0.80);
        // Tap ships bed/hotend/chamber coefficients
        assert_eq!(settings.global.terms.len(), 3);
    }

    #[test]
    fn test_explicit_beats_preset() {
        let config = Config::parse(
            r#"
            [probe]
            type = "inductive"
            samples = 3
            max_drift = 0.4

            [thermal_soak]
            enabled = false

            [compensation]
            bed_temp_coeff = 0.0
            bed_temp_poly = [0.0001, 0.00001]
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(&config).unwrap();
        assert_eq!(settings.sampling.samples, 3);
        assert_eq!(settings.max_drift, 0.4);
        assert!(!settings.soak.enabled);
        let bed = settings
            .global
            .terms
            .iter()
            .find(|t| t.quantity == Quantity::BedTemp)
            .unwrap();
        assert_eq!(bed.kind, TermKind::Polynomial(vec![0.0001, 0.00001]));
    }

    #[test]
    fn test_unknown_probe_type_rejected() {
        let config = Config::parse("[probe]\ntype = \"laser\"\n").unwrap();
        let err = Settings::resolve(&config).unwrap_err();
        assert!(err.to_string().contains("bltouch, generic, inductive, microprobe, tap"));
    }

    #[test]
    fn test_inverted_envelope_rejected() {
        let config =
            Config::parse("[safety]\nsafe_offset_min = 0.5\nsafe_offset_max = -0.5\n").unwrap();
        assert!(matches!(
            Settings::resolve(&config),
            Err(ZOffsetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reference_xy_from_axis_limits() {
        let config = Config::parse("[motion]\naxis_max = [250.0, 210.0]\n").unwrap();
        let settings = Settings::resolve(&config).unwrap();
        assert_eq!(settings.motion.reference_xy, Some((125.0, 105.0)));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.probe.probe_type = Some("bltouch".into());
        config.safety.safe_offset_max = Some(0.9);
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = Config::parse(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = Config::load_from_path("/nonexistent/path").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "[probe\ntype = ").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }
}
