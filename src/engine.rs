//! # Offset Engine
//!
//! Top-level orchestrator. One [`OffsetEngine::run`] re-measures the probe at
//! the reference point and turns the stored calibration into a Z offset for
//! the current conditions:
//!
//! 1. Preconditions: probe present, store present when required, calibrated
//! 2. Optional thermal soak, homing, bed mesh clear, warm-up taps
//! 3. Guarded sample (or the reading handed over by calibration)
//! 4. Drift check against the calibration-time trigger height
//! 5. `estimated paper height = probe height + paper delta`
//! 6. Compensation: global terms, resolved profiles, manual trim
//! 7. Cap on the summed adjustment
//! 8. Safety envelope on the final offset
//! 9. Apply through the toolhead
//! 10. Record the session in probe health
//! 11. Persist last-run telemetry
//! 12. Return the full breakdown
//!
//! Any failure up to step 8 leaves the machine and the store untouched.
//! Steps 10 and 11 are best effort: the offset is already live, so storage
//! failures there are logged and the run still succeeds.

use crate::calibration::{CalibrationPhase, CalibrationState, CalibrationStateMachine};
use crate::compensation::BreakdownEntry;
use crate::config::{ProbeType, Settings};
use crate::error::{Collaborator, EnvelopeSide, ZOffsetError};
use crate::health::{ConfidenceLevel, HealthRecord, HealthStats, ProbeHealthTracker};
use crate::machine::{MachineIo, ProbeParams, Sensors};
use crate::sampler::{GuardedSampler, ProbeTestReport, Reduction, SampleRequest, SampleSession};
use crate::store::{height_value, value_as_f64, KeyValueStore, StoreError, VariableKeys};
use crate::thermal::{SoakOutcome, ThermalStabilityWaiter};
use crate::{normalize_token, EnvironmentInput, EnvironmentSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Per-run adjustments on top of the resolved settings. `None` keeps the
/// configured value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub samples: Option<u32>,
    pub retries: Option<u32>,
    pub max_spread: Option<f64>,
    pub reduction: Option<Reduction>,
    pub probe_speed: Option<f64>,
    pub lift_speed: Option<f64>,
    pub retract_dist: Option<f64>,
    pub thermal_soak: Option<bool>,
    pub thermal_soak_timeout: Option<Duration>,
    pub warmup_taps: Option<u32>,
    pub max_drift: Option<f64>,
    pub max_adjust: Option<f64>,
    pub safe_offset_min: Option<f64>,
    pub safe_offset_max: Option<f64>,
    /// Manual trim added to the compensation total (mm)
    pub extra: f64,
    pub auto_match: Option<bool>,
    pub move_on_apply: Option<bool>,
    pub move_speed: Option<f64>,
    /// Persist last-run telemetry
    pub save: Option<bool>,
}

/// Telemetry of the last applied offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastRun {
    pub probe_height: Option<f64>,
    pub spread: Option<f64>,
    pub offset: Option<f64>,
    pub drift: Option<f64>,
    pub profiles: Vec<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl LastRun {
    pub fn load(store: &dyn KeyValueStore, keys: &VariableKeys) -> Self {
        let number = |suffix: &str| store.get(&keys.key(suffix)).as_ref().and_then(value_as_f64);
        Self {
            probe_height: number("last_probe_height"),
            spread: number("last_probe_spread"),
            offset: number("last_offset"),
            drift: number("last_drift"),
            profiles: store
                .get(&keys.key("last_profiles"))
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            applied_at: store
                .get(&keys.key("last_run_at"))
                .and_then(|v| v.as_str().map(str::to_string))
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    pub fn persist(
        &self,
        store: &mut dyn KeyValueStore,
        keys: &VariableKeys,
    ) -> Result<(), StoreError> {
        let height = |v: Option<f64>| v.map(height_value).unwrap_or(Value::Null);
        store.set(&keys.key("last_probe_height"), height(self.probe_height))?;
        store.set(&keys.key("last_probe_spread"), height(self.spread))?;
        store.set(&keys.key("last_offset"), height(self.offset))?;
        store.set(&keys.key("last_drift"), height(self.drift))?;
        store.set(
            &keys.key("last_profiles"),
            serde_json::to_value(&self.profiles)?,
        )?;
        let applied_at = self
            .applied_at
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null);
        store.set(&keys.key("last_run_at"), applied_at)?;
        Ok(())
    }
}

/// Summed compensation for one environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub total: f64,
    pub breakdown: Vec<BreakdownEntry>,
    pub profiles: Vec<String>,
}

/// Full audit record of one applied offset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetReport {
    pub probe_type: ProbeType,
    pub reference_xy: (f64, f64),
    pub session: SampleSession,
    pub drift: f64,
    pub paper_delta: f64,
    pub estimated_paper_height: f64,
    pub adjustment_total: f64,
    pub final_offset: f64,
    pub profiles: Vec<String>,
    pub breakdown: Vec<BreakdownEntry>,
    pub environment: EnvironmentSnapshot,
    pub warmup_taps: u32,
    pub thermal_soak: Option<SoakOutcome>,
    pub health_warnings: Vec<String>,
    pub confidence: Option<(ConfidenceLevel, f64)>,
    pub applied_at: DateTime<Utc>,
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub probe_type: ProbeType,
    pub probe_description: &'static str,
    pub calibration: CalibrationState,
    pub calibration_in_progress: bool,
    pub reference_xy: (f64, f64),
    pub last_run: LastRun,
    pub warmup_taps: u32,
    pub thermal_soak: bool,
    pub safe_offset_range: (f64, f64),
    pub profiles: Vec<String>,
    pub health: Option<(HealthStats, ConfidenceLevel, f64)>,
}

/// Result of the `health` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthReport {
    Disabled,
    NoData,
    Tracked {
        probe_type: ProbeType,
        stats: HealthStats,
        level: ConfidenceLevel,
        score: f64,
        suggested_samples: u32,
        configured_samples: u32,
        warnings: Vec<String>,
    },
}

/// Effective parameters for one flow, after overrides.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub sampler: GuardedSampler,
    pub request: SampleRequest,
    pub position: (f64, f64),
    pub warmup_taps: u32,
    pub soak: bool,
    pub soak_timeout: Duration,
    pub max_drift: f64,
    pub max_adjust: f64,
    pub safe_min: f64,
    pub safe_max: f64,
    pub extra: f64,
    pub auto_match: bool,
    pub move_speed: Option<f64>,
    pub save: bool,
}

/// What the measurement phase produced.
pub(crate) struct Acquired {
    pub session: SampleSession,
    pub soak: Option<SoakOutcome>,
    pub warmup_taps: u32,
}

fn positive(name: &str, value: Option<f64>) -> Result<Option<f64>, ZOffsetError> {
    match value {
        Some(v) if v <= 0.0 => Err(ZOffsetError::InvalidConfig(format!(
            "{} must be > 0, got {}",
            name, v
        ))),
        other => Ok(other),
    }
}

fn non_negative(name: &str, value: Option<f64>) -> Result<Option<f64>, ZOffsetError> {
    match value {
        Some(v) if v < 0.0 => Err(ZOffsetError::InvalidConfig(format!(
            "{} must be >= 0, got {}",
            name, v
        ))),
        other => Ok(other),
    }
}

/// Reject offsets outside `[min, max]`.
pub fn check_envelope(value: f64, min: f64, max: f64) -> Result<(), ZOffsetError> {
    if value < min {
        return Err(ZOffsetError::UnsafeOffset {
            value,
            bound: min,
            side: EnvelopeSide::BelowMinimum,
        });
    }
    if value > max {
        return Err(ZOffsetError::UnsafeOffset {
            value,
            bound: max,
            side: EnvelopeSide::AboveMaximum,
        });
    }
    Ok(())
}

/// Owns calibration state, health history and the store.
pub struct OffsetEngine {
    pub(crate) settings: Settings,
    pub(crate) store: Option<Box<dyn KeyValueStore>>,
    pub(crate) state: CalibrationState,
    pub(crate) last_run: LastRun,
    pub(crate) health: Option<ProbeHealthTracker>,
    pub(crate) calibration: CalibrationStateMachine,
}

impl OffsetEngine {
    /// Build the engine and load persisted state from `store`, if any.
    pub fn new(settings: Settings, store: Option<Box<dyn KeyValueStore>>) -> Self {
        let keys = &settings.storage.keys;
        let (state, last_run) = match store.as_deref() {
            Some(s) => (CalibrationState::load(s, keys), LastRun::load(s, keys)),
            None => (CalibrationState::default(), LastRun::default()),
        };
        let health = settings.health_tracking.then(|| match store.as_deref() {
            Some(s) => ProbeHealthTracker::load(s, keys),
            None => ProbeHealthTracker::new(),
        });
        info!(
            "Offset engine ready (probe_type={}, calibrated={})",
            settings.probe_type, state.calibrated
        );
        Self {
            settings,
            store,
            state,
            last_run,
            health,
            calibration: CalibrationStateMachine::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn last_run(&self) -> &LastRun {
        &self.last_run
    }

    pub fn health(&self) -> Option<&ProbeHealthTracker> {
        self.health.as_ref()
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub(crate) fn require_store(&self) -> Result<(), ZOffsetError> {
        if self.settings.storage.require_store && self.store.is_none() {
            return Err(ZOffsetError::MissingCollaborator(Collaborator::Store));
        }
        Ok(())
    }

    /// Probing position: explicit XY, then configured, then calibrated.
    fn reference_xy(&self, overrides: &RunOverrides) -> (f64, f64) {
        match (overrides.x, overrides.y) {
            (Some(x), Some(y)) => (x, y),
            _ => self
                .settings
                .motion
                .reference_xy
                .or(self.state.reference_xy)
                .unwrap_or((0.0, 0.0)),
        }
    }

    pub(crate) fn plan(&self, overrides: &RunOverrides) -> Result<RunPlan, ZOffsetError> {
        let s = &self.settings;
        if overrides.samples == Some(0) {
            return Err(ZOffsetError::InvalidConfig("samples must be at least 1".into()));
        }
        let probe_speed = positive("probe_speed", overrides.probe_speed)?.or(s.sampling.probe_speed);
        let lift_speed = positive("lift_speed", overrides.lift_speed)?.unwrap_or(s.sampling.lift_speed);
        let retract_dist =
            positive("sample_retract_dist", overrides.retract_dist)?.unwrap_or(s.sampling.retract_dist);
        let move_speed = positive("move_speed", overrides.move_speed)?;
        let soak_timeout = match overrides.thermal_soak_timeout {
            Some(t) if t.is_zero() => {
                return Err(ZOffsetError::InvalidConfig(
                    "thermal soak timeout must be > 0".into(),
                ))
            }
            Some(t) => t,
            None => s.soak.timeout,
        };
        let safe_min = overrides.safe_offset_min.unwrap_or(s.safe_offset_min);
        let safe_max = overrides.safe_offset_max.unwrap_or(s.safe_offset_max);
        if safe_min > safe_max {
            return Err(ZOffsetError::InvalidConfig(format!(
                "safe offset range is inverted: [{:.3}, {:.3}]",
                safe_min, safe_max
            )));
        }

        Ok(RunPlan {
            sampler: GuardedSampler {
                safe_z: s.motion.safe_z,
                probe_start_z: s.motion.probe_start_z,
                travel_speed: s.motion.travel_speed,
                params: ProbeParams {
                    probe_speed,
                    lift_speed,
                    retract_dist,
                },
            },
            request: SampleRequest {
                sample_count: overrides.samples.unwrap_or(s.sampling.samples),
                max_attempts: overrides.retries.unwrap_or(s.sampling.retries),
                spread_limit: non_negative("max_spread", overrides.max_spread)?
                    .unwrap_or(s.sampling.max_spread),
                reduction: overrides.reduction.unwrap_or(s.sampling.reduction),
            },
            position: self.reference_xy(overrides),
            warmup_taps: overrides.warmup_taps.unwrap_or(s.sampling.warmup_taps),
            soak: overrides.thermal_soak.unwrap_or(s.soak.enabled),
            soak_timeout,
            max_drift: non_negative("max_drift", overrides.max_drift)?.unwrap_or(s.max_drift),
            max_adjust: non_negative("max_adjust", overrides.max_adjust)?
                .unwrap_or(s.max_total_adjustment),
            safe_min,
            safe_max,
            extra: overrides.extra,
            auto_match: overrides.auto_match.unwrap_or(true),
            move_speed: if overrides.move_on_apply.unwrap_or(s.motion.apply_move) {
                Some(move_speed.unwrap_or(s.motion.travel_speed))
            } else {
                None
            },
            save: overrides.save.unwrap_or(s.storage.persist_last_run),
        })
    }

    /// Caller values win; otherwise a heater's positive target, then its
    /// current reading. Unreadable sensors stay unknown.
    pub fn resolve_environment(
        &self,
        sensors: &dyn Sensors,
        input: &EnvironmentInput,
    ) -> EnvironmentSnapshot {
        let read = |name: &str| sensors.heater(name).and_then(|status| status.effective());
        let names = &self.settings.sensors;
        EnvironmentSnapshot {
            bed_temp: input.bed_temp.or_else(|| read(&names.bed)),
            hotend_temp: input.hotend_temp.or_else(|| read(&names.hotend)),
            chamber_temp: input
                .chamber_temp
                .or_else(|| names.chamber.as_deref().and_then(|name| read(name))),
            first_layer_height: input.first_layer_height,
            material: normalize_token(&input.material),
            surface: normalize_token(&input.surface),
            nozzle: normalize_token(&input.nozzle),
        }
    }

    /// Global terms, then each resolved profile, then the manual trim.
    pub fn compute_adjustment(
        &self,
        env: &EnvironmentSnapshot,
        requested: &[String],
        auto_match: bool,
        extra: f64,
    ) -> Result<Adjustment, ZOffsetError> {
        let s = &self.settings;
        let calibration_refs = self.state.reference_env;
        let (mut total, mut breakdown) =
            s.global
                .calculate(env, &[&calibration_refs], "global_", "global_offset", "config");

        let profiles = s.profiles.resolve(
            requested,
            &s.default_profiles,
            auto_match,
            env,
            s.probe_type,
        )?;
        for profile in &profiles {
            let (value, details) = profile.calculate(env, &calibration_refs, &s.global_refs);
            total += value;
            breakdown.push(BreakdownEntry::new(
                format!("profile:{}", profile.name),
                value,
                "profile total",
            ));
            breakdown.extend(details.into_iter().map(|d| {
                BreakdownEntry::new(format!("profile:{}:{}", profile.name, d.label), d.value, d.note)
            }));
        }

        if extra != 0.0 {
            total += extra;
            breakdown.push(BreakdownEntry::new("extra", extra, "manual trim"));
        }

        Ok(Adjustment {
            total,
            breakdown,
            profiles: profiles.iter().map(|p| p.name.clone()).collect(),
        })
    }

    fn ensure_homed(&self, io: &mut MachineIo<'_>) -> Result<(), ZOffsetError> {
        if io.all_homed() {
            return Ok(());
        }
        if !self.settings.motion.auto_home {
            return Err(ZOffsetError::AxesNotHomed);
        }
        info!("Axes not homed, homing");
        io.toolhead.home()?;
        Ok(())
    }

    fn soak(&self, io: &mut MachineIo<'_>, plan: &RunPlan) -> Result<Option<SoakOutcome>, ZOffsetError> {
        let soak = &self.settings.soak;
        if !plan.soak || soak.sensors.is_empty() {
            return Ok(None);
        }
        let outcome = ThermalStabilityWaiter::new(io.sensors, &mut *io.clock).wait(
            &soak.sensors,
            soak.threshold_per_minute,
            plan.soak_timeout,
            soak.poll_interval,
        );
        if let SoakOutcome::TimedOut { elapsed } = outcome {
            if soak.abort_on_timeout {
                return Err(ZOffsetError::ThermalSoakTimeout {
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
            warn!(
                "Thermal soak timed out after {:.0}s. Proceeding with current temperatures",
                elapsed.as_secs_f64()
            );
        }
        Ok(Some(outcome))
    }

    /// Soak, home, clear mesh, warm up and take a guarded sample.
    pub(crate) fn acquire(
        &self,
        io: &mut MachineIo<'_>,
        plan: &RunPlan,
        adaptive: bool,
    ) -> Result<Acquired, ZOffsetError> {
        let soak = self.soak(io, plan)?;
        self.ensure_homed(io)?;
        if self.settings.motion.clear_bed_mesh {
            io.toolhead.clear_bed_mesh()?;
        }

        let mut request = plan.request;
        if adaptive {
            if let Some(health) = &self.health {
                let suggested = health.suggest_sample_count(request.sample_count);
                if suggested != request.sample_count {
                    info!(
                        "Adaptive sampling: {} samples (configured {})",
                        suggested, request.sample_count
                    );
                }
                request.sample_count = suggested;
            }
        }

        let probe = io
            .probe
            .as_deref_mut()
            .ok_or(ZOffsetError::MissingCollaborator(Collaborator::Probe))?;
        plan.sampler
            .warmup(&mut *io.toolhead, &mut *probe, plan.position, plan.warmup_taps)?;
        let session = plan
            .sampler
            .sample(&mut *io.toolhead, probe, plan.position, &request)?;

        Ok(Acquired {
            session,
            soak,
            warmup_taps: plan.warmup_taps,
        })
    }

    /// Measure, compensate, validate and apply a Z offset.
    pub fn run(
        &mut self,
        io: &mut MachineIo<'_>,
        input: &EnvironmentInput,
        requested_profiles: &[String],
        overrides: &RunOverrides,
    ) -> Result<OffsetReport, ZOffsetError> {
        self.run_with(io, input, requested_profiles, overrides, None)
    }

    /// `run`, optionally reusing a reading taken during calibration.
    pub(crate) fn run_with(
        &mut self,
        io: &mut MachineIo<'_>,
        input: &EnvironmentInput,
        requested_profiles: &[String],
        overrides: &RunOverrides,
        reading: Option<SampleSession>,
    ) -> Result<OffsetReport, ZOffsetError> {
        if !io.has_probe() {
            return Err(ZOffsetError::MissingCollaborator(Collaborator::Probe));
        }
        self.require_store()?;
        if !self.state.calibrated {
            return Err(ZOffsetError::NotCalibrated);
        }

        let plan = self.plan(overrides)?;
        let acquired = match reading {
            Some(session) => Acquired {
                session,
                soak: None,
                warmup_taps: 0,
            },
            None => self.acquire(io, &plan, self.settings.adaptive_samples)?,
        };
        let session = acquired.session;

        let drift = session.reduced_height - self.state.reference_probe_height;
        if plan.max_drift > 0.0 && drift.abs() > plan.max_drift {
            return Err(ZOffsetError::DriftExceeded {
                drift,
                limit: plan.max_drift,
            });
        }

        let estimated_paper_height = session.reduced_height + self.state.paper_delta;
        let environment = self.resolve_environment(io.sensors, input);
        let adjustment =
            self.compute_adjustment(&environment, requested_profiles, plan.auto_match, plan.extra)?;
        if plan.max_adjust > 0.0 && adjustment.total.abs() > plan.max_adjust {
            return Err(ZOffsetError::AdjustmentCapExceeded {
                total: adjustment.total,
                cap: plan.max_adjust,
            });
        }

        let final_offset = estimated_paper_height + adjustment.total;
        check_envelope(final_offset, plan.safe_min, plan.safe_max)?;

        io.toolhead.apply_z_offset(final_offset, plan.move_speed)?;
        info!(
            "Applied Z offset {:.6} (probe {:.6}, drift {:.4}, adjustment {:.4})",
            final_offset, session.reduced_height, drift, adjustment.total
        );

        let applied_at = Utc::now();
        self.last_run = LastRun {
            probe_height: Some(session.reduced_height),
            spread: Some(session.spread),
            offset: Some(final_offset),
            drift: Some(drift),
            profiles: adjustment.profiles.clone(),
            applied_at: Some(applied_at),
        };
        let health_warnings = self.record_health(&session, drift, &environment);
        if plan.save {
            self.persist_last_run();
        }

        Ok(OffsetReport {
            probe_type: self.settings.probe_type,
            reference_xy: plan.position,
            session,
            drift,
            paper_delta: self.state.paper_delta,
            estimated_paper_height,
            adjustment_total: adjustment.total,
            final_offset,
            profiles: adjustment.profiles,
            breakdown: adjustment.breakdown,
            environment,
            warmup_taps: acquired.warmup_taps,
            thermal_soak: acquired.soak,
            health_warnings,
            confidence: self
                .health
                .as_ref()
                .map(|h| h.confidence())
                .filter(|(level, _)| *level != ConfidenceLevel::Unknown),
            applied_at,
        })
    }

    fn record_health(
        &mut self,
        session: &SampleSession,
        drift: f64,
        env: &EnvironmentSnapshot,
    ) -> Vec<String> {
        let Some(health) = self.health.as_mut() else {
            return Vec::new();
        };
        health.record_session(HealthRecord::new(
            session.reduced_height,
            session.spread,
            drift,
            session.sample_count,
            session.attempts_used,
            env.bed_temp,
            env.hotend_temp,
        ));
        if let Some(store) = self.store.as_deref_mut() {
            if let Err(e) = health.persist(store, &self.settings.storage.keys) {
                warn!("Failed to persist probe history: {}", e);
            }
        }
        let warnings = health.check_health();
        for warning in &warnings {
            warn!("Probe health: {}", warning);
        }
        warnings
    }

    fn persist_last_run(&mut self) {
        if let Some(store) = self.store.as_deref_mut() {
            if let Err(e) = self.last_run.persist(store, &self.settings.storage.keys) {
                warn!("Failed to persist last run: {}", e);
            }
        }
    }

    pub fn status(&self) -> StatusReport {
        let s = &self.settings;
        StatusReport {
            probe_type: s.probe_type,
            probe_description: s.preset.description,
            calibration: self.state.clone(),
            calibration_in_progress: self.calibration.in_progress(),
            reference_xy: self.reference_xy(&RunOverrides::default()),
            last_run: self.last_run.clone(),
            warmup_taps: s.sampling.warmup_taps,
            thermal_soak: s.soak.enabled,
            safe_offset_range: (s.safe_offset_min, s.safe_offset_max),
            profiles: s.profiles.names(),
            health: self.health.as_ref().and_then(|h| {
                let (level, score) = h.confidence();
                h.statistics().map(|stats| (stats, level, score))
            }),
        }
    }

    pub fn health_report(&self) -> HealthReport {
        let Some(health) = &self.health else {
            return HealthReport::Disabled;
        };
        let Some(stats) = health.statistics() else {
            return HealthReport::NoData;
        };
        let (level, score) = health.confidence();
        let configured = self.settings.sampling.samples;
        HealthReport::Tracked {
            probe_type: self.settings.probe_type,
            stats,
            level,
            score,
            suggested_samples: health.suggest_sample_count(configured),
            configured_samples: configured,
            warnings: health.check_health(),
        }
    }

    /// Forget calibration and last-run telemetry, optionally probe history
    /// too. Any in-flight calibration is abandoned.
    pub fn clear(&mut self, clear_history: bool) -> Result<(), ZOffsetError> {
        self.calibration.reset();
        self.state.calibrated = false;
        self.state.reference_probe_height = 0.0;
        self.state.paper_delta = 0.0;
        self.last_run = LastRun::default();

        let keys = &self.settings.storage.keys;
        if let Some(store) = self.store.as_deref_mut() {
            store.set(&keys.calibrated(), Value::Bool(false))?;
            for suffix in [
                "reference_probe_height",
                "paper_delta",
                "last_probe_height",
                "last_probe_spread",
                "last_offset",
                "last_drift",
            ] {
                store.set(&keys.key(suffix), height_value(0.0))?;
            }
            store.set(&keys.key("last_profiles"), Value::Array(Vec::new()))?;
            store.set(&keys.key("last_run_at"), Value::Null)?;
        }

        if clear_history {
            if let Some(health) = self.health.as_mut() {
                health.clear();
                if let Some(store) = self.store.as_deref_mut() {
                    health.persist(store, keys)?;
                }
            }
            info!("Calibration and probe history cleared");
        } else {
            info!("Calibration state cleared");
        }
        Ok(())
    }

    /// Diagnostic taps at the reference point; nothing is applied or
    /// recorded.
    pub fn probe_test(
        &self,
        io: &mut MachineIo<'_>,
        overrides: &RunOverrides,
    ) -> Result<ProbeTestReport, ZOffsetError> {
        if !io.has_probe() {
            return Err(ZOffsetError::MissingCollaborator(Collaborator::Probe));
        }
        let plan = self.plan(overrides)?;
        self.ensure_homed(io)?;
        if self.settings.motion.clear_bed_mesh {
            io.toolhead.clear_bed_mesh()?;
        }
        let probe = io
            .probe
            .as_deref_mut()
            .ok_or(ZOffsetError::MissingCollaborator(Collaborator::Probe))?;
        let report = plan.sampler.probe_test(
            &mut *io.toolhead,
            probe,
            plan.position,
            plan.request.sample_count,
            plan.warmup_taps,
        )?;
        Ok(report)
    }
}
