//! # Interactive Paper Calibration
//!
//! Calibration runs once per machine (or after hardware changes). It measures
//! the probe trigger height at the reference point, hands the nozzle to the
//! operator for a paper-drag test, and stores the difference as the
//! *paper delta*. Every later run re-probes and adds that delta back.
//!
//! ## Two Phases
//!
//! ```text
//! Idle ──begin_calibration──▶ InProgress ──complete(Accepted)──▶ Committed
//!                                  │
//!                                  └──────complete(Cancelled)──▶ Aborted
//! ```
//!
//! [`OffsetEngine::begin_calibration`] returns a [`PendingCalibration`]
//! carrying the probe reading and a ticket. While it is outstanding a second
//! `begin` fails. [`OffsetEngine::complete_calibration`] consumes it; a
//! pending value whose ticket no longer matches (cancelled, cleared or
//! already completed) is rejected.
//!
//! The operator's jogging happens through a [`PaperTest`] between the two
//! calls.

use crate::compensation::References;
use crate::engine::{OffsetEngine, OffsetReport, RunOverrides};
use crate::error::{Collaborator, ZOffsetError};
use crate::machine::{MachineError, MachineIo, Toolhead};
use crate::sampler::SampleSession;
use crate::store::{
    height_value, temperature_value, value_as_bool, value_as_f64, KeyValueStore, StoreError,
    VariableKeys,
};
use crate::EnvironmentInput;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// Durable result of the last committed calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationState {
    pub calibrated: bool,
    pub reference_probe_height: f64,
    pub paper_delta: f64,
    pub reference_xy: Option<(f64, f64)>,
    /// Bed, hotend and chamber temperatures at calibration time
    pub reference_env: References,
    pub probe_type: Option<String>,
}

fn optional_temperature(value: Option<f64>) -> Value {
    value.map(temperature_value).unwrap_or(Value::Null)
}

impl CalibrationState {
    /// Read state from the store. Missing keys fall back to "not
    /// calibrated" values.
    pub fn load(store: &dyn KeyValueStore, keys: &VariableKeys) -> Self {
        let number = |suffix: &str| store.get(&keys.key(suffix)).as_ref().and_then(value_as_f64);
        let reference_xy = match (number("reference_x"), number("reference_y")) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        };
        Self {
            calibrated: store
                .get(&keys.calibrated())
                .as_ref()
                .is_some_and(value_as_bool),
            reference_probe_height: number("reference_probe_height").unwrap_or(0.0),
            paper_delta: number("paper_delta").unwrap_or(0.0),
            reference_xy,
            reference_env: References {
                bed_temp: number("cal_bed_temp"),
                hotend_temp: number("cal_hotend_temp"),
                chamber_temp: number("cal_chamber_temp"),
                first_layer: None,
            },
            probe_type: store
                .get(&keys.key("cal_probe_type"))
                .and_then(|v| v.as_str().map(str::to_string)),
        }
    }

    /// Write every calibration key. Absent temperatures are written as null
    /// so a previous calibration's references cannot leak through.
    pub fn persist(
        &self,
        store: &mut dyn KeyValueStore,
        keys: &VariableKeys,
    ) -> Result<(), StoreError> {
        store.set(&keys.calibrated(), Value::Bool(self.calibrated))?;
        store.set(
            &keys.reference_probe_height(),
            height_value(self.reference_probe_height),
        )?;
        store.set(&keys.paper_delta(), height_value(self.paper_delta))?;
        if let Some((x, y)) = self.reference_xy {
            store.set(&keys.reference_x(), height_value(x))?;
            store.set(&keys.reference_y(), height_value(y))?;
        }
        store.set(
            &keys.key("cal_bed_temp"),
            optional_temperature(self.reference_env.bed_temp),
        )?;
        store.set(
            &keys.key("cal_hotend_temp"),
            optional_temperature(self.reference_env.hotend_temp),
        )?;
        store.set(
            &keys.key("cal_chamber_temp"),
            optional_temperature(self.reference_env.chamber_temp),
        )?;
        let probe_type = self
            .probe_type
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null);
        store.set(&keys.key("cal_probe_type"), probe_type)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    InProgress { ticket: u64 },
    Committed,
    Aborted,
}

/// Guards the at-most-one-in-flight rule.
#[derive(Debug, Clone)]
pub struct CalibrationStateMachine {
    phase: CalibrationPhase,
    next_ticket: u64,
}

impl Default for CalibrationStateMachine {
    fn default() -> Self {
        Self {
            phase: CalibrationPhase::Idle,
            next_ticket: 1,
        }
    }
}

impl CalibrationStateMachine {
    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.phase, CalibrationPhase::InProgress { .. })
    }

    /// Move to `InProgress` and hand out a fresh ticket.
    pub fn start(&mut self) -> Result<u64, ZOffsetError> {
        if self.in_progress() {
            return Err(ZOffsetError::CalibrationAlreadyInProgress);
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.phase = CalibrationPhase::InProgress { ticket };
        Ok(ticket)
    }

    /// Close the in-flight calibration identified by `ticket`.
    pub fn finish(&mut self, ticket: u64, committed: bool) -> Result<(), ZOffsetError> {
        match self.phase {
            CalibrationPhase::InProgress { ticket: current } if current == ticket => {
                self.phase = if committed {
                    CalibrationPhase::Committed
                } else {
                    CalibrationPhase::Aborted
                };
                Ok(())
            }
            _ => Err(ZOffsetError::NoCalibrationInProgress),
        }
    }

    /// Forget any in-flight calibration; outstanding tickets go stale.
    pub fn reset(&mut self) {
        self.phase = CalibrationPhase::Idle;
    }
}

/// Everything captured by `begin_calibration`, waiting for the paper test.
#[derive(Debug, Clone)]
pub struct PendingCalibration {
    ticket: u64,
    pub reference_xy: (f64, f64),
    pub session: SampleSession,
    pub reference_env: References,
    /// Inputs replayed by the follow-up offset run
    pub input: EnvironmentInput,
    pub profiles: Vec<String>,
    pub overrides: RunOverrides,
}

impl PendingCalibration {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

/// One manual jog request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jog {
    Relative(f64),
    Absolute(f64),
}

/// How the paper test ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JogOutcome {
    Accepted(f64),
    Cancelled,
}

/// Manual jog session for the paper test. Starts at the current Z.
pub struct PaperTest<'t> {
    toolhead: &'t mut dyn Toolhead,
    speed: f64,
    z: f64,
}

impl<'t> PaperTest<'t> {
    pub fn new(toolhead: &'t mut dyn Toolhead, speed: f64) -> Self {
        let z = toolhead.position()[2];
        Self { toolhead, speed, z }
    }

    pub fn current_z(&self) -> f64 {
        self.z
    }

    /// Move the nozzle and return the new height.
    pub fn jog(&mut self, request: Jog) -> Result<f64, MachineError> {
        let target = match request {
            Jog::Relative(dz) => self.z + dz,
            Jog::Absolute(z) => z,
        };
        self.toolhead.move_to(None, None, Some(target), self.speed)?;
        self.z = target;
        Ok(target)
    }

    pub fn accept(self) -> JogOutcome {
        JogOutcome::Accepted(self.z)
    }

    pub fn cancel(self) -> JogOutcome {
        JogOutcome::Cancelled
    }
}

/// Advisory re-probe after committing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Validation {
    Measured {
        drift: f64,
        spread: f64,
        /// `|drift|` above three times the spread limit
        significant: bool,
    },
    Failed(String),
}

/// Result of a committed calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub probe_type: String,
    pub reference_probe_height: f64,
    pub paper_height: f64,
    pub paper_delta: f64,
    pub validation: Option<Validation>,
    pub offset: OffsetReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Aborted,
    Committed(Box<CalibrationReport>),
}

impl OffsetEngine {
    /// Phase one: probe the reference point and park the nozzle for the
    /// paper test.
    pub fn begin_calibration(
        &mut self,
        io: &mut MachineIo<'_>,
        input: &EnvironmentInput,
        profiles: &[String],
        overrides: &RunOverrides,
    ) -> Result<PendingCalibration, ZOffsetError> {
        if !io.has_probe() {
            return Err(ZOffsetError::MissingCollaborator(Collaborator::Probe));
        }
        self.require_store()?;
        if self.calibration.in_progress() {
            return Err(ZOffsetError::CalibrationAlreadyInProgress);
        }

        let plan = self.plan(overrides)?;
        let acquired = self.acquire(io, &plan, false)?;
        let session = acquired.session;

        let current_z = io.toolhead.position()[2];
        let hop = current_z
            .max(session.reduced_height + self.settings.motion.calibration_z_hop)
            .max(self.settings.motion.safe_z);
        io.toolhead
            .move_to(None, None, Some(hop), plan.sampler.params.lift_speed)?;
        io.toolhead.move_to(
            Some(session.x),
            Some(session.y),
            None,
            self.settings.motion.travel_speed,
        )?;

        let env = self.resolve_environment(io.sensors, input);
        let ticket = self.calibration.start()?;
        info!(
            "Calibration started at X{:.3} Y{:.3} (probe_type={}). Place paper under the nozzle, jog until it drags, then accept",
            plan.position.0, plan.position.1, self.settings.probe_type
        );

        Ok(PendingCalibration {
            ticket,
            reference_xy: plan.position,
            session,
            reference_env: References {
                bed_temp: env.bed_temp,
                hotend_temp: env.hotend_temp,
                chamber_temp: env.chamber_temp,
                first_layer: None,
            },
            input: input.clone(),
            profiles: profiles.to_vec(),
            overrides: overrides.clone(),
        })
    }

    /// Phase two: commit or discard. On accept the delta is persisted and an
    /// offset run is applied from the same probe reading.
    pub fn complete_calibration(
        &mut self,
        io: &mut MachineIo<'_>,
        pending: PendingCalibration,
        outcome: JogOutcome,
    ) -> Result<CalibrationOutcome, ZOffsetError> {
        let paper_height = match outcome {
            JogOutcome::Cancelled => {
                self.calibration.finish(pending.ticket, false)?;
                info!("Calibration aborted");
                return Ok(CalibrationOutcome::Aborted);
            }
            JogOutcome::Accepted(z) => z,
        };
        self.calibration.finish(pending.ticket, true)?;

        let reference_probe_height = pending.session.reduced_height;
        self.state = CalibrationState {
            calibrated: true,
            reference_probe_height,
            paper_delta: paper_height - reference_probe_height,
            reference_xy: Some(pending.reference_xy),
            reference_env: pending.reference_env,
            probe_type: Some(self.settings.probe_type.name().to_string()),
        };
        if let Some(store) = self.store.as_deref_mut() {
            self.state.persist(store, &self.settings.storage.keys)?;
        }
        info!(
            "Calibration committed: reference={:.6} paper={:.6} delta={:.6}",
            reference_probe_height, paper_height, self.state.paper_delta
        );

        let offset = self.run_with(
            io,
            &pending.input,
            &pending.profiles,
            &pending.overrides,
            Some(pending.session),
        )?;

        let validation = if self.settings.calibration_validate {
            Some(self.validate_calibration(io, &pending.overrides))
        } else {
            None
        };

        Ok(CalibrationOutcome::Committed(Box::new(CalibrationReport {
            probe_type: self.settings.probe_type.name().to_string(),
            reference_probe_height,
            paper_height,
            paper_delta: self.state.paper_delta,
            validation,
            offset,
        })))
    }

    fn validate_calibration(
        &mut self,
        io: &mut MachineIo<'_>,
        overrides: &RunOverrides,
    ) -> Validation {
        info!("Validating calibration with a fresh probe");
        let result = self.plan(overrides).and_then(|plan| {
            let probe = io
                .probe
                .as_deref_mut()
                .ok_or(ZOffsetError::MissingCollaborator(Collaborator::Probe))?;
            let session = plan
                .sampler
                .sample(&mut *io.toolhead, probe, plan.position, &plan.request)?;
            Ok(session)
        });
        let limit = self.settings.sampling.max_spread;
        match result {
            Ok(session) => {
                let drift = session.reduced_height - self.state.reference_probe_height;
                Validation::Measured {
                    drift,
                    spread: session.spread,
                    significant: drift.abs() > limit * 3.0,
                }
            }
            Err(e) => Validation::Failed(e.to_string()),
        }
    }
}
