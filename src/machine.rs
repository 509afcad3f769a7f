//! # Machine Collaborators
//!
//! The offset engine never drives hardware directly. Everything it needs from
//! the printer host is expressed as a small trait here:
//!
//! - [`Toolhead`]: moves, position, homing state, applying the Z offset
//! - [`Probe`]: a single probe tap returning the trigger point
//! - [`Sensors`]: heater / temperature sensor status
//! - [`Clock`]: monotonic time and blocking sleep (thermal soak polling)
//!
//! [`MachineIo`] bundles borrowed collaborators for the duration of one flow.
//! The probe is optional so a host without one gets a clean
//! `MissingCollaborator` error instead of a panic.

use std::time::{Duration, Instant};
use thiserror::Error;

/// Failures reported by the printer host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MachineError {
    #[error("move failed: {0}")]
    Move(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("homing failed: {0}")]
    Homing(String),

    #[error("offset application failed: {0}")]
    Offset(String),
}

/// A point where the probe triggered, in bed coordinates (mm).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbePoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Parameters for one probe tap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeParams {
    /// Descent speed; `None` lets the probe use its own configured speed.
    pub probe_speed: Option<f64>,
    /// Speed used for retract moves between taps.
    pub lift_speed: f64,
    /// Distance to retract between consecutive taps.
    pub retract_dist: f64,
}

/// Current state of a heater or temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeaterStatus {
    pub temperature: Option<f64>,
    pub target: Option<f64>,
}

impl HeaterStatus {
    /// Temperature used for compensation: a positive setpoint wins over the
    /// instantaneous reading, since the machine is heading there.
    pub fn effective(&self) -> Option<f64> {
        match self.target {
            Some(target) if target > 0.0 => Some(target),
            _ => self.temperature,
        }
    }
}

/// Motion and offset contract.
pub trait Toolhead {
    /// Move any subset of axes; `None` leaves that axis where it is.
    fn move_to(
        &mut self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        speed: f64,
    ) -> Result<(), MachineError>;

    /// Current commanded position `[x, y, z]`.
    fn position(&self) -> [f64; 3];

    /// Lowercase axis letters that are homed, e.g. `"xyz"`.
    fn homed_axes(&self) -> String;

    fn home(&mut self) -> Result<(), MachineError>;

    /// Drop any active bed mesh before probing the reference point.
    fn clear_bed_mesh(&mut self) -> Result<(), MachineError> {
        Ok(())
    }

    /// Commit the computed Z offset. `move_speed` asks the host to move the
    /// nozzle immediately by the change in offset.
    fn apply_z_offset(&mut self, offset: f64, move_speed: Option<f64>) -> Result<(), MachineError>;
}

/// Raw probing contract. Trigger detection lives entirely on the host side.
pub trait Probe {
    fn probe_once(
        &mut self,
        toolhead: &mut dyn Toolhead,
        params: &ProbeParams,
    ) -> Result<ProbePoint, MachineError>;
}

/// Temperature acquisition contract. `None` means the sensor is unknown or
/// unreadable; callers treat that as "no reading", never as an error.
pub trait Sensors {
    fn heater(&self, name: &str) -> Option<HeaterStatus>;
}

/// Monotonic time source used by polling loops.
pub trait Clock {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and a real thread sleep.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Collaborators borrowed for one engine or calibration flow.
pub struct MachineIo<'a> {
    pub toolhead: &'a mut dyn Toolhead,
    pub probe: Option<&'a mut dyn Probe>,
    pub sensors: &'a dyn Sensors,
    pub clock: &'a mut dyn Clock,
}

impl MachineIo<'_> {
    pub fn has_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn all_homed(&self) -> bool {
        let homed = self.toolhead.homed_axes().to_lowercase();
        ['x', 'y', 'z'].iter().all(|axis| homed.contains(*axis))
    }
}
