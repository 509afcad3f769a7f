//! # Simulated Printer
//!
//! In-memory implementations of the machine collaborators. They back the
//! command-line demo and every test that needs motion, probing or heaters
//! without hardware.
//!
//! The simulation is deliberately simple:
//!
//! - [`SimToolhead`] teleports to each commanded position and logs the move
//! - [`SimProbe`] triggers at `surface + noise[i]`, cycling through the noise
//!   table one entry per tap
//! - [`SimHeaters`] reports fixed readings or a linear ramp that flattens out
//! - [`SimClock`] advances only when something sleeps on it
//!
//! Clock and heaters share time through a reference-counted cell so a ramp
//! progresses as the thermal soak polls.

use crate::machine::{
    Clock, HeaterStatus, MachineError, Probe, ProbeParams, ProbePoint, Sensors, Toolhead,
};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

/// Descent speed used when the caller leaves it to the probe.
const DEFAULT_PROBE_SPEED: f64 = 5.0;

type Move = (Option<f64>, Option<f64>, Option<f64>);

/// Toolhead that records moves and applied offsets.
#[derive(Debug, Clone, Default)]
pub struct SimToolhead {
    position: [f64; 3],
    homed: bool,
    moves: Vec<Move>,
    homings: u32,
    mesh_clears: u32,
    offsets: Vec<(f64, Option<f64>)>,
    fail_apply: bool,
}

impl SimToolhead {
    /// Unhomed, parked at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn homed() -> Self {
        Self {
            homed: true,
            ..Self::default()
        }
    }

    /// Teleport without logging a move.
    pub fn set_position(&mut self, position: [f64; 3]) {
        self.position = position;
    }

    /// Make the next `apply_z_offset` fail.
    pub fn fail_next_apply(&mut self) {
        self.fail_apply = true;
    }

    pub fn moves(&self) -> Vec<Move> {
        self.moves.clone()
    }

    pub fn homings(&self) -> u32 {
        self.homings
    }

    pub fn mesh_clears(&self) -> u32 {
        self.mesh_clears
    }

    /// Every offset applied so far, with the requested move speed.
    pub fn applied_offsets(&self) -> &[(f64, Option<f64>)] {
        &self.offsets
    }

    pub fn current_offset(&self) -> Option<f64> {
        self.offsets.last().map(|(offset, _)| *offset)
    }
}

impl Toolhead for SimToolhead {
    fn move_to(
        &mut self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        speed: f64,
    ) -> Result<(), MachineError> {
        if !self.homed {
            return Err(MachineError::Move("must home axes first".into()));
        }
        if speed <= 0.0 {
            return Err(MachineError::Move(format!("invalid speed {}", speed)));
        }
        for (axis, target) in [x, y, z].into_iter().enumerate() {
            if let Some(value) = target {
                self.position[axis] = value;
            }
        }
        self.moves.push((x, y, z));
        Ok(())
    }

    fn position(&self) -> [f64; 3] {
        self.position
    }

    fn homed_axes(&self) -> String {
        if self.homed {
            "xyz".into()
        } else {
            String::new()
        }
    }

    fn home(&mut self) -> Result<(), MachineError> {
        self.homed = true;
        self.homings += 1;
        self.position = [0.0, 0.0, 0.0];
        Ok(())
    }

    fn clear_bed_mesh(&mut self) -> Result<(), MachineError> {
        self.mesh_clears += 1;
        Ok(())
    }

    fn apply_z_offset(&mut self, offset: f64, move_speed: Option<f64>) -> Result<(), MachineError> {
        if std::mem::take(&mut self.fail_apply) {
            return Err(MachineError::Offset("host rejected SET_GCODE_OFFSET".into()));
        }
        self.offsets.push((offset, move_speed));
        Ok(())
    }
}

/// Probe with a deterministic, cycling noise table.
#[derive(Debug, Clone)]
pub struct SimProbe {
    surface: f64,
    noise: Vec<f64>,
    taps: usize,
}

impl SimProbe {
    /// Noiseless probe triggering at `surface`.
    pub fn new(surface: f64) -> Self {
        Self::with_readings(surface, Vec::new())
    }

    pub fn with_readings(surface: f64, noise: Vec<f64>) -> Self {
        Self {
            surface,
            noise,
            taps: 0,
        }
    }

    /// Move the trigger height, e.g. to simulate thermal drift.
    pub fn set_surface(&mut self, surface: f64) {
        self.surface = surface;
    }

    pub fn taps(&self) -> usize {
        self.taps
    }
}

impl Probe for SimProbe {
    fn probe_once(
        &mut self,
        toolhead: &mut dyn Toolhead,
        params: &ProbeParams,
    ) -> Result<ProbePoint, MachineError> {
        let noise = match self.noise.len() {
            0 => 0.0,
            n => self.noise[self.taps % n],
        };
        self.taps += 1;
        let z = self.surface + noise;
        toolhead
            .move_to(None, None, Some(z), params.probe_speed.unwrap_or(DEFAULT_PROBE_SPEED))
            .map_err(|e| MachineError::Probe(e.to_string()))?;
        let [x, y, _] = toolhead.position();
        Ok(ProbePoint { x, y, z })
    }
}

/// Monotonic clock that only moves when slept on.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<Duration>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&mut self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy)]
enum Reading {
    Fixed(HeaterStatus),
    /// Rises at `rate` °C/min for `duration`, then holds
    Ramp {
        start: f64,
        rate: f64,
        duration: Duration,
    },
}

/// Named heaters and temperature sensors.
#[derive(Debug, Clone, Default)]
pub struct SimHeaters {
    readings: BTreeMap<String, Reading>,
    time: Option<Rc<Cell<Duration>>>,
}

impl SimHeaters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, temperature: f64, target: f64) {
        self.readings.insert(
            name.to_string(),
            Reading::Fixed(HeaterStatus {
                temperature: Some(temperature),
                target: Some(target),
            }),
        );
    }

    pub fn set_ramp(&mut self, name: &str, start: f64, rate_per_minute: f64, duration: Duration) {
        self.readings.insert(
            name.to_string(),
            Reading::Ramp {
                start,
                rate: rate_per_minute,
                duration,
            },
        );
    }

    /// Share time with `clock` so ramps progress as it advances.
    pub fn attach_clock(&mut self, clock: &SimClock) {
        self.time = Some(Rc::clone(&clock.now));
    }

    fn elapsed(&self) -> Duration {
        self.time.as_ref().map(|t| t.get()).unwrap_or_default()
    }
}

impl Sensors for SimHeaters {
    fn heater(&self, name: &str) -> Option<HeaterStatus> {
        match self.readings.get(name)? {
            Reading::Fixed(status) => Some(*status),
            Reading::Ramp {
                start,
                rate,
                duration,
            } => {
                let minutes = self.elapsed().min(*duration).as_secs_f64() / 60.0;
                Some(HeaterStatus {
                    temperature: Some(start + rate * minutes),
                    target: None,
                })
            }
        }
    }
}
