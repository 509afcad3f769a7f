//! # Thermal Soak
//!
//! Tap-style and inductive probes shift their trigger point as the bed and
//! gantry expand. [`ThermalStabilityWaiter`] blocks until every readable
//! sensor changes slower than a threshold (°C per minute), or gives up after
//! a timeout.
//!
//! Timing out is a soft failure: the waiter reports it and the caller decides
//! whether the run may proceed.

use crate::machine::{Clock, Sensors};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Progress is logged at most this often.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Rates are only computed across intervals longer than this (minutes).
const MIN_RATE_MINUTES: f64 = 0.01;

/// How a soak ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SoakOutcome {
    /// Nothing readable; soak skipped
    NoSensors,
    Stable { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl SoakOutcome {
    pub fn stable(&self) -> bool {
        !matches!(self, SoakOutcome::TimedOut { .. })
    }
}

/// Polls temperature sensors until they settle.
pub struct ThermalStabilityWaiter<'a> {
    sensors: &'a dyn Sensors,
    clock: &'a mut dyn Clock,
}

impl<'a> ThermalStabilityWaiter<'a> {
    pub fn new(sensors: &'a dyn Sensors, clock: &'a mut dyn Clock) -> Self {
        Self { sensors, clock }
    }

    fn read(&self, name: &str) -> Option<f64> {
        self.sensors.heater(name).and_then(|status| status.temperature)
    }

    pub fn wait(
        &mut self,
        sensor_names: &[String],
        threshold_per_minute: f64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> SoakOutcome {
        let start = self.clock.now();
        let mut prev_time = start;
        let mut last_report = start;

        let mut previous: BTreeMap<String, f64> = sensor_names
            .iter()
            .filter_map(|name| self.read(name).map(|t| (name.clone(), t)))
            .collect();
        if previous.is_empty() {
            info!("No readable sensors for thermal soak, skipping");
            return SoakOutcome::NoSensors;
        }

        info!(
            "Waiting for thermal stability (threshold {:.2}C/min, timeout {:.0}s)",
            threshold_per_minute,
            timeout.as_secs_f64()
        );

        loop {
            self.clock.sleep(poll_interval);
            let now = self.clock.now();
            let elapsed = now.saturating_sub(start);
            if elapsed > timeout {
                return SoakOutcome::TimedOut { elapsed };
            }

            let minutes = now.saturating_sub(prev_time).as_secs_f64() / 60.0;
            let mut current = BTreeMap::new();
            let mut rates = BTreeMap::new();
            for (name, prev) in &previous {
                let Some(temp) = self.read(name) else {
                    continue;
                };
                let rate = if minutes > MIN_RATE_MINUTES {
                    (temp - prev).abs() / minutes
                } else {
                    0.0
                };
                current.insert(name.clone(), temp);
                rates.insert(name.clone(), rate);
            }
            let all_stable = rates.values().all(|rate| *rate <= threshold_per_minute);

            if now.saturating_sub(last_report) >= REPORT_INTERVAL {
                let parts: Vec<String> = current
                    .iter()
                    .map(|(name, temp)| {
                        format!("{}: {:.1}C ({:.2}C/min)", name, temp, rates[name])
                    })
                    .collect();
                info!(
                    "Thermal soak {:.0}s/{:.0}s - {}",
                    elapsed.as_secs_f64(),
                    timeout.as_secs_f64(),
                    parts.join(", ")
                );
                last_report = now;
            }

            if all_stable && elapsed >= poll_interval * 2 {
                info!(
                    "Thermal stability reached after {:.0}s",
                    elapsed.as_secs_f64()
                );
                return SoakOutcome::Stable { elapsed };
            }

            previous = current;
            prev_time = now;
        }
    }
}
