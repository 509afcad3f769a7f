//! # Guarded Probe Sampling
//!
//! Turns noisy single taps into one trusted height. Each attempt parks the
//! nozzle over the reference point, takes `N` taps (retracting between them),
//! and accepts the attempt only when the spread stays under the limit.
//!
//! ## Motion Envelope
//!
//! Every approach goes through [`GuardedSampler::move_to_reference`]:
//! 1. Raise to the safe travel height if below it
//! 2. Travel in XY
//! 3. Raise to the probe start height if still below it
//!
//! Failed attempts raise back to travel height before retrying so a probe
//! never drags across the bed.
//!
//! ## Reduction
//!
//! Median picks `sorted[len / 2]` by Z. For even counts that is the upper of
//! the two middle readings, not their mean; historical calibrations were taken
//! that way and must keep reproducing.

use crate::error::ZOffsetError;
use crate::machine::{MachineError, Probe, ProbeParams, ProbePoint, Toolhead};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// How a batch of taps collapses into one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Average,
    Median,
}

impl Reduction {
    pub fn name(self) -> &'static str {
        match self {
            Reduction::Average => "average",
            Reduction::Median => "median",
        }
    }

    /// Reduce a non-empty batch. Returns `None` for an empty slice.
    pub fn reduce(self, points: &[ProbePoint]) -> Option<ProbePoint> {
        if points.is_empty() {
            return None;
        }
        match self {
            Reduction::Average => {
                let n = points.len() as f64;
                let (sx, sy, sz) = points
                    .iter()
                    .fold((0.0, 0.0, 0.0), |(x, y, z), p| (x + p.x, y + p.y, z + p.z));
                Some(ProbePoint {
                    x: sx / n,
                    y: sy / n,
                    z: sz / n,
                })
            }
            Reduction::Median => {
                let mut sorted = points.to_vec();
                sorted.sort_by(|a, b| a.z.total_cmp(&b.z));
                Some(sorted[sorted.len() / 2])
            }
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Reduction {
    type Err = ZOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match crate::normalize_token(s).as_str() {
            "average" => Ok(Reduction::Average),
            "median" => Ok(Reduction::Median),
            other => Err(ZOffsetError::InvalidConfig(format!(
                "samples_result must be average or median, got '{}'",
                other
            ))),
        }
    }
}

/// `max - min` of the Z values; zero for an empty batch.
pub fn spread_of(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    if values.is_empty() {
        0.0
    } else {
        max - min
    }
}

/// What one guarded sample should look like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRequest {
    pub sample_count: u32,
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// `<= 0` disables the spread check
    pub spread_limit: f64,
    pub reduction: Reduction,
}

/// Result of one successful guarded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleSession {
    pub reduced_height: f64,
    pub spread: f64,
    /// Zero-based index of the attempt that passed; also the retries used
    pub attempts_used: u32,
    pub sample_count: u32,
    pub x: f64,
    pub y: f64,
}

/// Repeatability rating for a probe test, by spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeRating {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl ProbeRating {
    pub fn from_spread(spread: f64) -> Self {
        if spread <= 0.005 {
            ProbeRating::Excellent
        } else if spread <= 0.015 {
            ProbeRating::Good
        } else if spread <= 0.030 {
            ProbeRating::Acceptable
        } else {
            ProbeRating::Poor
        }
    }
}

impl fmt::Display for ProbeRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeRating::Excellent => "EXCELLENT",
            ProbeRating::Good => "GOOD",
            ProbeRating::Acceptable => "ACCEPTABLE",
            ProbeRating::Poor => "POOR",
        };
        f.write_str(name)
    }
}

/// Diagnostic probe run. Nothing is applied or recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeTestReport {
    pub values: Vec<f64>,
    pub median: f64,
    pub average: f64,
    pub spread: f64,
    /// Population standard deviation
    pub stdev: f64,
    pub rating: ProbeRating,
    pub warmup_taps: u32,
}

impl ProbeTestReport {
    fn from_values(values: Vec<f64>, warmup_taps: u32) -> Self {
        let n = values.len().max(1) as f64;
        let mut sorted = values.clone();
        sorted.sort_by(f64::total_cmp);
        let average = values.iter().sum::<f64>() / n;
        let median = sorted.get(sorted.len() / 2).copied().unwrap_or(0.0);
        let spread = spread_of(&values);
        let variance = values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n;
        Self {
            median,
            average,
            spread,
            stdev: variance.sqrt(),
            rating: ProbeRating::from_spread(spread),
            warmup_taps,
            values,
        }
    }
}

/// Motion and probing parameters for one flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardedSampler {
    pub safe_z: f64,
    pub probe_start_z: f64,
    pub travel_speed: f64,
    pub params: ProbeParams,
}

impl GuardedSampler {
    /// Raise to travel height if the nozzle sits below it.
    pub fn raise_for_travel(&self, toolhead: &mut dyn Toolhead) -> Result<(), MachineError> {
        if toolhead.position()[2] < self.safe_z {
            toolhead.move_to(None, None, Some(self.safe_z), self.params.lift_speed)?;
        }
        Ok(())
    }

    /// Park over `(x, y)` at probe start height without dragging across the bed.
    pub fn move_to_reference(
        &self,
        toolhead: &mut dyn Toolhead,
        x: f64,
        y: f64,
    ) -> Result<(), MachineError> {
        self.raise_for_travel(toolhead)?;
        toolhead.move_to(Some(x), Some(y), None, self.travel_speed)?;
        if toolhead.position()[2] < self.probe_start_z {
            toolhead.move_to(None, None, Some(self.probe_start_z), self.params.lift_speed)?;
        }
        Ok(())
    }

    fn retract(&self, toolhead: &mut dyn Toolhead) -> Result<(), MachineError> {
        let z = toolhead.position()[2] + self.params.retract_dist;
        toolhead.move_to(None, None, Some(z), self.params.lift_speed)
    }

    /// `count` taps from the current position, retracting between them.
    fn tap_series(
        &self,
        toolhead: &mut dyn Toolhead,
        probe: &mut dyn Probe,
        count: u32,
    ) -> Result<Vec<ProbePoint>, MachineError> {
        let mut points = Vec::with_capacity(count as usize);
        for idx in 0..count {
            points.push(probe.probe_once(toolhead, &self.params)?);
            if idx + 1 < count {
                self.retract(toolhead)?;
            }
        }
        Ok(points)
    }

    /// Throw-away taps to settle the probe mechanism.
    pub fn warmup(
        &self,
        toolhead: &mut dyn Toolhead,
        probe: &mut dyn Probe,
        position: (f64, f64),
        count: u32,
    ) -> Result<(), MachineError> {
        if count == 0 {
            return Ok(());
        }
        info!("Performing {} warm-up tap(s)", count);
        self.move_to_reference(toolhead, position.0, position.1)?;
        for _ in 0..count {
            probe.probe_once(toolhead, &self.params)?;
            self.retract(toolhead)?;
        }
        self.raise_for_travel(toolhead)?;
        debug!("Warm-up complete");
        Ok(())
    }

    /// Guarded sample: retry until the spread is acceptable or the retry
    /// budget is spent.
    pub fn sample(
        &self,
        toolhead: &mut dyn Toolhead,
        probe: &mut dyn Probe,
        position: (f64, f64),
        request: &SampleRequest,
    ) -> Result<SampleSession, ZOffsetError> {
        let sample_count = request.sample_count.max(1);
        let mut last_spread = 0.0;

        for attempt in 0..=request.max_attempts {
            self.move_to_reference(toolhead, position.0, position.1)?;
            let points = self.tap_series(toolhead, probe, sample_count)?;
            let heights: Vec<f64> = points.iter().map(|p| p.z).collect();
            let spread = spread_of(&heights);
            last_spread = spread;

            if request.spread_limit <= 0.0 || spread <= request.spread_limit {
                let Some(reduced) = request.reduction.reduce(&points) else {
                    break;
                };
                debug!(
                    "Probe sample accepted: z={:.6} spread={:.4} attempt={}",
                    reduced.z, spread, attempt
                );
                return Ok(SampleSession {
                    reduced_height: reduced.z,
                    spread,
                    attempts_used: attempt,
                    sample_count,
                    x: reduced.x,
                    y: reduced.y,
                });
            }

            info!(
                "Probe spread {:.4}mm > limit {:.4}mm (retry {}/{})",
                spread,
                request.spread_limit,
                attempt + 1,
                request.max_attempts
            );
            self.raise_for_travel(toolhead)?;
        }

        Err(ZOffsetError::RepeatabilityExceeded {
            spread: last_spread,
            limit: request.spread_limit,
            retries: request.max_attempts,
        })
    }

    /// Diagnostic run: optional warm-up, then `count` taps and statistics.
    pub fn probe_test(
        &self,
        toolhead: &mut dyn Toolhead,
        probe: &mut dyn Probe,
        position: (f64, f64),
        count: u32,
        warmup_taps: u32,
    ) -> Result<ProbeTestReport, MachineError> {
        self.warmup(toolhead, probe, position, warmup_taps)?;
        self.move_to_reference(toolhead, position.0, position.1)?;
        let points = self.tap_series(toolhead, probe, count.max(1))?;
        self.raise_for_travel(toolhead)?;
        let values = points.iter().map(|p| p.z).collect();
        Ok(ProbeTestReport::from_values(values, warmup_taps))
    }
}
