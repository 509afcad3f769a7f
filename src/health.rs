//! # Probe Health Tracking
//!
//! Keeps a rolling window of the last [`HISTORY_CAPACITY`] probe sessions and
//! derives repeatability statistics from it: averages, a degradation trend, a
//! confidence score and an adaptive sample count suggestion.
//!
//! ## Trend
//!
//! History is split by index into an older and a recent half. Recent average
//! spread above 1.3× the older average is *degrading*, below 0.7× is
//! *improving*. Fewer than ten sessions is *insufficient data*.
//!
//! ## Confidence
//!
//! Starts at 1.0 and loses points for a high average spread (0.2), frequent
//! retries (0.2), a degrading trend (0.3) and large drift (0.1).

use crate::store::{round_to, KeyValueStore, StoreError, VariableKeys};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

/// Sessions kept in the rolling window.
pub const HISTORY_CAPACITY: usize = 50;

/// A recent spread above this is worth a maintenance warning (mm).
pub const SPREAD_CEILING: f64 = 0.040;

/// One completed probe session, in its compact persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    #[serde(rename = "z")]
    pub height: f64,
    #[serde(rename = "s")]
    pub spread: f64,
    #[serde(rename = "d")]
    pub drift: f64,
    #[serde(rename = "n")]
    pub sample_count: u32,
    #[serde(rename = "r")]
    pub retries_used: u32,
    #[serde(rename = "bt", default, skip_serializing_if = "Option::is_none")]
    pub bed_temp: Option<f64>,
    #[serde(rename = "ht", default, skip_serializing_if = "Option::is_none")]
    pub hotend_temp: Option<f64>,
}

impl HealthRecord {
    /// Build a record with persisted precision applied.
    pub fn new(
        height: f64,
        spread: f64,
        drift: f64,
        sample_count: u32,
        retries_used: u32,
        bed_temp: Option<f64>,
        hotend_temp: Option<f64>,
    ) -> Self {
        Self {
            height: round_to(height, 6),
            spread: round_to(spread, 6),
            drift: round_to(drift, 6),
            sample_count,
            retries_used,
            bed_temp: bed_temp.map(|t| round_to(t, 1)),
            hotend_temp: hotend_temp.map(|t| round_to(t, 1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    InsufficientData,
    Stable,
    Degrading,
    Improving,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trend::InsufficientData => "insufficient_data",
            Trend::Stable => "stable",
            Trend::Degrading => "degrading",
            Trend::Improving => "improving",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Unknown,
    High,
    Medium,
    Low,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfidenceLevel::Unknown => "unknown",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
        };
        f.write_str(name)
    }
}

/// Aggregates over the whole window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthStats {
    pub count: usize,
    pub avg_spread: f64,
    pub max_spread: f64,
    pub min_spread: f64,
    pub avg_drift: f64,
    pub max_abs_drift: f64,
    pub avg_retries: f64,
    /// Fraction of sessions that needed at least one retry
    pub retry_rate: f64,
    pub trend: Trend,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn trend_of(spreads: &[f64]) -> Trend {
    if spreads.len() < 10 {
        return Trend::InsufficientData;
    }
    let half = spreads.len() / 2;
    let older = mean(&spreads[..half]);
    let recent = mean(&spreads[half..]);
    if older > 0.0 && recent > older * 1.3 {
        Trend::Degrading
    } else if older > 0.0 && recent < older * 0.7 {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Rolling probe history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeHealthTracker {
    history: VecDeque<HealthRecord>,
}

impl ProbeHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted history, keeping the newest entries. Unreadable
    /// history starts the window empty.
    pub fn load(store: &dyn KeyValueStore, keys: &VariableKeys) -> Self {
        let Some(value) = store.get(&keys.probe_history()) else {
            return Self::new();
        };
        match serde_json::from_value::<Vec<HealthRecord>>(value) {
            Ok(records) => {
                let skip = records.len().saturating_sub(HISTORY_CAPACITY);
                Self {
                    history: records.into_iter().skip(skip).collect(),
                }
            }
            Err(e) => {
                warn!("Ignoring unreadable probe history: {}", e);
                Self::new()
            }
        }
    }

    pub fn persist(
        &self,
        store: &mut dyn KeyValueStore,
        keys: &VariableKeys,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(&self.history)?;
        store.set(&keys.probe_history(), value)
    }

    /// Append a session, evicting the oldest beyond capacity.
    pub fn record_session(&mut self, record: HealthRecord) {
        self.history.push_back(record);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> &VecDeque<HealthRecord> {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn statistics(&self) -> Option<HealthStats> {
        if self.history.is_empty() {
            return None;
        }
        let spreads: Vec<f64> = self.history.iter().map(|h| h.spread).collect();
        let drifts: Vec<f64> = self.history.iter().map(|h| h.drift).collect();
        let retries: Vec<f64> = self.history.iter().map(|h| h.retries_used as f64).collect();
        let retried = self.history.iter().filter(|h| h.retries_used > 0).count();

        Some(HealthStats {
            count: self.history.len(),
            avg_spread: mean(&spreads),
            max_spread: spreads.iter().copied().fold(f64::MIN, f64::max),
            min_spread: spreads.iter().copied().fold(f64::MAX, f64::min),
            avg_drift: mean(&drifts),
            max_abs_drift: drifts.iter().map(|d| d.abs()).fold(0.0, f64::max),
            avg_retries: mean(&retries),
            retry_rate: retried as f64 / self.history.len() as f64,
            trend: trend_of(&spreads),
        })
    }

    /// `(Unknown, 0.0)` with no history.
    pub fn confidence(&self) -> (ConfidenceLevel, f64) {
        let Some(stats) = self.statistics() else {
            return (ConfidenceLevel::Unknown, 0.0);
        };
        let mut score: f64 = 1.0;
        if stats.avg_spread > 0.015 {
            score -= 0.2;
        }
        if stats.retry_rate > 0.3 {
            score -= 0.2;
        }
        if stats.trend == Trend::Degrading {
            score -= 0.3;
        }
        if stats.max_abs_drift > 0.5 {
            score -= 0.1;
        }
        let score = score.clamp(0.0, 1.0);
        let level = if score >= 0.8 {
            ConfidenceLevel::High
        } else if score >= 0.4 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        };
        (level, score)
    }

    /// Fewer taps for a proven probe, more for a shaky or unknown one.
    pub fn suggest_sample_count(&self, default: u32) -> u32 {
        let (_, score) = self.confidence();
        if score >= 0.9 && self.history.len() >= 20 {
            default.saturating_sub(2).max(3)
        } else if score < 0.4 {
            (default + 2).min(10)
        } else {
            default
        }
    }

    /// Operator-facing maintenance warnings.
    pub fn check_health(&self) -> Vec<String> {
        let Some(stats) = self.statistics() else {
            return Vec::new();
        };
        let mut warnings = Vec::new();
        if stats.trend == Trend::Degrading {
            warnings.push(
                "Probe spread is trending upward over recent sessions. Check probe mount and wiring."
                    .to_string(),
            );
        }
        if stats.retry_rate > 0.5 {
            warnings.push(
                "Over 50% of recent probe sessions required retries. Check probe repeatability."
                    .to_string(),
            );
        }
        let recent_max = self
            .history
            .iter()
            .rev()
            .take(5)
            .map(|h| h.spread)
            .fold(0.0, f64::max);
        if recent_max > SPREAD_CEILING {
            warnings.push(format!(
                "Recent probe spread exceeded {:.3}mm. Probe may need maintenance.",
                SPREAD_CEILING
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn record(spread: f64, retries: u32) -> HealthRecord {
        HealthRecord::new(2.0, spread, 0.01, 5, retries, None, None)
    }

    fn tracker(spreads: &[f64]) -> ProbeHealthTracker {
        let mut t = ProbeHealthTracker::new();
        for s in spreads {
            t.record_session(record(*s, 0));
        }
        t
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut t = ProbeHealthTracker::new();
        for i in 0..HISTORY_CAPACITY {
            t.record_session(HealthRecord::new(i as f64, 0.01, 0.0, 5, 0, None, None));
        }
        t.record_session(HealthRecord::new(99.0, 0.01, 0.0, 5, 0, None, None));
        assert_eq!(t.len(), HISTORY_CAPACITY);
        assert_eq!(t.history().front().unwrap().height, 1.0);
        assert_eq!(t.history().back().unwrap().height, 99.0);
    }

    #[test]
    fn trend_classification() {
        assert_eq!(tracker(&[0.01; 9]).statistics().unwrap().trend, Trend::InsufficientData);
        assert_eq!(tracker(&[0.01; 10]).statistics().unwrap().trend, Trend::Stable);

        let mut rising = vec![0.01; 5];
        rising.extend([0.02; 5]);
        assert_eq!(tracker(&rising).statistics().unwrap().trend, Trend::Degrading);

        let mut falling = vec![0.02; 5];
        falling.extend([0.01; 5]);
        assert_eq!(tracker(&falling).statistics().unwrap().trend, Trend::Improving);

        assert_eq!(tracker(&[0.0; 12]).statistics().unwrap().trend, Trend::Stable);
    }

    #[test]
    fn statistics_aggregate_window() {
        let mut t = ProbeHealthTracker::new();
        t.record_session(HealthRecord::new(2.0, 0.01, -0.6, 5, 0, None, None));
        t.record_session(HealthRecord::new(2.0, 0.03, 0.2, 5, 2, None, None));
        let stats = t.statistics().unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.avg_spread - 0.02).abs() < 1e-12);
        assert_eq!(stats.max_spread, 0.03);
        assert_eq!(stats.min_spread, 0.01);
        assert_eq!(stats.max_abs_drift, 0.6);
        assert_eq!(stats.retry_rate, 0.5);
        assert_eq!(stats.avg_retries, 1.0);
    }

    #[test]
    fn empty_history_is_unknown_and_asks_for_more_samples() {
        let t = ProbeHealthTracker::new();
        assert!(t.statistics().is_none());
        assert_eq!(t.confidence(), (ConfidenceLevel::Unknown, 0.0));
        assert_eq!(t.suggest_sample_count(5), 7);
        assert_eq!(t.suggest_sample_count(9), 10);
        assert!(t.check_health().is_empty());
    }

    #[test]
    fn proven_probe_gets_fewer_samples() {
        let t = tracker(&[0.005; 20]);
        assert_eq!(t.confidence(), (ConfidenceLevel::High, 1.0));
        assert_eq!(t.suggest_sample_count(5), 3);
        assert_eq!(t.suggest_sample_count(4), 3);
        assert_eq!(tracker(&[0.005; 19]).suggest_sample_count(5), 5);
    }

    #[test]
    fn shaky_probe_collects_penalties_and_warnings() {
        let mut t = ProbeHealthTracker::new();
        for _ in 0..5 {
            t.record_session(HealthRecord::new(2.0, 0.01, 0.0, 5, 1, None, None));
        }
        for _ in 0..5 {
            t.record_session(HealthRecord::new(2.0, 0.05, 0.7, 5, 1, None, None));
        }
        // spread, retries, degrading, drift
        let (level, score) = t.confidence();
        assert_eq!(level, ConfidenceLevel::Low);
        assert!((score - 0.2).abs() < 1e-9);
        assert_eq!(t.check_health().len(), 3);
    }

    #[test]
    fn history_persists_in_compact_form() {
        let keys = VariableKeys::new("auto_z_tap");
        let mut store = MemoryStore::new();
        let mut t = ProbeHealthTracker::new();
        t.record_session(HealthRecord::new(2.0000004, 0.0123, -0.01, 5, 1, Some(60.04), None));
        t.persist(&mut store, &keys).unwrap();

        assert_eq!(
            store.get("auto_z_tap_probe_history"),
            Some(json!([{"z": 2.0, "s": 0.0123, "d": -0.01, "n": 5, "r": 1, "bt": 60.0}]))
        );
        assert_eq!(ProbeHealthTracker::load(&store, &keys), t);
    }

    #[test]
    fn load_keeps_newest_and_tolerates_garbage() {
        let keys = VariableKeys::new("p");
        let mut store = MemoryStore::new();
        let records: Vec<_> = (0..60)
            .map(|i| json!({"z": i as f64, "s": 0.01, "d": 0.0, "n": 5, "r": 0}))
            .collect();
        store.set("p_probe_history", json!(records)).unwrap();
        let t = ProbeHealthTracker::load(&store, &keys);
        assert_eq!(t.len(), HISTORY_CAPACITY);
        assert_eq!(t.history().front().unwrap().height, 10.0);

        store.set("p_probe_history", json!("not a list")).unwrap();
        assert!(ProbeHealthTracker::load(&store, &keys).is_empty());
    }
}
