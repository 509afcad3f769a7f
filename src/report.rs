//! # Operator Reports
//!
//! Plain-text summaries for the terminal. Each function renders one result
//! type into indented `key=value` lines, headed by the command that produced
//! it, so the output can be pasted into a bug report as-is.

use crate::calibration::{CalibrationReport, Validation};
use crate::engine::{HealthReport, OffsetReport, StatusReport};
use crate::sampler::ProbeTestReport;
use crate::thermal::SoakOutcome;
use std::fmt::Write;

fn optional(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "none".to_string(),
    }
}

/// Summary of an applied offset. `breakdown` adds one line per
/// compensation entry.
pub fn render_offset(report: &OffsetReport, breakdown: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "auto-z-tap applied (probe_type={}):", report.probe_type);
    let _ = writeln!(
        out,
        "  reference_xy={:.3},{:.3}",
        report.reference_xy.0, report.reference_xy.1
    );
    let _ = writeln!(
        out,
        "  probe_z={:.6} spread={:.4} drift={:.4}",
        report.session.reduced_height, report.session.spread, report.drift
    );
    let _ = writeln!(
        out,
        "  paper_delta={:.6} estimated_paper_z={:.6}",
        report.paper_delta, report.estimated_paper_height
    );
    let _ = writeln!(
        out,
        "  adjustment_total={:.4} final_offset={:.6}",
        report.adjustment_total, report.final_offset
    );
    if report.warmup_taps > 0 {
        let _ = writeln!(out, "  warmup_taps={}", report.warmup_taps);
    }
    match report.thermal_soak {
        Some(SoakOutcome::Stable { elapsed }) => {
            let _ = writeln!(out, "  thermal_soak=stable ({:.0}s)", elapsed.as_secs_f64());
        }
        Some(SoakOutcome::TimedOut { elapsed }) => {
            let _ = writeln!(out, "  thermal_soak=timed out ({:.0}s)", elapsed.as_secs_f64());
        }
        Some(SoakOutcome::NoSensors) | None => {}
    }
    if !report.profiles.is_empty() {
        let _ = writeln!(out, "  profiles={}", report.profiles.join(","));
    }

    if breakdown && !report.breakdown.is_empty() {
        out.push_str("  breakdown:\n");
        for entry in &report.breakdown {
            if entry.note.is_empty() {
                let _ = writeln!(out, "    - {}: {:.6}", entry.label, entry.value);
            } else {
                let _ = writeln!(
                    out,
                    "    - {}: {:.6} ({})",
                    entry.label, entry.value, entry.note
                );
            }
        }
    }

    if let Some((level, score)) = report.confidence {
        let _ = writeln!(out, "  probe_confidence={} ({:.2})", level, score);
    }
    for warning in &report.health_warnings {
        let _ = writeln!(out, "  WARNING: {}", warning);
    }
    out
}

pub fn render_calibration(report: &CalibrationReport, breakdown: bool) -> String {
    let mut out = String::from("auto-z-tap calibration complete:\n");
    let _ = writeln!(out, "  probe_type={}", report.probe_type);
    let _ = writeln!(out, "  reference_probe_z={:.6}", report.reference_probe_height);
    let _ = writeln!(out, "  paper_z={:.6}", report.paper_height);
    let _ = writeln!(out, "  stored_paper_delta={:.6}", report.paper_delta);
    match &report.validation {
        Some(Validation::Measured {
            drift,
            spread,
            significant,
        }) => {
            let _ = writeln!(out, "  validation: drift={:.4}mm spread={:.4}mm", drift, spread);
            if *significant {
                out.push_str(
                    "  WARNING: validation shows significant drift. Consider re-running calibration\n",
                );
            }
        }
        Some(Validation::Failed(reason)) => {
            let _ = writeln!(out, "  validation: FAILED ({})", reason);
        }
        None => {}
    }
    out.push_str(&render_offset(&report.offset, breakdown));
    out
}

pub fn render_status(status: &StatusReport) -> String {
    let cal = &status.calibration;
    let last = &status.last_run;
    let env = &cal.reference_env;
    let mut out = String::from("auto-z-tap status:\n");
    let _ = writeln!(
        out,
        "  probe_type={} ({})",
        status.probe_type, status.probe_description
    );
    let _ = writeln!(out, "  calibrated={}", cal.calibrated);
    let _ = writeln!(
        out,
        "  calibration_in_progress={}",
        status.calibration_in_progress
    );
    let _ = writeln!(
        out,
        "  reference_xy={:.3},{:.3}",
        status.reference_xy.0, status.reference_xy.1
    );
    let _ = writeln!(out, "  reference_probe_z={:.6}", cal.reference_probe_height);
    let _ = writeln!(out, "  paper_delta={:.6}", cal.paper_delta);
    let _ = writeln!(
        out,
        "  calibration_temps bed={} hotend={} chamber={}",
        optional(env.bed_temp, 1),
        optional(env.hotend_temp, 1),
        optional(env.chamber_temp, 1)
    );
    let _ = writeln!(
        out,
        "  calibration_probe_type={}",
        cal.probe_type.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        out,
        "  last_probe_z={} spread={} drift={}",
        optional(last.probe_height, 6),
        optional(last.spread, 4),
        optional(last.drift, 4)
    );
    let _ = writeln!(out, "  last_offset={}", optional(last.offset, 6));
    if let Some(at) = last.applied_at {
        let _ = writeln!(out, "  last_run_at={}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let _ = writeln!(
        out,
        "  warmup_taps={} thermal_soak={}",
        status.warmup_taps,
        if status.thermal_soak { "enabled" } else { "disabled" }
    );
    let _ = writeln!(
        out,
        "  safe_offset_range=[{:.3}, {:.3}]",
        status.safe_offset_range.0, status.safe_offset_range.1
    );
    if !status.profiles.is_empty() {
        let _ = writeln!(out, "  available_profiles={}", status.profiles.join(","));
    }
    if let Some((stats, level, score)) = &status.health {
        let _ = writeln!(
            out,
            "  probe_health: confidence={} ({:.2}) sessions={} avg_spread={:.4} trend={}",
            level, score, stats.count, stats.avg_spread, stats.trend
        );
    }
    out
}

pub fn render_health(report: &HealthReport) -> String {
    match report {
        HealthReport::Disabled => "auto-z-tap probe health tracking is disabled.\n\
             Set health.tracking = true in the config file.\n"
            .to_string(),
        HealthReport::NoData => "auto-z-tap probe health: no data yet.\n\
             Run auto-z-tap at least once to start collecting data.\n"
            .to_string(),
        HealthReport::Tracked {
            probe_type,
            stats,
            level,
            score,
            suggested_samples,
            configured_samples,
            warnings,
        } => {
            let mut out = String::from("auto-z-tap probe health:\n");
            let _ = writeln!(out, "  probe_type={}", probe_type);
            let _ = writeln!(out, "  sessions_tracked={}", stats.count);
            let _ = writeln!(out, "  confidence={} ({:.2})", level, score);
            let _ = writeln!(
                out,
                "  avg_spread={:.4}mm  max_spread={:.4}mm  min={:.4}mm",
                stats.avg_spread, stats.max_spread, stats.min_spread
            );
            let _ = writeln!(
                out,
                "  avg_drift={:.4}mm  max_abs_drift={:.4}mm",
                stats.avg_drift, stats.max_abs_drift
            );
            let _ = writeln!(
                out,
                "  avg_retries={:.1}  retry_rate={:.1}%",
                stats.avg_retries,
                stats.retry_rate * 100.0
            );
            let _ = writeln!(out, "  trend={}", stats.trend);
            let _ = writeln!(
                out,
                "  suggested_samples={} (configured={})",
                suggested_samples, configured_samples
            );
            if !warnings.is_empty() {
                out.push_str("  warnings:\n");
                for warning in warnings {
                    let _ = writeln!(out, "    - {}", warning);
                }
            }
            out
        }
    }
}

pub fn render_probe_test(report: &ProbeTestReport, probe_type: &str) -> String {
    let values: Vec<String> = report.values.iter().map(|v| format!("{:.4}", v)).collect();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "auto-z-tap probe test ({} samples, probe_type={}):",
        report.values.len(),
        probe_type
    );
    let _ = writeln!(out, "  values: {}", values.join(", "));
    let _ = writeln!(
        out,
        "  median={:.6}  average={:.6}",
        report.median, report.average
    );
    let _ = writeln!(
        out,
        "  spread={:.4}mm  stdev={:.4}mm",
        report.spread, report.stdev
    );
    let _ = writeln!(out, "  rating: {}", report.rating);
    if report.warmup_taps > 0 {
        let _ = writeln!(out, "  warmup_taps={}", report.warmup_taps);
    }
    out
}
