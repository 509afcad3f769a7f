//! # Offset Engine Scenarios
//!
//! Each test drives the public engine API against [`crate::sim`] and a
//! file-backed store in a temporary directory, then checks what reached the
//! toolhead and what was persisted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::calibration::{
    CalibrationOutcome, CalibrationPhase, CalibrationState, Jog, PaperTest, Validation,
};
use crate::compensation::References;
use crate::config::{Config, Settings};
use crate::engine::{HealthReport, OffsetEngine, RunOverrides};
use crate::error::{Collaborator, EnvelopeSide, ZOffsetError};
use crate::machine::{MachineIo, Toolhead};
use crate::sim::{SimClock, SimHeaters, SimProbe, SimToolhead};
use crate::store::{JsonFileStore, KeyValueStore, VariableKeys};
use crate::thermal::SoakOutcome;
use crate::EnvironmentInput;

/// Generic probe, three samples, envelope wide enough for raw trigger
/// heights around 2 mm.
const WIDE_ENVELOPE: &str = r#"
[probe]
type = "generic"
samples = 3

[safety]
safe_offset_min = -3.0
safe_offset_max = 3.0
"#;

struct Rig {
    toolhead: SimToolhead,
    probe: SimProbe,
    heaters: SimHeaters,
    clock: SimClock,
}

impl Rig {
    fn new(surface: f64) -> Self {
        let clock = SimClock::new();
        let mut heaters = SimHeaters::new();
        heaters.attach_clock(&clock);
        Self {
            toolhead: SimToolhead::homed(),
            probe: SimProbe::new(surface),
            heaters,
            clock,
        }
    }

    fn io(&mut self) -> MachineIo<'_> {
        MachineIo {
            toolhead: &mut self.toolhead,
            probe: Some(&mut self.probe),
            sensors: &self.heaters,
            clock: &mut self.clock,
        }
    }

    fn io_without_probe(&mut self) -> MachineIo<'_> {
        MachineIo {
            toolhead: &mut self.toolhead,
            probe: None,
            sensors: &self.heaters,
            clock: &mut self.clock,
        }
    }
}

fn variables(dir: &TempDir) -> PathBuf {
    dir.path().join("variables.json")
}

fn engine(config: &str, path: &Path) -> OffsetEngine {
    let settings = Settings::resolve(&Config::parse(config).unwrap()).unwrap();
    OffsetEngine::new(settings, Some(Box::new(JsonFileStore::open(path))))
}

/// Engine over a store that already holds a committed calibration.
fn calibrated_engine(config: &str, path: &Path, height: f64, delta: f64) -> OffsetEngine {
    let mut store = JsonFileStore::open(path);
    CalibrationState {
        calibrated: true,
        reference_probe_height: height,
        paper_delta: delta,
        reference_xy: Some((100.0, 100.0)),
        reference_env: References {
            bed_temp: Some(60.0),
            ..Default::default()
        },
        probe_type: Some("generic".into()),
    }
    .persist(&mut store, &VariableKeys::new("auto_z_tap"))
    .unwrap();
    engine(config, path)
}

fn input() -> EnvironmentInput {
    EnvironmentInput::default()
}

/// Paper test at 1.85 over a 2.0 trigger stores a -0.15 delta and applies it.
#[test]
fn calibration_stores_paper_delta_and_applies_offset() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
    let mut rig = Rig::new(2.0);
    rig.heaters.set("heater_bed", 59.8, 60.0);

    let pending = engine
        .begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert_eq!(
        engine.calibration_phase(),
        CalibrationPhase::InProgress {
            ticket: pending.ticket()
        }
    );
    assert!((pending.session.reduced_height - 2.0).abs() < 1e-9);
    // parked above the bed for the paper
    assert!(rig.toolhead.position()[2] >= 7.0);

    let mut paper = PaperTest::new(&mut rig.toolhead, 5.0);
    paper.jog(Jog::Absolute(2.0)).unwrap();
    paper.jog(Jog::Relative(-0.1)).unwrap();
    paper.jog(Jog::Relative(-0.05)).unwrap();
    let outcome = paper.accept();

    let report = match engine
        .complete_calibration(&mut rig.io(), pending, outcome)
        .unwrap()
    {
        CalibrationOutcome::Committed(report) => report,
        other => panic!("expected commit, got {other:?}"),
    };
    assert!((report.paper_delta + 0.150).abs() < 1e-9);
    assert!((report.offset.final_offset - 1.85).abs() < 1e-9);
    assert!(engine.state().calibrated);
    assert_eq!(engine.calibration_phase(), CalibrationPhase::Committed);
    assert_eq!(rig.toolhead.applied_offsets().len(), 1);

    let store = JsonFileStore::open(variables(&dir));
    assert_eq!(store.get("auto_z_tap_calibrated"), Some(json!(true)));
    assert_eq!(store.get("auto_z_tap_paper_delta"), Some(json!(-0.15)));
    assert_eq!(store.get("auto_z_tap_cal_bed_temp"), Some(json!(60.0)));
    assert_eq!(store.get("auto_z_tap_reference_x"), Some(json!(0.0)));
}

/// A committed calibration is reloaded by a fresh engine on the same file.
#[test]
fn calibration_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
        let mut rig = Rig::new(2.0);
        let pending = engine
            .begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default())
            .unwrap();
        let mut paper = PaperTest::new(&mut rig.toolhead, 5.0);
        paper.jog(Jog::Absolute(1.9)).unwrap();
        let outcome = paper.accept();
        engine
            .complete_calibration(&mut rig.io(), pending, outcome)
            .unwrap();
    }

    let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
    assert!(engine.state().calibrated);
    assert!((engine.state().paper_delta + 0.1).abs() < 1e-9);
    assert!(engine.last_run().offset.is_some());

    let mut rig = Rig::new(2.0);
    let report = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert!((report.final_offset - 1.9).abs() < 1e-9);
}

/// Cancelling the paper test persists nothing and leaves the machine uncalibrated.
#[test]
fn cancelled_calibration_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
    let mut rig = Rig::new(2.0);

    let pending = engine
        .begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert!(matches!(
        engine.begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::CalibrationAlreadyInProgress)
    ));

    let outcome = PaperTest::new(&mut rig.toolhead, 5.0).cancel();
    let result = engine
        .complete_calibration(&mut rig.io(), pending, outcome)
        .unwrap();
    assert_eq!(result, CalibrationOutcome::Aborted);
    assert!(!engine.state().calibrated);
    assert!(rig.toolhead.applied_offsets().is_empty());
    assert_eq!(JsonFileStore::open(variables(&dir)).get("auto_z_tap_calibrated"), None);
}

/// Clearing mid-calibration turns the pending ticket stale.
#[test]
fn clear_invalidates_pending_calibration() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
    let mut rig = Rig::new(2.0);

    let pending = engine
        .begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    engine.clear(false).unwrap();

    let outcome = PaperTest::new(&mut rig.toolhead, 5.0).accept();
    assert!(matches!(
        engine.complete_calibration(&mut rig.io(), pending, outcome),
        Err(ZOffsetError::NoCalibrationInProgress)
    ));
    assert!(!engine.state().calibrated);
}

/// An unsafe follow-up offset fails the call but keeps the calibration.
#[test]
fn committed_calibration_stays_when_follow_up_run_is_unsafe() {
    let dir = TempDir::new().unwrap();
    // default generic envelope is +-0.5, raw trigger height is 2.0
    let mut engine = engine("", &variables(&dir));
    let mut rig = Rig::new(2.0);

    let pending = engine
        .begin_calibration(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    let mut paper = PaperTest::new(&mut rig.toolhead, 5.0);
    paper.jog(Jog::Absolute(1.85)).unwrap();
    let outcome = paper.accept();

    let err = engine
        .complete_calibration(&mut rig.io(), pending, outcome)
        .unwrap_err();
    assert!(matches!(
        err,
        ZOffsetError::UnsafeOffset {
            side: EnvelopeSide::AboveMaximum,
            ..
        }
    ));
    assert!(engine.state().calibrated);
    assert!(rig.toolhead.applied_offsets().is_empty());
}

/// Drift over the limit aborts before anything is applied or recorded.
#[test]
fn drift_beyond_limit_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let config = WIDE_ENVELOPE.replace("samples = 3", "samples = 3\nmax_drift = 0.80");
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(3.2);

    let err = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap_err();
    match err {
        ZOffsetError::DriftExceeded { drift, limit } => {
            assert!((drift - 1.2).abs() < 1e-9);
            assert_eq!(limit, 0.8);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(rig.toolhead.applied_offsets().is_empty());
    assert_eq!(engine.last_run().offset, None);
    assert_eq!(
        JsonFileStore::open(variables(&dir)).get("auto_z_tap_last_offset"),
        None
    );
}

/// A drift limit of zero turns the drift check off.
#[test]
fn zero_max_drift_disables_the_check() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(3.5);
    let overrides = RunOverrides {
        max_drift: Some(0.0),
        safe_offset_max: Some(5.0),
        ..Default::default()
    };
    let report = engine.run(&mut rig.io(), &input(), &[], &overrides).unwrap();
    assert!((report.drift - 1.5).abs() < 1e-9);
    assert!((report.final_offset - 3.35).abs() < 1e-9);
}

/// Bed 10 degrees above calibration adds 0.001 with a 0.0001 coefficient.
#[test]
fn bed_temperature_compensation_adds_to_offset() {
    let dir = TempDir::new().unwrap();
    let config = format!("{}\n[compensation]\nbed_temp_coeff = 0.0001\n", WIDE_ENVELOPE);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    rig.heaters.set("heater_bed", 68.5, 70.0);

    let report = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert!((report.adjustment_total - 0.001).abs() < 1e-9);
    assert!((report.final_offset - 1.851).abs() < 1e-9);
    assert_eq!(report.environment.bed_temp, Some(70.0));
    let bed = report
        .breakdown
        .iter()
        .find(|e| e.label == "global_bed_temp")
        .unwrap();
    assert!((bed.value - 0.001).abs() < 1e-9);

    let (applied, move_speed) = rig.toolhead.applied_offsets()[0];
    assert!((applied - 1.851).abs() < 1e-9);
    assert_eq!(move_speed, None);

    let store = JsonFileStore::open(variables(&dir));
    assert_eq!(store.get("auto_z_tap_last_offset"), Some(json!(1.851)));
    assert_eq!(store.get("auto_z_tap_last_drift"), Some(json!(0.0)));
    assert!(store.get("auto_z_tap_last_run_at").unwrap().is_string());
}

/// An offset under the safe minimum is rejected with the lower bound.
#[test]
fn offset_below_envelope_never_reaches_toolhead() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine("", &variables(&dir), 0.1, -0.1);
    let mut rig = Rig::new(-0.55);

    let err = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap_err();
    match err {
        ZOffsetError::UnsafeOffset { value, bound, side } => {
            assert!((value + 0.65).abs() < 1e-9);
            assert_eq!(bound, -0.5);
            assert_eq!(side, EnvelopeSide::BelowMinimum);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(rig.toolhead.applied_offsets().is_empty());
}

/// Compensation totals beyond the cap are refused.
#[test]
fn adjustment_cap_rejects_large_totals() {
    let dir = TempDir::new().unwrap();
    let config = format!("{}\n[profiles.thick]\noffset = 0.7\n", WIDE_ENVELOPE);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);

    let err = engine
        .run(
            &mut rig.io(),
            &input(),
            &["thick".to_string()],
            &RunOverrides::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ZOffsetError::AdjustmentCapExceeded { cap, .. } if cap == 0.6
    ));
    assert!(rig.toolhead.applied_offsets().is_empty());

    // a per-run cap of zero disables the check
    let overrides = RunOverrides {
        max_adjust: Some(0.0),
        ..Default::default()
    };
    let report = engine
        .run(&mut rig.io(), &input(), &["thick".to_string()], &overrides)
        .unwrap();
    assert!((report.final_offset - 2.55).abs() < 1e-9);
}

/// Auto-matched profiles apply by priority, ties broken by name.
#[test]
fn matching_profiles_apply_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"{}
[profiles.alpha]
material = "pla"
priority = 100
offset = 0.001

[profiles.gamma]
material = "pla"
priority = 50
offset = 0.002

[profiles.beta]
material = "pla"
priority = 50
offset = 0.003

[profiles.petg]
material = "petg"
offset = 0.1
"#,
        WIDE_ENVELOPE
    );
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    let input = EnvironmentInput {
        material: "PLA".into(),
        ..Default::default()
    };

    let report = engine
        .run(&mut rig.io(), &input, &[], &RunOverrides::default())
        .unwrap();
    assert_eq!(report.profiles, vec!["beta", "gamma", "alpha"]);
    assert!((report.adjustment_total - 0.006).abs() < 1e-9);

    // explicit names come first, auto-matches follow
    let report = engine
        .run(
            &mut rig.io(),
            &input,
            &["ALPHA".to_string()],
            &RunOverrides::default(),
        )
        .unwrap();
    assert_eq!(report.profiles, vec!["alpha", "beta", "gamma"]);

    let no_auto = RunOverrides {
        auto_match: Some(false),
        ..Default::default()
    };
    let report = engine.run(&mut rig.io(), &input, &[], &no_auto).unwrap();
    assert!(report.profiles.is_empty());

    let err = engine
        .run(
            &mut rig.io(),
            &input,
            &["abs".to_string()],
            &RunOverrides::default(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("alpha, beta, gamma, petg"));
}

/// Missing calibration or probe fails without a single tap.
#[test]
fn preconditions_are_checked_before_probing() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(WIDE_ENVELOPE, &variables(&dir));
    let mut rig = Rig::new(2.0);

    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::NotCalibrated)
    ));
    assert!(matches!(
        engine.run(
            &mut rig.io_without_probe(),
            &input(),
            &[],
            &RunOverrides::default()
        ),
        Err(ZOffsetError::MissingCollaborator(Collaborator::Probe))
    ));
    assert_eq!(rig.probe.taps(), 0);

    let settings = Settings::resolve(&Config::default()).unwrap();
    let mut storeless = OffsetEngine::new(settings, None);
    assert!(matches!(
        storeless.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::MissingCollaborator(Collaborator::Store))
    ));
}

/// Unhomed axes are homed when allowed, otherwise the run is refused.
#[test]
fn unhomed_machine_is_homed_or_refused() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    rig.toolhead = SimToolhead::new();
    engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert_eq!(rig.toolhead.homings(), 1);
    assert_eq!(rig.toolhead.mesh_clears(), 1);

    let config = format!("{}\n[motion]\nauto_home = false\n", WIDE_ENVELOPE);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    rig.toolhead = SimToolhead::new();
    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::AxesNotHomed)
    ));
}

/// Soak timeout warns and continues unless configured to abort.
#[test]
fn soak_timeout_is_soft_unless_configured() {
    let soak = "\n[thermal_soak]\nenabled = true\ntimeout = 10.0\npoll_interval = 2.0\n";
    let dir = TempDir::new().unwrap();
    let config = format!("{}{}", WIDE_ENVELOPE, soak);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    rig.heaters
        .set_ramp("heater_bed", 20.0, 10.0, Duration::from_secs(3600));

    let report = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert!(matches!(
        report.thermal_soak,
        Some(SoakOutcome::TimedOut { .. })
    ));

    let config = format!("{}{}abort_on_timeout = true\n", WIDE_ENVELOPE, soak);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let taps = rig.probe.taps();
    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::ThermalSoakTimeout { .. })
    ));
    assert_eq!(rig.probe.taps(), taps);

    // skippable per run
    let skip = RunOverrides {
        thermal_soak: Some(false),
        ..Default::default()
    };
    let report = engine.run(&mut rig.io(), &input(), &[], &skip).unwrap();
    assert_eq!(report.thermal_soak, None);
}

/// Exhausted retries report the last spread and apply nothing.
#[test]
fn repeatability_failure_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    rig.probe = SimProbe::with_readings(2.0, vec![0.0, 0.2, -0.2]);

    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::RepeatabilityExceeded { .. })
    ));
    assert!(rig.toolhead.applied_offsets().is_empty());
}

/// Each run adds a health record; clearing with history empties it.
#[test]
fn health_is_recorded_per_run_and_cleared_on_request() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    assert_eq!(engine.health_report(), HealthReport::NoData);

    for _ in 0..3 {
        engine
            .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
            .unwrap();
    }
    match engine.health_report() {
        HealthReport::Tracked {
            stats,
            configured_samples,
            ..
        } => {
            assert_eq!(stats.count, 3);
            assert_eq!(configured_samples, 3);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    let history = JsonFileStore::open(variables(&dir))
        .get("auto_z_tap_probe_history")
        .unwrap();
    assert_eq!(history.as_array().map(Vec::len), Some(3));

    engine.clear(true).unwrap();
    assert_eq!(engine.health_report(), HealthReport::NoData);
    assert!(!engine.state().calibrated);
    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::NotCalibrated)
    ));
    let store = JsonFileStore::open(variables(&dir));
    assert_eq!(store.get("auto_z_tap_calibrated"), Some(json!(false)));
    assert_eq!(store.get("auto_z_tap_probe_history"), Some(json!([])));
}

/// With tracking off there is no confidence and no health report.
#[test]
fn disabled_tracking_reports_disabled() {
    let dir = TempDir::new().unwrap();
    let config = format!("{}\n[health]\ntracking = false\n", WIDE_ENVELOPE);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    let report = engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert_eq!(report.confidence, None);
    assert_eq!(engine.health_report(), HealthReport::Disabled);
}

/// Per-run move overrides are passed through to the apply call.
#[test]
fn apply_overrides_reach_the_toolhead() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    let overrides = RunOverrides {
        x: Some(20.0),
        y: Some(30.0),
        extra: -0.02,
        move_on_apply: Some(true),
        move_speed: Some(5.0),
        save: Some(false),
        ..Default::default()
    };

    let report = engine.run(&mut rig.io(), &input(), &[], &overrides).unwrap();
    assert_eq!(report.reference_xy, (20.0, 30.0));
    assert_eq!((report.session.x, report.session.y), (20.0, 30.0));
    assert!((report.final_offset - 1.83).abs() < 1e-9);
    assert_eq!(report.breakdown.last().map(|e| e.label.as_str()), Some("extra"));
    assert_eq!(rig.toolhead.applied_offsets()[0].1, Some(5.0));
    // in memory only
    assert!(engine.last_run().offset.is_some());
    assert_eq!(
        JsonFileStore::open(variables(&dir)).get("auto_z_tap_last_offset"),
        None
    );
}

/// A failed apply leaves the previous last-run telemetry in place.
#[test]
fn failed_apply_keeps_previous_last_run() {
    let dir = TempDir::new().unwrap();
    let mut engine = calibrated_engine(WIDE_ENVELOPE, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    rig.toolhead.fail_next_apply();

    assert!(matches!(
        engine.run(&mut rig.io(), &input(), &[], &RunOverrides::default()),
        Err(ZOffsetError::Machine(_))
    ));
    assert_eq!(engine.last_run().offset, None);
    assert_eq!(engine.health().map(|h| h.len()), Some(0));
}

/// Diagnostic taps report statistics without applying an offset.
#[test]
fn probe_test_reports_without_applying() {
    let dir = TempDir::new().unwrap();
    let engine = engine(WIDE_ENVELOPE, &variables(&dir));
    let mut rig = Rig::new(2.0);
    rig.probe = SimProbe::with_readings(2.0, vec![0.0, 0.004, 0.002]);
    let overrides = RunOverrides {
        samples: Some(3),
        warmup_taps: Some(0),
        ..Default::default()
    };

    let report = engine.probe_test(&mut rig.io(), &overrides).unwrap();
    assert_eq!(report.values.len(), 3);
    assert!((report.median - 2.002).abs() < 1e-9);
    assert!(rig.toolhead.applied_offsets().is_empty());
    assert!(engine.health().map_or(true, |h| h.is_empty()));
}

/// Status shows the stored calibration and the last applied run.
#[test]
fn status_reflects_calibration_and_last_run() {
    let dir = TempDir::new().unwrap();
    let config = format!("{}\n[profiles.pla]\nmaterial = \"pla\"\n", WIDE_ENVELOPE);
    let mut engine = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);
    engine
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();

    let status = engine.status();
    assert!(status.calibration.calibrated);
    assert_eq!(status.reference_xy, (100.0, 100.0));
    assert_eq!(status.profiles, vec!["pla"]);
    assert_eq!(status.calibration.reference_env.bed_temp, Some(60.0));
    assert!(status.last_run.applied_at.is_some());
    assert_eq!(status.health.map(|(stats, _, _)| stats.count), Some(1));
}

/// Adaptive sampling adds taps while the probe is unproven and trims them
/// once the history is clean.
#[test]
fn adaptive_sampling_follows_probe_confidence() {
    let dir = TempDir::new().unwrap();
    let config = format!("{}\n[health]\nadaptive_samples = true\n", WIDE_ENVELOPE);
    let mut fresh = calibrated_engine(&config, &variables(&dir), 2.0, -0.15);
    let mut rig = Rig::new(2.0);

    let report = fresh
        .run(&mut rig.io(), &input(), &[], &RunOverrides::default())
        .unwrap();
    assert_eq!(rig.probe.taps(), 5);
    assert_eq!(report.session.sample_count, 5);

    let clean: Vec<_> = (0..20)
        .map(|_| json!({"z": 2.0, "s": 0.002, "d": 0.0, "n": 5, "r": 0}))
        .collect();
    JsonFileStore::open(variables(&dir))
        .set("auto_z_tap_probe_history", json!(clean))
        .unwrap();
    let mut proven = engine(&config, &variables(&dir));
    let mut rig = Rig::new(2.0);
    let overrides = RunOverrides {
        samples: Some(6),
        ..Default::default()
    };
    let report = proven.run(&mut rig.io(), &input(), &[], &overrides).unwrap();
    assert_eq!(rig.probe.taps(), 4);
    assert_eq!(report.session.sample_count, 4);
}

/// Validation drift is judged against the configured spread limit, not a
/// tighter one passed for the calibration run.
#[test]
fn validation_threshold_uses_configured_spread() {
    for (surface, expect_significant) in [(2.04, false), (2.07, true)] {
        let dir = TempDir::new().unwrap();
        let config = format!("{}\n[calibration]\nvalidate = true\n", WIDE_ENVELOPE);
        let mut engine = engine(&config, &variables(&dir));
        let mut rig = Rig::new(2.0);
        let overrides = RunOverrides {
            max_spread: Some(0.01),
            ..Default::default()
        };
        let pending = engine
            .begin_calibration(&mut rig.io(), &input(), &[], &overrides)
            .unwrap();
        let mut paper = PaperTest::new(&mut rig.toolhead, 5.0);
        paper.jog(Jog::Absolute(1.85)).unwrap();
        let outcome = paper.accept();
        rig.probe.set_surface(surface);

        let report = match engine
            .complete_calibration(&mut rig.io(), pending, outcome)
            .unwrap()
        {
            CalibrationOutcome::Committed(report) => report,
            other => panic!("expected commit, got {other:?}"),
        };
        match &report.validation {
            Some(Validation::Measured {
                drift, significant, ..
            }) => {
                assert!((drift - (surface - 2.0)).abs() < 1e-9);
                assert_eq!(*significant, expect_significant, "surface {surface}");
            }
            other => panic!("expected a measured validation, got {other:?}"),
        }
    }
}
