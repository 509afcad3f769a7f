//! # Auto Z Tap Entry Point
//!
//! Command-line front end over a simulated printer. Calibration and probe
//! history persist in the variables file between invocations, so the full
//! workflow can be exercised from a shell:
//!
//! ```text
//! auto-z-tap calibrate PAPER_Z=0.05
//! auto-z-tap run MATERIAL=petg BED_TEMP=80
//! auto-z-tap status
//! ```
//!
//! Parameters use the `KEY=VALUE` form of printer macros. `SIM_Z`, `SIM_BED`
//! and `SIM_HOTEND` shape the simulated machine (trigger height and heater
//! temperatures).

use anyhow::{bail, Context};
use auto_z_lib::calibration::{CalibrationOutcome, Jog, JogOutcome, PaperTest};
use auto_z_lib::config::{Config, Settings};
use auto_z_lib::engine::{OffsetEngine, RunOverrides};
use auto_z_lib::machine::MachineIo;
use auto_z_lib::report;
use auto_z_lib::sim::{SimClock, SimHeaters, SimProbe, SimToolhead};
use auto_z_lib::store::JsonFileStore;
use auto_z_lib::{split_csv, EnvironmentInput};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const USAGE: &str = "usage: auto-z-tap [--config PATH] <run|calibrate|status|health|clear|probe-test> [KEY=VALUE ...]";

/// Small repeatability noise for the simulated probe (mm).
const SIM_NOISE: [f64; 5] = [0.0, 0.002, -0.001, 0.001, -0.002];

/// Parsed `KEY=VALUE` parameters, keys uppercased.
struct Params(BTreeMap<String, String>);

impl Params {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                bail!("expected KEY=VALUE, got '{}'", arg);
            };
            map.insert(key.trim().to_uppercase(), value.trim().to_string());
        }
        Ok(Self(map))
    }

    fn get<T: FromStr>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.0
            .get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow::anyhow!("invalid {}={}: {}", key, raw, e))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> anyhow::Result<Option<bool>> {
        Ok(self.get::<u8>(key)?.map(|v| v != 0))
    }

    fn text(&self, key: &str) -> String {
        self.0.get(key).cloned().unwrap_or_default()
    }

    fn environment(&self) -> anyhow::Result<EnvironmentInput> {
        Ok(EnvironmentInput {
            bed_temp: self.get("BED_TEMP")?,
            hotend_temp: self.get("HOTEND_TEMP")?,
            chamber_temp: self.get("CHAMBER_TEMP")?,
            first_layer_height: self.get("LAYER_HEIGHT")?,
            material: self.text("MATERIAL"),
            surface: self.text("SURFACE"),
            nozzle: self.text("NOZZLE"),
        })
    }

    fn profiles(&self) -> Vec<String> {
        split_csv(&self.text("PROFILES"))
    }

    fn overrides(&self) -> anyhow::Result<RunOverrides> {
        Ok(RunOverrides {
            x: self.get("X")?,
            y: self.get("Y")?,
            samples: self.get("SAMPLES")?,
            retries: self.get("RETRIES")?,
            max_spread: self.get("MAX_SPREAD")?,
            reduction: self.get("SAMPLES_RESULT")?,
            probe_speed: self.get("PROBE_SPEED")?,
            lift_speed: self.get("LIFT_SPEED")?,
            retract_dist: self.get("SAMPLE_RETRACT_DIST")?,
            thermal_soak: self.flag("THERMAL_SOAK")?,
            thermal_soak_timeout: self
                .get::<f64>("THERMAL_SOAK_TIMEOUT")?
                .map(|secs| Duration::from_secs_f64(secs.max(0.0))),
            warmup_taps: self.get("WARMUP_TAPS")?,
            max_drift: self.get("MAX_DRIFT")?,
            max_adjust: self.get("MAX_ADJUST")?,
            safe_offset_min: self.get("SAFE_MIN")?,
            safe_offset_max: self.get("SAFE_MAX")?,
            extra: self.get("EXTRA")?.unwrap_or(0.0),
            auto_match: self.flag("AUTO_MATCH")?,
            move_on_apply: self.flag("MOVE")?,
            move_speed: self.get("MOVE_SPEED")?,
            save: self.flag("SAVE")?,
        })
    }
}

/// The simulated machine for one invocation.
struct Machine {
    toolhead: SimToolhead,
    probe: SimProbe,
    heaters: SimHeaters,
    clock: SimClock,
}

impl Machine {
    fn from_params(params: &Params) -> anyhow::Result<Self> {
        let clock = SimClock::new();
        let mut heaters = SimHeaters::new();
        heaters.attach_clock(&clock);
        let bed = params.get("SIM_BED")?.unwrap_or(60.0);
        let hotend = params.get("SIM_HOTEND")?.unwrap_or(210.0);
        heaters.set("heater_bed", bed, bed);
        heaters.set("extruder", hotend, hotend);
        Ok(Self {
            toolhead: SimToolhead::new(),
            probe: SimProbe::with_readings(
                params.get("SIM_Z")?.unwrap_or(0.2),
                SIM_NOISE.to_vec(),
            ),
            heaters,
            clock,
        })
    }

    fn io(&mut self) -> MachineIo<'_> {
        MachineIo {
            toolhead: &mut self.toolhead,
            probe: Some(&mut self.probe),
            sensors: &self.heaters,
            clock: &mut self.clock,
        }
    }
}

/// Read jog commands from stdin until the operator accepts or aborts.
///
/// `+0.05` / `-0.1` jog relative, `=1.8` jogs absolute, `accept` and
/// `abort` finish the test.
fn interactive_paper_test(test: &mut PaperTest<'_>) -> anyhow::Result<bool> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    println!("Slide paper under the nozzle and jog until it drags lightly.");
    println!("Commands: +DZ, -DZ, =Z, accept, abort");
    loop {
        print!("z={:.3}> ", test.current_z());
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(false);
        }
        let line = line.trim();
        let request = match line {
            "accept" => return Ok(true),
            "abort" => return Ok(false),
            _ if line.starts_with('=') => Jog::Absolute(line[1..].trim().parse()?),
            _ => match line.parse::<f64>() {
                Ok(dz) => Jog::Relative(dz),
                Err(_) => {
                    println!("unrecognised command '{}'", line);
                    continue;
                }
            },
        };
        test.jog(request)?;
    }
}

fn calibrate(engine: &mut OffsetEngine, machine: &mut Machine, params: &Params) -> anyhow::Result<()> {
    let pending = engine.begin_calibration(
        &mut machine.io(),
        &params.environment()?,
        &params.profiles(),
        &params.overrides()?,
    )?;

    let jog_speed = engine.settings().motion.travel_speed.min(10.0);
    let mut test = PaperTest::new(&mut machine.toolhead, jog_speed);
    let accepted = match params.get::<f64>("PAPER_Z")? {
        Some(z) => {
            test.jog(Jog::Absolute(z))?;
            true
        }
        None => interactive_paper_test(&mut test)?,
    };
    let outcome: JogOutcome = if accepted { test.accept() } else { test.cancel() };

    match engine.complete_calibration(&mut machine.io(), pending, outcome)? {
        CalibrationOutcome::Aborted => println!("auto-z-tap calibration aborted"),
        CalibrationOutcome::Committed(summary) => {
            print!(
                "{}",
                report::render_calibration(&summary, engine.settings().report_breakdown)
            )
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = match args.iter().position(|arg| arg == "--config") {
        Some(idx) => {
            if idx + 1 >= args.len() {
                bail!("--config needs a path\n{}", USAGE);
            }
            let path = PathBuf::from(args.remove(idx + 1));
            args.remove(idx);
            Some(path)
        }
        None => None,
    };
    let Some(command) = args.first().cloned() else {
        bail!("{}", USAGE);
    };
    let params = Params::parse(&args[1..])?;

    let config = match &config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("loading configuration")?;
    let settings = Settings::resolve(&config).context("resolving configuration")?;
    let store = JsonFileStore::open(&settings.storage.path);
    info!("Using variables file {:?}", store.path());
    let mut engine = OffsetEngine::new(settings, Some(Box::new(store)));
    let mut machine = Machine::from_params(&params)?;

    match command.as_str() {
        "run" => {
            let result = engine.run(
                &mut machine.io(),
                &params.environment()?,
                &params.profiles(),
                &params.overrides()?,
            )?;
            print!(
                "{}",
                report::render_offset(&result, engine.settings().report_breakdown)
            );
        }
        "calibrate" => calibrate(&mut engine, &mut machine, &params)?,
        "status" => print!("{}", report::render_status(&engine.status())),
        "health" => print!("{}", report::render_health(&engine.health_report())),
        "clear" => {
            let clear_history = params.flag("CLEAR_HISTORY")?.unwrap_or(false);
            engine.clear(clear_history)?;
            if clear_history {
                println!("auto-z-tap calibration and probe history cleared");
            } else {
                println!("auto-z-tap calibration state cleared");
            }
        }
        "probe-test" => {
            let result = engine.probe_test(&mut machine.io(), &params.overrides()?)?;
            print!(
                "{}",
                report::render_probe_test(&result, engine.settings().probe_type.name())
            );
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
    Ok(())
}
