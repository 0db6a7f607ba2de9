use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use race_est::detector::DetectorState;
use race_est::projector::{project, standard_milestones, Projection, Unavailable};
use race_est::{parse_samples, TelemetrySample, DEFAULT_TARGET_DISTANCE_M};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Race finish-time estimation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze FIT/GPX activity files through the prediction pipeline
    Analyze(AnalyzeArgs),
    /// Run the built-in anomaly detection scenario suite
    Validate(ValidateArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// FIT/GPX files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path for per-sample rows (`-` for stdout)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Output JSON path for per-sample rows
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Target distance in meters for the finish-time projection
    #[arg(long, default_value_t = DEFAULT_TARGET_DISTANCE_M)]
    target: f64,

    /// Maximum table rows to print per file
    #[arg(long, default_value_t = 50)]
    max_rows: usize,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Run only the named scenario (e.g. distance-freeze)
    #[arg(long)]
    scenario: Option<String>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Analyze(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
        Command::Validate(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Validate(args) => handle_validate(args),
    }
}

/// Result of driving one sample through validator, detector, and projector.
#[derive(Clone, Debug, Serialize)]
struct SampleOutcome {
    elapsed_s: f64,
    distance_m: f64,
    pace_s_per_m: Option<f64>,
    show: bool,
    reasons: String,
    /// `None` while the verdict suppresses predictions.
    projection: Option<Projection>,
}

impl SampleOutcome {
    fn estimate_s(&self) -> Option<f64> {
        self.projection.and_then(|p| p.seconds())
    }
}

/// Drive a decoded sample sequence through the per-sample pipeline with a
/// fresh detector state, projecting only when the verdict shows.
fn run_stream(samples: &[TelemetrySample], target_m: f64) -> Vec<SampleOutcome> {
    let mut state = DetectorState::new();
    let mut out = Vec::with_capacity(samples.len());
    for sample in samples {
        let pace = sample.average_pace();
        let verdict = state.evaluate(sample.distance_m, pace.unwrap_or(0.0));
        let projection = if verdict.show {
            Some(project(sample.elapsed_s(), sample.distance_m, target_m))
        } else {
            None
        };
        out.push(SampleOutcome {
            elapsed_s: sample.elapsed_s(),
            distance_m: sample.distance_m,
            pace_s_per_m: pace,
            show: verdict.show,
            reasons: verdict.trail(),
            projection,
        });
    }
    out
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    if args.target <= 0.0 {
        return Err(anyhow!("--target must be > 0"));
    }

    let inputs: Vec<(usize, PathBuf)> = args.inputs.iter().cloned().enumerate().collect();
    let mut parsed: Vec<(usize, PathBuf, Vec<TelemetrySample>)> = inputs
        .par_iter()
        .map(|(file_id, path)| -> Result<(usize, PathBuf, Vec<TelemetrySample>)> {
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let hint = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("fit");
            let samples = parse_samples(&data, hint)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((*file_id, path.clone(), samples))
        })
        .collect::<Result<Vec<_>>>()?;
    parsed.sort_by_key(|(id, _, _)| *id);

    let mut all_rows: Vec<(String, SampleOutcome)> = Vec::new();
    for (_, path, samples) in &parsed {
        if samples.is_empty() {
            warn!("{}: no usable telemetry records, skipping", path.display());
            continue;
        }
        let outcomes = run_stream(samples, args.target);
        print_activity_report(path, samples, &outcomes, args.target, args.max_rows);
        let name = path.display().to_string();
        all_rows.extend(outcomes.into_iter().map(|o| (name.clone(), o)));
    }

    if all_rows.is_empty() {
        return Err(anyhow!("no usable telemetry records in any input"));
    }

    if let Some(output) = args.output.as_ref() {
        if output.as_os_str() == "-" {
            let stdout = io::stdout();
            let mut writer = csv::Writer::from_writer(stdout.lock());
            write_outcome_rows(&all_rows, &mut writer)?;
        } else {
            let file = File::create(output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let mut writer = csv::Writer::from_writer(file);
            write_outcome_rows(&all_rows, &mut writer)?;
            info!("Wrote sample CSV: {}", output.display());
        }
    }

    if let Some(json_path) = args.json.as_ref() {
        let rows: Vec<serde_json::Value> = all_rows
            .iter()
            .map(|(file, outcome)| {
                let mut value = serde_json::to_value(outcome).unwrap_or(serde_json::Value::Null);
                if let Some(map) = value.as_object_mut() {
                    map.insert("file".to_string(), serde_json::Value::String(file.clone()));
                }
                value
            })
            .collect();
        let text = serde_json::to_string_pretty(&rows)?;
        fs::write(json_path, text)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        info!("Wrote sample JSON: {}", json_path.display());
    }

    Ok(())
}

fn print_activity_report(
    path: &Path,
    samples: &[TelemetrySample],
    outcomes: &[SampleOutcome],
    target_m: f64,
    max_rows: usize,
) {
    let last = samples.last().expect("non-empty sample stream");
    println!("\nACTIVITY: {}", path.display());
    println!("{:-<78}", "");
    println!(
        "  total time:     {} ({:.1} s)",
        format_mmss(last.elapsed_s()),
        last.elapsed_s()
    );
    println!(
        "  total distance: {:.1} m ({:.2} km)",
        last.distance_m,
        last.distance_m / 1000.0
    );
    if let Some(pace) = last.average_pace() {
        println!(
            "  average pace:   {:.4} s/m ({:.2} min/km)",
            pace,
            pace * 1000.0 / 60.0
        );
    }
    println!("  samples:        {}", samples.len());

    let suppressed = outcomes.iter().filter(|o| !o.show).count();
    println!("  suppressed:     {}/{}", suppressed, outcomes.len());

    println!(
        "\n{:>9} {:>11} {:>11} {:>10} {:>6}  {}",
        "time", "dist(m)", "pace(s/m)", "est", "shown", "detail"
    );
    println!("{:-<78}", "");
    // Thin out long recordings; suppressed rows are always interesting.
    let stride = (outcomes.len() / max_rows.max(1)).max(1);
    for (i, outcome) in outcomes.iter().enumerate() {
        if i % stride != 0 && i != outcomes.len() - 1 && outcome.show {
            continue;
        }
        let pace_str = outcome
            .pace_s_per_m
            .map(|p| format!("{:.4}", p))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{:>9} {:>11.1} {:>11} {:>10} {:>6}  {}",
            format_mmss(outcome.elapsed_s),
            outcome.distance_m,
            pace_str,
            estimate_cell(outcome),
            if outcome.show { "yes" } else { "NO" },
            outcome.reasons
        );
    }

    println!("\nMILESTONES (target {:.0} m):", target_m);
    for milestone in standard_milestones() {
        match first_split(samples, milestone.target_m) {
            Some(sample) => println!(
                "  {:<5} reached at {} ({:.1} m)",
                milestone.label,
                format_mmss(sample.elapsed_s()),
                sample.distance_m
            ),
            None => println!("  {:<5} not reached", milestone.label),
        }
    }
}

/// First sample at or beyond the milestone distance.
fn first_split(samples: &[TelemetrySample], target_m: f64) -> Option<&TelemetrySample> {
    samples.iter().find(|s| s.distance_m >= target_m)
}

fn estimate_cell(outcome: &SampleOutcome) -> String {
    match outcome.projection {
        None => "--:--".to_string(),
        Some(Projection::Estimate(s)) => format_mmss(s),
        Some(Projection::AlreadyReached) => "done".to_string(),
        Some(Projection::NotAvailable(Unavailable::BelowWarmupDistance)) => "warmup".to_string(),
        Some(Projection::NotAvailable(Unavailable::PaceOutOfBounds)) => "insane".to_string(),
    }
}

fn write_outcome_rows<W: Write>(
    rows: &[(String, SampleOutcome)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "file",
        "elapsed_s",
        "distance_m",
        "pace_s_per_m",
        "show",
        "estimate_s",
        "reasons",
    ])?;
    for (file, outcome) in rows {
        writer.write_record([
            file.clone(),
            format!("{:.3}", outcome.elapsed_s),
            format!("{:.3}", outcome.distance_m),
            outcome
                .pace_s_per_m
                .map(|p| format!("{:.6}", p))
                .unwrap_or_default(),
            outcome.show.to_string(),
            outcome
                .estimate_s()
                .map(|e| format!("{:.1}", e))
                .unwrap_or_default(),
            outcome.reasons.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Format seconds as `M:SS` (or `H:MM:SS` past the hour).
fn format_mmss(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// One pre-computed pace update for the scenario suite. Pace arrives
/// alongside the sample, mirroring how the recording host feeds the
/// detector.
struct ScenarioEvent {
    elapsed_ms: u64,
    distance_m: f64,
    pace: f64,
}

impl ScenarioEvent {
    fn new(elapsed_ms: u64, distance_m: f64, pace: f64) -> Self {
        Self {
            elapsed_ms,
            distance_m,
            pace,
        }
    }
}

struct Scenario {
    name: &'static str,
    description: &'static str,
    events: Vec<ScenarioEvent>,
}

fn scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "normal-5k",
            description: "Steady pace, healthy GPS stream",
            events: vec![
                ScenarioEvent::new(10_000, 103.20, 0.097),
                ScenarioEvent::new(20_000, 207.21, 0.096),
                ScenarioEvent::new(30_000, 311.32, 0.096),
                ScenarioEvent::new(40_000, 415.53, 0.096),
                ScenarioEvent::new(50_000, 519.74, 0.096),
                ScenarioEvent::new(60_000, 623.95, 0.096),
            ],
        },
        Scenario {
            name: "distance-freeze",
            description: "Distance field freezes during activity playback",
            events: vec![
                ScenarioEvent::new(10_000, 1539.78, 0.385),
                ScenarioEvent::new(20_000, 1539.78, 0.392),
                ScenarioEvent::new(30_000, 1539.78, 0.400),
                ScenarioEvent::new(40_000, 1539.78, 0.408),
                ScenarioEvent::new(50_000, 1539.78, 0.417),
                ScenarioEvent::new(60_000, 1539.78, 0.426),
                ScenarioEvent::new(70_000, 1539.78, 0.435),
            ],
        },
        Scenario {
            name: "spike-recovery",
            description: "Pace bounces from a GPS position jump, then recovers",
            events: vec![
                ScenarioEvent::new(10_000, 1000.00, 0.100),
                ScenarioEvent::new(20_000, 1050.00, 0.105),
                ScenarioEvent::new(30_000, 1100.00, 0.111),
                ScenarioEvent::new(40_000, 900.00, 0.044),
                ScenarioEvent::new(50_000, 950.00, 0.105),
                ScenarioEvent::new(60_000, 1000.00, 0.100),
                ScenarioEvent::new(70_000, 1050.00, 0.105),
            ],
        },
        Scenario {
            name: "sporadic-gps",
            description: "Delayed fixes produce single-sample stalls",
            events: vec![
                ScenarioEvent::new(10_000, 100.00, 0.100),
                ScenarioEvent::new(11_000, 100.50, 0.101),
                ScenarioEvent::new(12_000, 100.50, 0.102),
                ScenarioEvent::new(13_000, 101.00, 0.103),
                ScenarioEvent::new(14_000, 101.00, 0.104),
                ScenarioEvent::new(15_000, 101.50, 0.105),
            ],
        },
        Scenario {
            name: "urban-canyon",
            description: "Signal loss freezes distance, then jumps on recovery",
            events: vec![
                ScenarioEvent::new(10_000, 500.00, 0.100),
                ScenarioEvent::new(20_000, 600.00, 0.100),
                ScenarioEvent::new(30_000, 600.00, 0.100),
                ScenarioEvent::new(40_000, 600.00, 0.100),
                ScenarioEvent::new(50_000, 600.00, 0.100),
                ScenarioEvent::new(60_000, 650.00, 0.100),
                ScenarioEvent::new(70_000, 750.00, 0.100),
            ],
        },
        Scenario {
            name: "elite-runner",
            description: "4 min/km pace, well inside the sanity floor",
            events: vec![
                ScenarioEvent::new(60_000, 1000.00, 0.067),
                ScenarioEvent::new(120_000, 2000.00, 0.067),
                ScenarioEvent::new(180_000, 3000.00, 0.067),
                ScenarioEvent::new(240_000, 4000.00, 0.067),
            ],
        },
        Scenario {
            name: "slow-walker",
            description: "20 min/km pace, well inside the sanity ceiling",
            events: vec![
                ScenarioEvent::new(60_000, 100.00, 0.333),
                ScenarioEvent::new(120_000, 200.00, 0.333),
                ScenarioEvent::new(180_000, 300.00, 0.333),
            ],
        },
        Scenario {
            name: "impossible-pace",
            description: "Values outside physiological bounds",
            events: vec![
                ScenarioEvent::new(10_000, 1000.00, 0.030),
                ScenarioEvent::new(20_000, 2000.00, 25.0),
            ],
        },
        Scenario {
            name: "mixed-anomalies",
            description: "Frozen distance with volatile externally-computed pace",
            events: vec![
                ScenarioEvent::new(10_000, 1000.00, 0.100),
                ScenarioEvent::new(20_000, 1100.00, 0.100),
                ScenarioEvent::new(30_000, 1100.00, 0.050),
                ScenarioEvent::new(40_000, 1100.00, 0.150),
                ScenarioEvent::new(50_000, 1100.00, 0.100),
                ScenarioEvent::new(60_000, 1100.00, 0.100),
                ScenarioEvent::new(70_000, 1100.00, 0.100),
                ScenarioEvent::new(80_000, 1150.00, 0.100),
            ],
        },
    ]
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let all = scenarios();
    let selected: Vec<&Scenario> = match args.scenario.as_deref() {
        Some(name) => {
            let matched: Vec<&Scenario> = all.iter().filter(|s| s.name == name).collect();
            if matched.is_empty() {
                let names: Vec<&str> = all.iter().map(|s| s.name).collect();
                return Err(anyhow!(
                    "unknown scenario '{}' (available: {})",
                    name,
                    names.join(", ")
                ));
            }
            matched
        }
        None => all.iter().collect(),
    };

    for scenario in selected {
        println!("\nSCENARIO: {} - {}", scenario.name, scenario.description);
        println!("{:-<78}", "");
        let mut state = DetectorState::new();
        let mut suppressed = 0usize;
        for (i, event) in scenario.events.iter().enumerate() {
            let verdict = state.evaluate(event.distance_m, event.pace);
            if !verdict.show {
                suppressed += 1;
            }
            println!(
                "{:2}. {:8} | t={:>6.0} s | dist={:>8.2} m | pace={:.3} s/m | {}",
                i + 1,
                if verdict.show { "SHOW" } else { "SUPPRESS" },
                event.elapsed_ms as f64 / 1000.0,
                event.distance_m,
                event.pace,
                verdict.trail()
            );
        }
        println!(
            "result: {}/{} updates suppressed",
            suppressed,
            scenario.events.len()
        );
        info!(
            "Scenario {}: {}/{} updates suppressed",
            scenario.name,
            suppressed,
            scenario.events.len()
        );
    }
    Ok(())
}
