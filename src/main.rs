//! Weather-Station QA/QC Service - Batch Runner
//!
//! Cleans hourly weather-station records one water year at a time:
//! 1. Loads station profiles from stations.toml
//! 2. Reads raw series from PostgreSQL (wx_raw schema)
//! 3. Runs each variable's filter stages and merges flags
//! 4. Upserts vetted values and flags into the wx_qaqc schema
//! 5. Reports skipped or failed units
//!
//! Usage:
//!   cargo run --release                                   # All stations, all variables
//!   cargo run --release -- --station tetrahedron --variable swe
//!   cargo run --release -- --workers 4 --issues issues.csv --summary summary.json
//!
//! Environment:
//!   DATABASE_URL - PostgreSQL connection string
//!   RUST_LOG     - log filter (default: info)

use std::env;
use std::fs;
use std::process;
use std::sync::Arc;

use wxqc_service::config::{self, DEFAULT_CONFIG_PATH};
use wxqc_service::db::{self, PgRepository};
use wxqc_service::model::{QcError, Variable};
use wxqc_service::pipeline::{self, BatchSummary, Pipeline, PipelineConfig};
use wxqc_service::repository::{CsvComparisonWriter, CsvIssueLog};

struct Args {
    config_path: String,
    stations: Vec<String>,
    variables: Vec<Variable>,
    workers: usize,
    issues: Option<String>,
    comparisons: Option<String>,
    summary: Option<String>,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {} [--config PATH] [--station ID]... [--variable CODE]... [--workers N] \
         [--issues CSV] [--comparisons DIR] [--summary JSON]",
        program
    )
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        stations: Vec::new(),
        variables: Vec::new(),
        workers: 1,
        issues: None,
        comparisons: None,
        summary: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1) else {
            return Err(format!("{} requires a value", flag));
        };
        match flag {
            "--config" => parsed.config_path = value.clone(),
            "--station" => parsed.stations.push(value.clone()),
            "--variable" => {
                let variable = Variable::from_code(value)
                    .ok_or_else(|| format!("Unknown variable code: {}", value))?;
                parsed.variables.push(variable);
            }
            "--workers" => {
                parsed.workers = value
                    .parse()
                    .map_err(|_| format!("--workers expects a number, got {}", value))?;
            }
            "--issues" => parsed.issues = Some(value.clone()),
            "--comparisons" => parsed.comparisons = Some(value.clone()),
            "--summary" => parsed.summary = Some(value.clone()),
            _ => return Err(format!("Unknown argument: {}", flag)),
        }
        i += 2;
    }
    Ok(parsed)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🌨️  Weather-Station QA/QC Service");
    println!("=================================\n");

    let raw_args: Vec<String> = env::args().collect();
    let program = raw_args.first().map(String::as_str).unwrap_or("wxqc_service");
    let args = match parse_args(&raw_args) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("{}", usage(program));
            process::exit(1);
        }
    };

    println!("📋 Loading station profiles from {}...", args.config_path);
    let qc = match config::load_config_from(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("\n❌ {}\n", e);
            process::exit(1);
        }
    };
    println!("✓ {} station profiles loaded\n", qc.station.len());

    println!("📊 Validating database...");
    let mut repo = match PgRepository::connect() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("\n❌ Database setup failed: {}\n", e);
            process::exit(1);
        }
    };
    println!("✓ Schemas {} available\n", db::REQUIRED_SCHEMAS.join(", "));

    let batch = PipelineConfig {
        workers: args.workers.max(1),
        stations: (!args.stations.is_empty()).then(|| args.stations.clone()),
        variables: (!args.variables.is_empty()).then(|| args.variables.clone()),
    };
    let mut runner = Pipeline::with_config(qc, batch);
    if let Some(dir) = &args.comparisons {
        println!("   Comparison dumps: {}", dir);
        runner = runner.with_comparison_sink(Arc::new(CsvComparisonWriter::new(dir)));
    }

    println!("🔄 Running batch ({} workers)...", runner.config().workers);
    let result = if runner.config().workers > 1 {
        drop(repo);
        runner.run_parallel(|| PgRepository::connect().map_err(|e| QcError::Repository(e.to_string())))
    } else {
        runner.run_batch(&mut repo)
    };
    let summary = match result {
        Ok(s) => s,
        Err(e) => {
            eprintln!("\n❌ Batch failed: {}\n", e);
            process::exit(1);
        }
    };

    print_summary(&summary);

    if let Err(e) = write_outputs(&args, &summary) {
        eprintln!("\n❌ {}\n", e);
        process::exit(1);
    }
}

fn print_summary(summary: &BatchSummary) {
    println!();
    for report in &summary.reports {
        let year = report
            .water_year
            .map(|wy| format!("{}-{}", wy, wy + 1))
            .unwrap_or_else(|| "-".to_string());
        if report.outcome.is_emitted() {
            println!(
                "   ✓ {} {} {} - {} ({} flagged)",
                report.station,
                report.variable,
                year,
                report.outcome.label(),
                report.flagged_rows
            );
        } else {
            eprintln!(
                "   ✗ {} {} {} - {}: {}",
                report.station,
                report.variable,
                year,
                report.outcome.label(),
                report.detail
            );
        }
    }
    println!(
        "\n✓ Batch complete: {} of {} units emitted, {} rows written",
        summary.emitted, summary.units, summary.rows_written
    );
}

fn write_outputs(args: &Args, summary: &BatchSummary) -> Result<(), QcError> {
    if let Some(path) = &args.issues {
        let mut log = CsvIssueLog::create(path)?;
        let written = pipeline::record_issues(&summary.reports, &mut log)?;
        println!("   {} issues written to {}", written, path);
    }
    if let Some(path) = &args.summary {
        fs::write(path, summary.to_json()?)
            .map_err(|e| QcError::Repository(format!("cannot write {}: {}", path, e)))?;
        println!("   Summary written to {}", path);
    }
    Ok(())
}
