use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

use powerwatch::config::Config;
use powerwatch::detect::DetectionReport;
use powerwatch::ml::ModelSnapshot;
use powerwatch::models::{Reading, Severity};
use powerwatch::notify::{AlertDispatcher, LogSink};
use powerwatch::PowerWatch;

#[derive(Parser)]
#[command(name = "powerwatch")]
#[command(author, version, about = "Anomaly detection for power-meter readings")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run detection over a batch of readings
    Detect {
        /// JSON file with an array of readings
        #[arg(short, long)]
        readings: PathBuf,

        /// Trained model snapshot
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Fit the model on these readings before detecting
        #[arg(long)]
        train: Option<PathBuf>,

        /// Also run flat recent-window peak and spike checks
        #[arg(long)]
        recent: bool,

        /// Skip configured threshold checks
        #[arg(long)]
        no_thresholds: bool,

        /// Send alert-worthy anomalies to the log sink
        #[arg(long)]
        notify: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: OutputFormat,
    },

    /// Fit the learned model and save a snapshot
    Train {
        /// JSON file with an array of historical readings
        #[arg(short, long)]
        readings: PathBuf,

        /// Where to write the snapshot
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show details of a saved model
    Info {
        /// Model snapshot
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Generate default configuration file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Actual")]
    actual: String,
    #[tabled(rename = "Expected")]
    expected: String,
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Detect {
            readings,
            model,
            train,
            recent,
            no_thresholds,
            notify,
            format,
        } => cmd_detect(
            config,
            &readings,
            model.as_deref(),
            train.as_deref(),
            recent,
            !no_thresholds,
            notify,
            format,
        ),
        Commands::Train { readings, output } => cmd_train(config, &readings, &output),
        Commands::Info { model } => cmd_info(config, &model),
        Commands::Config { output } => cmd_gen_config(output),
    }
}

fn load_readings(path: &Path) -> Result<Vec<Reading>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read readings file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse readings file: {}", path.display()))
}

#[allow(clippy::too_many_arguments)]
fn cmd_detect(
    config: Config,
    readings: &Path,
    model: Option<&Path>,
    train: Option<&Path>,
    recent: bool,
    thresholds: bool,
    notify: bool,
    format: OutputFormat,
) -> Result<()> {
    let alerting = config.alerting.clone();
    let pw = match model {
        Some(path) => PowerWatch::with_snapshot(config, ModelSnapshot::load(path)?),
        None => PowerWatch::new(config),
    }
    .thresholds(thresholds)
    .recent_window(recent);

    if let Some(path) = train {
        pw.train(&load_readings(path)?)?;
    }

    let batch = load_readings(readings)?;
    let report = pw.detect(&batch);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }

    if notify {
        let mut dispatcher = AlertDispatcher::new(LogSink, &alerting);
        let summary = dispatcher.dispatch(&report);
        dispatcher.send_summary(&report)?;
        eprintln!(
            "Alerts: {} sent, {} suppressed, {} failed",
            summary.sent, summary.suppressed, summary.failed
        );
    }

    Ok(())
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Low => severity.as_str().normal().to_string(),
        Severity::Medium => severity.as_str().yellow().to_string(),
        Severity::High => severity.as_str().red().to_string(),
        Severity::Critical => severity.as_str().red().bold().to_string(),
    }
}

fn print_report(report: &DetectionReport) {
    println!("{}", "=== Detection Report ===".bold());
    println!("Anomalies: {}", report.total_anomalies.to_string().yellow());
    if report.insufficient_data {
        println!("{}", "Batch too small for statistical detectors".yellow());
    }
    for degraded in &report.degraded {
        println!(
            "{} {}: {}",
            "Degraded".red().bold(),
            degraded.detector,
            degraded.reason
        );
    }

    if report.anomalies.is_empty() {
        println!("{}", "No anomalies detected".green().bold());
        return;
    }

    let rows: Vec<AnomalyRow> = report
        .anomalies
        .iter()
        .map(|a| AnomalyRow {
            time: a.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            device: a.device_id.clone(),
            kind: a.kind.to_string(),
            severity: severity_label(a.severity),
            actual: format!("{:.2}", a.actual_value),
            expected: a.expected.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

fn cmd_train(config: Config, readings: &Path, output: &Path) -> Result<()> {
    let pw = PowerWatch::new(config);
    let info = pw.train(&load_readings(readings)?)?;

    let snapshot = pw
        .model()
        .snapshot()
        .context("Model has no snapshot after training")?;
    snapshot.save(output)?;

    println!(
        "{} ({} samples) written to {}",
        "Model trained".green().bold(),
        info.sample_count.unwrap_or_default(),
        output.display()
    );
    Ok(())
}

fn cmd_info(config: Config, model: &Path) -> Result<()> {
    let pw = PowerWatch::with_snapshot(config, ModelSnapshot::load(model)?);
    println!("{}", serde_json::to_string_pretty(&pw.model().info())?);
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}
