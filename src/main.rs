//! promql-engine CLI
//!
//! Loads a data script into memory and evaluates PromQL against it:
//! - Instant queries
//! - Range queries
//! - Print the default configuration

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use promql_engine::config::{expand_path, generate_default_config, Config, LoggingConfig};
use promql_engine::query::{Context, Engine, QueryOutput, ValueType};
use promql_engine::storage::{load_script, MemoryStorage};

#[derive(Parser)]
#[command(name = "promql-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate PromQL queries against a data script")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Load script with the series to query
    #[arg(short, long, global = true)]
    pub data: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate an instant query
    Query {
        /// PromQL expression
        expr: String,
        /// Evaluation time in seconds (default: now)
        #[arg(short, long)]
        time: Option<f64>,
    },

    /// Evaluate a range query
    QueryRange {
        /// PromQL expression
        expr: String,
        /// Start time in seconds
        #[arg(long)]
        start: f64,
        /// End time in seconds
        #[arg(long)]
        end: f64,
        /// Resolution step in seconds
        #[arg(long, default_value = "60")]
        step: f64,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let output = match &cli.command {
        Commands::Config => {
            print!("{}", generate_default_config());
            return Ok(());
        }
        Commands::Query { expr, time } => {
            let (engine, storage) = setup(&cli)?;
            let ts = match time {
                Some(secs) => seconds_to_millis(*secs)?,
                None => chrono::Utc::now().timestamp_millis(),
            };
            let query = engine.new_instant_query(storage, expr, ts)?;
            let result = query.exec(&Context::background()).await;
            engine.shutdown();
            result?
        }
        Commands::QueryRange {
            expr,
            start,
            end,
            step,
        } => {
            let (engine, storage) = setup(&cli)?;
            let query = engine.new_range_query(
                storage,
                expr,
                seconds_to_millis(*start)?,
                seconds_to_millis(*end)?,
                seconds_to_millis(*step)?,
            )?;
            let result = query.exec(&Context::background()).await;
            engine.shutdown();
            result?
        }
    };

    println!("{}", serde_json::to_string_pretty(&render(&output))?);
    Ok(())
}

/// Load configuration, install logging and build the engine and its data
fn setup(cli: &Cli) -> Result<(Engine, Arc<MemoryStorage>)> {
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_default(),
    };
    init_logging(&config.logging)?;

    let storage = MemoryStorage::new();
    if let Some(path) = &cli.data {
        let script = fs::read_to_string(path)
            .with_context(|| format!("Failed to read data script {}", path.display()))?;
        load_script(&storage, &script)?;
        tracing::debug!(
            series = storage.series_count(),
            samples = storage.sample_count(),
            "Loaded data script"
        );
    }

    let engine = Engine::from_config(&config.engine)?;
    Ok((engine, Arc::new(storage)))
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let writer = match &logging.file {
        Some(path) => {
            let path = expand_path(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::options()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    match logging.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init(),
        other => bail!("Unknown log format: {}", other),
    }
    Ok(())
}

fn seconds_to_millis(secs: f64) -> Result<i64> {
    if !secs.is_finite() {
        bail!("Invalid time: {}", secs);
    }
    Ok((secs * 1000.0).round() as i64)
}

fn render(output: &QueryOutput) -> serde_json::Value {
    json!({
        "resultType": result_type(output.value.value_type()),
        "result": &output.value,
        "warnings": &output.warnings,
        "stats": output.stats.to_json(),
    })
}

fn result_type(t: ValueType) -> &'static str {
    match t {
        ValueType::Scalar => "scalar",
        ValueType::Vector => "vector",
        ValueType::Matrix => "matrix",
        ValueType::String => "string",
    }
}
