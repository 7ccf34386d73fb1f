use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowgnn::batch::{self, BatchClassifier};
use flowgnn::config::{FlowGnnConfig, LoggingConfig};
use flowgnn::trainer::IncrementalTrainer;

#[derive(Parser)]
#[command(
    name = "flowgnn",
    about = "Online graph-network anomaly scoring for Cilium flow telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $FLOWGNN_CONFIG, then /etc/flowgnn/flowgnn.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OTLP receiver and online trainer
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Extract flows from an OTLP JSON export and print them as JSON
    Extract {
        /// OTLP export file
        #[arg(long)]
        input: PathBuf,
    },

    /// Train the online model on flows from a file, one flow at a time
    Train {
        /// OTLP export or JSON array of traces
        #[arg(long)]
        input: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Fit the batch k-NN classifier and report per-flow predictions
    Classify {
        /// OTLP export or JSON array of traces
        #[arg(long, conflicts_with = "db")]
        input: Option<PathBuf>,

        /// Read flows from a flowgnn database instead
        #[arg(long)]
        db: Option<PathBuf>,

        /// Neighbours per flow in the similarity graph
        #[arg(long)]
        k: Option<usize>,

        /// Training epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Skip the port-diversity feature (no timestamps needed)
        #[arg(long)]
        no_diversity: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = FlowGnnConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind, db } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.server.db_path = db;
            }
            tracing::info!(bind = %config.server.bind, "Starting flowgnn");
            flowgnn::serve(&config).await?;
        }
        Commands::Extract { input } => {
            let traces = flowgnn::load_traces(&input)?;
            println!("{}", serde_json::to_string_pretty(&traces)?);
        }
        Commands::Train { input, json } => {
            let traces = flowgnn::load_traces(&input)?;
            let mut trainer = IncrementalTrainer::from_config(&config);
            tracing::info!(flows = traces.len(), "Training online model");

            let mut outcomes = Vec::with_capacity(traces.len());
            for trace in &traces {
                outcomes.push(trainer.train_one(trace).map_err(|e| e.to_string()));
            }
            let stats = trainer.stats();

            if json {
                let rows: Vec<_> = outcomes
                    .iter()
                    .map(|o| match o {
                        Ok(out) => serde_json::json!(out),
                        Err(e) => serde_json::json!({ "error": e }),
                    })
                    .collect();
                let report = serde_json::json!({ "outcomes": rows, "stats": stats });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{:<6} | {:<10} | {:<10} | Source -> Destination", "Flow", "Loss", "P(anom)");
                println!("{:-<6}-|-{:-<10}-|-{:-<10}-|-{:-<40}", "", "", "", "");
                for (i, (trace, outcome)) in traces.iter().zip(&outcomes).enumerate() {
                    match outcome {
                        Ok(out) => println!(
                            "{:<6} | {:<10.5} | {:<10.5} | {} -> {}",
                            i, out.loss, out.anomaly_probability, trace.ip_source, trace.ip_destination
                        ),
                        Err(e) => println!("{:<6} | {:<10} | {:<10} | {}", i, "-", "-", e),
                    }
                }
                println!(
                    "\nTrained {} of {} flows; mean loss {}",
                    stats.trained,
                    stats.calls,
                    stats
                        .mean_loss
                        .map_or_else(|| "n/a".to_string(), |l| format!("{l:.5}"))
                );
            }
        }
        Commands::Classify {
            input,
            db,
            k,
            epochs,
            no_diversity,
            json,
        } => {
            let traces = match (input, db) {
                (Some(path), _) => flowgnn::load_traces(&path)?,
                (None, Some(db)) => {
                    let pool = flowgnn::storage::open_pool(&db)?;
                    flowgnn::storage::all_traces(&pool)?
                }
                (None, None) => bail!("either --input or --db is required"),
            };

            if let Some(k) = k {
                config.batch.k = k;
            }
            if let Some(epochs) = epochs {
                config.batch.epochs = epochs;
            }
            if no_diversity {
                config.batch.use_diversity_index = false;
            }

            let dataset = batch::preprocess(&traces, &config.batch)
                .context("failed to encode flows (try --no-diversity if timestamps are missing)")?;
            let mut classifier = BatchClassifier::from_config(&config);
            let report = classifier.fit(&dataset)?;
            let predictions = classifier.predict(&dataset)?;
            let accuracy = batch::accuracy(&predictions, &dataset.labels);

            if json {
                let out = serde_json::json!({
                    "predictions": predictions,
                    "accuracy": accuracy,
                    "fit": report,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (i, class) in predictions.iter().enumerate() {
                    println!("Trace {} is predicted as {}", i, class);
                }
                println!(
                    "\n{} flows, {} edges, {} epochs{}; accuracy against labels {:.3}",
                    dataset.len(),
                    report.edges,
                    report.epochs_run,
                    if report.stopped_early { " (stopped early)" } else { "" },
                    accuracy
                );
            }
        }
    }

    Ok(())
}
