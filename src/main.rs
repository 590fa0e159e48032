//! # Paperline CLI (`paperline`)
//!
//! ## Usage
//!
//! ```bash
//! paperline --config ./config/paperline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `paperline init` | Create the SQLite database and run schema migrations |
//! | `paperline submit <ref>` | Record an upload and process it to a terminal state |
//! | `paperline status <ref>` | Print the status of a document's current attempt |
//! | `paperline work` | Process pending documents until Ctrl-C (`--once` for a single pass) |
//! | `paperline serve` | Start the HTTP server |
//! | `paperline reference import <file>` | Upsert vendors, SOWs, milestones, deliverables |
//! | `paperline stats` | Print documents per state and findings per severity |
//!
//! `submit` and `status` print JSON to stdout; logs go to stderr
//! (`RUST_LOG`, default `paperline=info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use paperline::models::{DocumentType, UploadEvent};
use paperline::orchestrator::Orchestrator;
use paperline::{config, db, migrate, reference, server, stats};

/// Paperline — ingestion and validation pipeline for invoices and statements of work.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/paperline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "paperline",
    about = "Paperline — ingestion and validation pipeline for invoices and statements of work",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/paperline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Record an upload for a document and process it.
    ///
    /// Resubmitting a document whose attempt is still running is a no-op;
    /// resubmitting a finished document requires `--force`.
    Submit {
        /// Document reference (the extraction service's storage key).
        document_ref: String,

        /// Declared document type: `invoice` or `sow`. Inferred when omitted.
        #[arg(long = "type")]
        document_type: Option<DocumentType>,

        /// Start a new attempt even if the document already finished.
        #[arg(long)]
        force: bool,

        /// Only record the upload; leave processing to `paperline work`.
        #[arg(long)]
        no_process: bool,
    },

    /// Show the state of a document's current attempt.
    Status {
        document_ref: String,
    },

    /// Process pending documents.
    Work {
        /// Run a single pass over pending work and exit.
        #[arg(long)]
        once: bool,
    },

    /// Start the HTTP server.
    Serve,

    /// Manage reference data (vendors, SOWs, milestones, deliverables).
    Reference {
        #[command(subcommand)]
        action: ReferenceAction,
    },

    /// Print pipeline statistics.
    Stats,
}

#[derive(Subcommand)]
enum ReferenceAction {
    /// Upsert reference data from a TOML file.
    Import {
        file: PathBuf,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paperline=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Submit {
            document_ref,
            document_type,
            force,
            no_process,
        } => {
            let pool = db::connect(&cfg).await?;
            let orchestrator = Orchestrator::from_config(&cfg, pool)?;
            let event = UploadEvent::new(document_ref.clone(), document_type);

            let submission = orchestrator
                .submit(&event, force)
                .await
                .with_context(|| format!("failed to submit {}", document_ref))?;

            match &submission.claim {
                Some(claim) if no_process => orchestrator.gateway().release(claim).await?,
                Some(claim) => {
                    orchestrator
                        .process(claim)
                        .await
                        .with_context(|| format!("processing {} was abandoned", document_ref))?;
                }
                None => {}
            }

            print_json(&serde_json::json!({
                "submission": submission,
                "status": orchestrator.status(&document_ref).await?,
            }))?;
        }
        Commands::Status { document_ref } => {
            let pool = db::connect(&cfg).await?;
            let gateway = paperline::gateway::Gateway::new(pool, cfg.pipeline.lease());
            match gateway.status(&document_ref).await? {
                Some(report) => print_json(&report)?,
                None => anyhow::bail!("no document with ref: {}", document_ref),
            }
        }
        Commands::Work { once } => {
            let pool = db::connect(&cfg).await?;
            let orchestrator = Orchestrator::from_config(&cfg, pool)?;
            if once {
                let summary = orchestrator.run_once().await?;
                print_json(&summary)?;
            } else {
                orchestrator.run_worker().await?;
            }
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            let orchestrator = Orchestrator::from_config(&cfg, pool)?;
            server::run_server(&cfg, orchestrator).await?;
        }
        Commands::Reference { action } => match action {
            ReferenceAction::Import { file } => {
                let pool = db::connect(&cfg).await?;
                let summary = reference::import_file(&pool, &file).await?;
                println!(
                    "Imported {} vendors, {} SOWs, {} milestones, {} deliverables.",
                    summary.vendors, summary.sows, summary.milestones, summary.deliverables
                );
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
