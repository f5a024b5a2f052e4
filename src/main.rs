//! CLI entry point for the grade risk report tool.
//!
//! Reads a grade table, scores every student, trains the risk classifier and
//! keeps the resulting workbook in a session-scoped report store.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use grade_risk_report::config::{PipelineConfig, StoreConfig, DEFAULT_SESSION};
use grade_risk_report::{db, pipeline, report};

#[derive(Parser)]
#[command(name = "grade-risk-report")]
#[command(about = "Grade averages, study advice and risk prediction for a class roster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the report store schema
    InitDb,
    /// Build a report from a DOCX, XLSX or CSV grade table
    Generate {
        #[arg(long, value_name = "FILE")]
        document: PathBuf,
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
        /// Write the HTML preview table to this file
        #[arg(long)]
        html: Option<PathBuf>,
        /// Write rows and accuracy as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
        /// Also write the workbook to this file
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Synthetic copies generated per student
        #[arg(long, default_value_t = 5)]
        replication: usize,
        /// Skip saving the report to the store
        #[arg(long, default_value_t = false)]
        no_store: bool,
    },
    /// Fetch the latest report of a session
    Download {
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print the rows of the downloaded workbook
        #[arg(long, default_value_t = false)]
        show: bool,
    },
    /// Delete reports past their expiry
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let (pool, _) = connect().await?;
            db::init_db(&pool).await?;
            println!("Report store ready.");
        }
        Commands::Generate {
            document,
            session,
            html,
            json,
            out,
            seed,
            replication,
            no_store,
        } => {
            let session = db::normalize_session(&session)?;
            let config = PipelineConfig {
                seed,
                replication_factor: replication,
                ..PipelineConfig::default()
            };

            let generated = pipeline::run_document(&document, &config)
                .with_context(|| format!("failed to build report from {}", document.display()))?;
            print!("{}", report::render_summary(&generated));

            if let Some(path) = html {
                write_file(&path, generated.html.as_bytes())?;
                println!("HTML preview written to {}.", path.display());
            }
            if let Some(path) = json {
                write_file(&path, report::render_json(&generated, Utc::now())?.as_bytes())?;
                println!("JSON export written to {}.", path.display());
            }
            if let Some(path) = out {
                write_file(&path, &generated.spreadsheet)?;
                println!("Workbook written to {}.", path.display());
            }

            if no_store {
                info!("report not stored (--no-store)");
            } else {
                let (pool, store) = connect().await?;
                let stored = db::save_report(&pool, &session, &generated, store.report_ttl).await?;
                println!(
                    "Report {} stored for session '{}' until {}.",
                    stored.id, stored.session, stored.expires_at
                );
            }
        }
        Commands::Download { session, out, show } => {
            let session = db::normalize_session(&session)?;
            let (pool, _) = connect().await?;
            let stored = match db::fetch_latest_report(&pool, &session, Utc::now()).await {
                Ok(stored) => stored,
                Err(err) => {
                    if db::is_missing_report(&err) {
                        warn!(session = %session, "download requested without a stored report");
                    } else {
                        error!(session = %session, error = %err, "report lookup failed");
                    }
                    return Err(err);
                }
            };

            let path = out.unwrap_or_else(|| PathBuf::from(&stored.file_name));
            write_file(&path, &stored.spreadsheet)?;
            println!(
                "Downloaded report {} ({} students) to {}.",
                stored.id,
                stored.row_count,
                path.display()
            );

            if show {
                for row in report::read_spreadsheet(&stored.spreadsheet)? {
                    println!(
                        "- {} | {} | {:.2} | {} | {}",
                        row.student_name,
                        row.grades,
                        row.average,
                        row.advice,
                        row.predicted_risk.text()
                    );
                }
            }
        }
        Commands::Purge => {
            let (pool, _) = connect().await?;
            let deleted = db::purge_expired(&pool, Utc::now()).await?;
            println!("Deleted {deleted} expired reports.");
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<(PgPool, StoreConfig)> {
    let store = StoreConfig::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(store.max_connections)
        .connect(&store.database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok((pool, store))
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Colored stderr output plus a daily JSON log file.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/grade_risk_report.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"))
        .to_path_buf();
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("grade_risk_report.log"))
        .to_os_string();

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter("RUST_LOG", "warn"));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(env_filter("RUST_LOG_JSON", "debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

fn env_filter(var: &str, default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(var).unwrap_or_else(|_| EnvFilter::new(default_level))
}
