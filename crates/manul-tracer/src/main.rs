//! Manul CLI
//!
//! Inspect the traces, sessions and usage recorded by Manul Tracer.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use manul_tracer::config::Config;
use manul_tracer::db::SqliteStore;
use manul_tracer::error::Error;
use manul_tracer::models::{TraceFilter, TraceStatus};

/// Manul - tracing for LLM API calls
#[derive(Parser)]
#[command(name = "manul")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "MANUL_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL or file path (overrides the configuration)
    #[arg(long, global = true, env = "MANUL_DATABASE")]
    database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Query traces
    Traces {
        #[command(subcommand)]
        command: TracesCommands,
    },

    /// Query and close sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Show usage statistics
    Stats,

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum TracesCommands {
    /// List recent traces
    List {
        /// Session filter
        #[arg(long)]
        session: Option<String>,

        /// Model filter
        #[arg(long)]
        model: Option<String>,

        /// Status filter (pending, complete, error)
        #[arg(long)]
        status: Option<TraceStatus>,

        /// Time range (e.g. "1h", "24h", "7d")
        #[arg(long)]
        last: Option<humantime::Duration>,

        /// Maximum number of results
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show a trace with its conversation
    Show {
        /// Trace ID to display
        trace_id: String,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// List recently active sessions
    List {
        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Mark a session as ended
    End {
        /// Session ID to close
        session_id: String,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(database) = &cli.database {
        config.database.url = database_url(database);
    }

    let _guard = match manul_tracer::logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(cli.command, &config, cli.format).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn database_url(database: &str) -> String {
    if database.starts_with("sqlite:") {
        database.to_string()
    } else {
        format!("sqlite://{database}")
    }
}

async fn run(command: Commands, config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    debug!(database = %config.database.url, "Opening trace database");
    let store = SqliteStore::connect(&config.database)
        .await
        .with_context(|| format!("cannot open {}", config.database.url))?;

    match command {
        Commands::Traces { command } => run_traces(&store, command, format).await,
        Commands::Sessions { command } => run_sessions(&store, command, format).await,
        Commands::Stats => run_stats(&store, format).await,
        Commands::Db { command } => match command {
            DbCommands::Migrate => {
                store.migrate().await.context("migration failed")?;
                println!("Database is up to date: {}", config.database.url);
                Ok(())
            }
        },
    }
}

async fn run_traces(
    store: &SqliteStore,
    command: TracesCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        TracesCommands::List {
            session,
            model,
            status,
            last,
            limit,
        } => {
            let since = last
                .map(|last| chrono::Duration::from_std(last.into()))
                .transpose()
                .context("time range is too large")?
                .map(|range| Utc::now() - range);

            let filter = TraceFilter {
                session_id: session,
                model_id: model,
                status,
                since,
                limit: Some(limit),
                ..TraceFilter::default()
            };
            let traces = store.list_traces(&filter).await?;

            if matches!(format, OutputFormat::Json) {
                return print_json(&traces);
            }
            if traces.is_empty() {
                println!("No traces found");
                return Ok(());
            }

            println!(
                "{:<36}  {:<20}  {:<8}  {:>7}  {:>10}  {:>10}  {:>4}",
                "TRACE", "MODEL", "STATUS", "TOKENS", "LATENCY", "COST", "MSGS"
            );
            for trace in &traces {
                println!(
                    "{:<36}  {:<20}  {:<8}  {:>7}  {:>10}  {:>10}  {:>4}",
                    trace.trace_id,
                    trace.model_id.as_deref().unwrap_or("-"),
                    trace.trace_status,
                    trace.total_tokens,
                    trace
                        .total_latency_ms
                        .map_or_else(|| "-".to_string(), |ms| format!("{ms:.0}ms")),
                    trace
                        .cost_usd
                        .map_or_else(|| "-".to_string(), |cost| format!("${cost:.6}")),
                    trace.conversation_length,
                );
            }
        }
        TracesCommands::Show { trace_id } => {
            let trace = store
                .get_trace(&trace_id)
                .await?
                .ok_or_else(|| Error::not_found("trace", &trace_id))?;

            if matches!(format, OutputFormat::Json) {
                return print_json(&trace);
            }

            println!("Trace     {}", trace.trace_id);
            println!("Session   {}", trace.session_id);
            println!("Model     {}", trace.model_id.as_deref().unwrap_or("-"));
            println!("Status    {}", trace.trace_status);
            if let Some(endpoint) = &trace.endpoint {
                println!("Endpoint  {endpoint}");
            }
            println!(
                "Tokens    {} prompt / {} completion / {} total",
                trace.prompt_tokens.unwrap_or(0),
                trace.completion_tokens.unwrap_or(0),
                trace.total_tokens.unwrap_or(0)
            );
            if let Some(latency) = trace.total_latency_ms {
                println!("Latency   {latency:.0}ms");
            }
            if let Some(cost) = trace.cost_usd {
                println!("Cost      ${cost:.6}");
            }
            if let Some(category) = &trace.error_category {
                println!(
                    "Error     {category} ({}): {}",
                    trace.error_code.as_deref().unwrap_or("-"),
                    trace.error_message.as_deref().unwrap_or("")
                );
            }
            if let Some(score) = trace.data_completeness_score {
                println!("Complete  {:.0}%", score * 100.0);
            }

            println!();
            for message in &trace.conversation {
                let tokens = message
                    .token_count
                    .map(|count| format!(" ({count} tokens)"))
                    .unwrap_or_default();
                println!("[{}]{tokens} {}", message.role, message.text());
            }
            for image in &trace.images {
                println!(
                    "[image] {} {} {:.2}MB",
                    image.format,
                    image.image_hash,
                    image.size_mb()
                );
            }
        }
    }
    Ok(())
}

async fn run_sessions(
    store: &SqliteStore,
    command: SessionsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        SessionsCommands::List { limit } => {
            let sessions = store.list_sessions(limit).await?;

            if matches!(format, OutputFormat::Json) {
                return print_json(&sessions);
            }
            if sessions.is_empty() {
                println!("No sessions found");
                return Ok(());
            }

            println!(
                "{:<36}  {:<8}  {:>8}  {:>9}  {:>10}  {}",
                "SESSION", "STATE", "REQUESTS", "TOKENS", "COST", "LAST ACTIVITY"
            );
            for session in &sessions {
                println!(
                    "{:<36}  {:<8}  {:>8}  {:>9}  {:>10}  {}",
                    session.session_id,
                    if session.is_active() { "active" } else { "ended" },
                    session.total_requests,
                    session.total_tokens,
                    format!("${:.4}", session.total_cost),
                    session
                        .last_activity_at
                        .map_or_else(|| "-".to_string(), |at| at.to_rfc3339()),
                );
            }
        }
        SessionsCommands::End { session_id } => {
            if store.end_session(&session_id, Utc::now()).await? {
                println!("Session {session_id} ended");
            } else {
                return Err(Error::not_found("active session", session_id).into());
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    #[serde(flatten)]
    totals: manul_tracer::models::StoreStatistics,
    latency: manul_tracer::models::LatencyStatistics,
    models: Vec<manul_tracer::models::ModelUsage>,
}

async fn run_stats(store: &SqliteStore, format: OutputFormat) -> anyhow::Result<()> {
    let report = StatsReport {
        totals: store.statistics().await?,
        latency: store.latency_statistics(None).await?,
        models: store.token_usage_by_model().await?,
    };

    if matches!(format, OutputFormat::Json) {
        return print_json(&report);
    }

    let totals = &report.totals;
    println!(
        "Traces     {} ({} ok, {} failed, {:.1}% success)",
        totals.total_traces,
        totals.successful_traces,
        totals.failed_traces,
        totals.success_rate()
    );
    println!(
        "Sessions   {} ({} active)",
        totals.total_sessions, totals.active_sessions
    );
    println!(
        "Tokens     {} prompt / {} completion / {} total",
        totals.total_prompt_tokens, totals.total_completion_tokens, totals.total_tokens
    );
    println!("Cost       ${:.4}", totals.total_cost);
    if let (Some(p50), Some(p95)) = (report.latency.p50_ms, report.latency.p95_ms) {
        println!("Latency    p50 {p50:.0}ms / p95 {p95:.0}ms");
    }

    if !report.models.is_empty() {
        println!();
        println!(
            "{:<28}  {:>8}  {:>10}  {:>10}",
            "MODEL", "REQUESTS", "TOKENS", "COST"
        );
        for usage in &report.models {
            println!(
                "{:<28}  {:>8}  {:>10}  {:>10}",
                usage.model_id,
                usage.request_count,
                usage.total_tokens,
                format!("${:.4}", usage.total_cost)
            );
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
