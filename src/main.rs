//! # Research Harness CLI (`rh`)
//!
//! ## Usage
//!
//! ```bash
//! rh --config ./config/rh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rh init` | Create the SQLite database and run schema migrations |
//! | `rh index <repo> <dir>` | Chunk, embed, and index a directory as a repository |
//! | `rh context "<query>" --repo <repo>` | Print ranked context chunks |
//! | `rh research "<query>"` | Run a research task and print the cited report |
//! | `rh providers` | List providers with capabilities and availability |
//! | `rh serve` | Start the HTTP server |
//!
//! Logs and progress go to stderr; stdout carries only results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use research_harness::config;
use research_harness::engine::ResearchEngine;
use research_harness::ingest;
use research_harness::progress::{ProgressEvent, ProgressMode};
use research_harness::retriever::RetrievalOptions;
use research_harness::server;
use research_harness::sqlite_store::SqliteIndex;
use research_harness_core::models::TaskOptions;
use research_harness_core::task::TaskStage;

/// Research Harness: multi-agent research with retrieval-augmented context.
#[derive(Parser)]
#[command(name = "rh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index a directory as a repository.
    ///
    /// Files are classified as documentation or code by extension,
    /// chunked on paragraph boundaries, embedded when an embedding
    /// provider is configured, and written to the index.
    Index {
        repository_id: String,
        dir: PathBuf,

        /// Drop the repository's existing chunks first.
        #[arg(long)]
        full: bool,

        /// Progress output: off, human, or json. Defaults to human on a TTY.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Print ranked context chunks for a query.
    Context {
        query: String,

        #[arg(long = "repo")]
        repository_id: String,

        #[arg(short = 'k', long)]
        k: Option<usize>,

        #[arg(long)]
        no_docs: bool,

        #[arg(long)]
        no_code: bool,

        /// Print the full result as JSON instead of prompt context.
        #[arg(long)]
        json: bool,
    },

    /// Run a research task to completion and print the report.
    Research {
        query: String,

        /// Repository to consult for internal context.
        #[arg(long = "repo")]
        repository_id: Option<String>,

        #[arg(long)]
        max_subagents: Option<usize>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Overall task timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        no_web: bool,

        #[arg(long)]
        no_context: bool,

        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Status poll interval in milliseconds.
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },

    /// List providers with capabilities, availability, and models.
    Providers {
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("invalid progress mode '{}': use off, human, or json", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            research_harness::migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            repository_id,
            dir,
            full,
            progress,
        } => {
            let pool = research_harness::db::connect(&cfg).await?;
            research_harness::migrate::migrate_pool(&pool).await?;
            let index = SqliteIndex::new(pool.clone());
            let embedder = research_harness::embedding::create_embedder(&cfg.embedding)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();

            let stats = ingest::index_directory(
                &index,
                embedder.as_deref(),
                cfg.embedding.batch_size,
                &cfg.indexing,
                &repository_id,
                &dir,
                full,
                reporter.as_ref(),
            )
            .await?;

            println!("index {}", repository_id);
            println!("  files indexed: {}", stats.files);
            println!("  files skipped: {}", stats.skipped);
            println!("  chunks written: {}", stats.chunks);
            if embedder.is_some() {
                println!("  chunks embedded: {}", stats.embedded);
            }
            if full {
                println!("  chunks removed: {}", stats.removed);
            }
            println!("ok");
            pool.close().await;
        }
        Commands::Context {
            query,
            repository_id,
            k,
            no_docs,
            no_code,
            json,
        } => {
            let engine = ResearchEngine::from_config(cfg).await?;
            let opts = RetrievalOptions {
                use_docs: !no_docs,
                use_code: !no_code,
            };
            let result = engine.get_context(&query, &repository_id, k, opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.is_empty() {
                println!("No context found.");
            } else {
                println!("{}", result.to_prompt_context());
            }
        }
        Commands::Research {
            query,
            repository_id,
            max_subagents,
            max_iterations,
            timeout,
            no_web,
            no_context,
            progress,
            json,
            poll_ms,
        } => {
            let engine = ResearchEngine::from_config(cfg).await?;
            let options = TaskOptions {
                max_subagents,
                max_iterations,
                timeout_secs: timeout,
                repository_id,
                use_web: !no_web,
                use_context: !no_context,
            };
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            run_research(&engine, &query, options, reporter.as_ref(), json, poll_ms).await?;
        }
        Commands::Providers { json } => {
            let engine = ResearchEngine::from_config(cfg).await?;
            let providers = engine.list_providers().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&providers)?);
            } else if providers.is_empty() {
                println!("No providers configured.");
            } else {
                println!("{:<16} {:<14} {:<10} MODELS", "PROVIDER", "CAPABILITIES", "STATUS");
                for p in providers {
                    let caps: Vec<&str> = p.capabilities.iter().map(|c| c.as_str()).collect();
                    println!(
                        "{:<16} {:<14} {:<10} {}",
                        p.name,
                        caps.join(","),
                        if p.available { "OK" } else { "DOWN" },
                        p.models.join(", ")
                    );
                }
            }
        }
        Commands::Serve => {
            let engine = Arc::new(ResearchEngine::from_config(cfg).await?);
            server::run_server(engine).await?;
        }
    }

    Ok(())
}

/// Start a task and poll it to a terminal stage. Ctrl-C requests
/// cancellation and keeps polling until the task acknowledges.
async fn run_research(
    engine: &ResearchEngine,
    query: &str,
    options: TaskOptions,
    reporter: &dyn research_harness::progress::ProgressReporter,
    json: bool,
    poll_ms: u64,
) -> Result<()> {
    let task_id = engine.start_task(query, options).await?;
    let mut interval = tokio::time::interval(Duration::from_millis(poll_ms.max(50)));
    let mut last_seen = None;
    let mut cancel_sent = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let status = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c, if !cancel_sent => {
                eprintln!("cancelling {}...", task_id);
                engine.cancel_task(&task_id).await?;
                cancel_sent = true;
            }
        }
        let status = engine.get_status(&task_id).await?;
        if last_seen != Some(status.updated_at) {
            last_seen = Some(status.updated_at);
            reporter.report(ProgressEvent::Research(status.clone()));
        }
        if status.stage.is_terminal() {
            break status;
        }
    };

    match status.stage {
        TaskStage::Completed => {
            let report = engine.get_result(&task_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.content);
            }
            Ok(())
        }
        TaskStage::Cancelled => {
            eprintln!(
                "task {} cancelled with {} partial sources",
                task_id,
                status.partial_sources.len()
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Ok(())
        }
        _ => bail!(
            "task {} failed: {}",
            task_id,
            status.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
