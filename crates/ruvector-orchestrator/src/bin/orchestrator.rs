//! Orchestrator binary
//!
//! Run with: cargo run -p ruvector-orchestrator -- notes.txt scans/ batch.zip

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ruvector_orchestrator::{
    JobDescriptor, Orchestrator, OrchestratorConfig, PlainTextProcessor, ProcessingOptions,
    TaskId, TaskStatus,
};

#[derive(Parser)]
#[command(name = "ruvector-orchestrator")]
#[command(about = "Process documents, directories and zip archives with live progress", long_about = None)]
struct Args {
    /// Files, directories or zip archives to process
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Jobs allowed in their heavy stage at once (overrides the config file)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Skip the VLM refinement stage
    #[arg(long)]
    no_vlm: bool,

    /// Only process the first N pages of each document
    #[arg(long)]
    max_pages: Option<u32>,

    /// Progress refresh interval in milliseconds
    #[arg(long, default_value = "500")]
    refresh_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ruvector_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(max_concurrent) = args.max_concurrent {
        config.processing.max_concurrent_jobs = max_concurrent;
    }

    let processor = Arc::new(PlainTextProcessor::new());
    let orchestrator = Orchestrator::new(config, processor.clone())?;
    let options = ProcessingOptions {
        vlm_refinement: !args.no_vlm,
        max_pages: args.max_pages,
    };

    let mut ids = Vec::with_capacity(args.sources.len());
    for source in &args.sources {
        let job = JobDescriptor::new(source).with_options(options.clone());
        let id = orchestrator
            .submit(job)
            .with_context(|| format!("Failed to submit {}", source.display()))?;
        ids.push(id);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.refresh_ms.max(50)));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::warn!("Interrupted, cancelling all tasks");
                orchestrator.cancel_all();
                break;
            }
            _ = ticker.tick() => {
                print_progress(&orchestrator, &ids);
                if all_finished(&orchestrator, &ids) {
                    break;
                }
            }
        }
    }

    orchestrator.shutdown().await;

    let trees = ids
        .iter()
        .map(|id| orchestrator.query_tree(*id))
        .collect::<ruvector_orchestrator::Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&trees)?);

    let stats = orchestrator.stats();
    tracing::info!(
        "Done: {} completed, {} failed, {} cancelled, {} pages indexed",
        stats.tasks.completed,
        stats.tasks.failed,
        stats.tasks.cancelled,
        processor.indexed_pages().len()
    );

    if stats.tasks.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_progress(orchestrator: &Orchestrator, ids: &[TaskId]) {
    for id in ids {
        let Ok(task) = orchestrator.query(*id) else {
            continue;
        };
        eprintln!(
            "{:<10} {:>3}% {:<10} {:<20} {}",
            id.to_string(),
            task.progress_percentage,
            task.status.as_str(),
            task.stage.as_str(),
            task.message
        );

        if task.is_batch_parent && task.status == TaskStatus::Running {
            eprintln!(
                "{:<10} files {}/{}",
                "",
                task.processed_files,
                task.total_files
            );
        }
    }
}

fn all_finished(orchestrator: &Orchestrator, ids: &[TaskId]) -> bool {
    ids.iter().all(|id| {
        orchestrator
            .query(*id)
            .map(|task| task.is_terminal())
            .unwrap_or(true)
    })
}
