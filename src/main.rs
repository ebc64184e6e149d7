use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recall::config::{self, ChunkMode, Config};
use recall::ingest::{DocumentExtractor, PlainTextExtractor};
use recall::lock::{DirLock, LockMode};
use recall::records::Metadata;
use recall::semantic::{Chunker, Embedder, RetrievalService};

mod cli;

use cli::Command;

const PROGRESS_TEMPLATE: &str = "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({eta})";

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recall=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Args::parse();

    let base_path = config::base_path()?;
    let config = Config::load_with(&base_path)?;
    tracing::debug!(base_path = %base_path.display(), model = %config.embedder.model, "config loaded");

    let _lock = if args.command.is_mutating() {
        let mode = if args.wait { LockMode::Wait } else { LockMode::Fail };
        let lock = DirLock::acquire(&base_path, mode)
            .context("failed to lock the corpus (retry with --wait)")?;
        tracing::debug!(lock = %lock.path().display(), "corpus locked");
        Some(lock)
    } else {
        None
    };

    let embedder = Arc::new(Embedder::new(config.inference_timeout()));
    if args.command.needs_model() {
        let embedder = embedder.clone();
        let embedder_config = config.embedder.clone();
        let model_base = base_path.clone();
        tokio::task::spawn_blocking(move || embedder.initialize(&embedder_config, &model_base))
            .await?
            .context("failed to load the embedding model")?;
    }

    let service = RetrievalService::open(&config, embedder.clone())?;

    let result = run(args.command, &config, &service).await;
    embedder.close().await;
    result
}

async fn run(command: Command, config: &Config, service: &RetrievalService) -> anyhow::Result<()> {
    match command {
        Command::Add { text, meta } => {
            let metadata: Metadata = meta.into_iter().collect();
            let id = service.insert(&text, metadata).await?;
            print_json(&service.item(id)?)
        }

        Command::Search { query, limit } => {
            let limit = limit.unwrap_or_else(|| service.default_limit());
            let hits = service.search(&query, limit).await?;
            print_json(&hits)
        }

        Command::Index { path, title } => {
            let report = service.index_document(&path, title.as_deref()).await?;
            if report.failed > 0 {
                log::warn!(
                    "{} chunks could not be embedded; run `recall migrate` to retry them",
                    report.failed
                );
            }
            print_json(&report)
        }

        Command::Delete { id } => {
            if !service.delete_item(id)? {
                bail!("item {id} not found");
            }
            println!("item {id} removed");
            Ok(())
        }

        Command::DeleteDocument { id } => {
            let chunks = service.delete_document(id)?;
            println!("document {id} removed with {chunks} chunks");
            Ok(())
        }

        Command::Status {} => {
            let stats = service.stats()?;
            let status = service
                .migration_manager(config.migration.clone())
                .status()?;
            print_json(&serde_json::json!({
                "stats": stats,
                "migration": status,
                "needs_migration": !status.is_consistent(),
            }))
        }

        Command::Migrate { force } => {
            let manager = service.migration_manager(config.migration.clone());
            if !force && !manager.needs_migration()? {
                println!("corpus is consistent, nothing to migrate");
                return Ok(());
            }

            let bar = ProgressBar::new(0);
            bar.set_style(ProgressStyle::default_bar().template(PROGRESS_TEMPLATE)?);
            let report = manager
                .regenerate_all_with(|done, total| {
                    bar.set_length(total as u64);
                    bar.set_position(done as u64);
                })
                .await?;
            bar.finish_and_clear();

            print_json(&report)?;
            report.into_result()?;
            Ok(())
        }

        Command::Export { out } => {
            let file = File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let count = service.export_vectors(BufWriter::new(file))?;
            println!("{count} embeddings exported to {}", out.display());
            Ok(())
        }

        Command::Chunk { path, paragraphs } => {
            let mut chunker_config = config.chunker.clone();
            if paragraphs {
                chunker_config.mode = ChunkMode::Paragraph;
            }
            let document = PlainTextExtractor.extract(&path)?;
            let chunks = Chunker::new(chunker_config).chunk(&document.full_text, &Metadata::new());
            print_json(&chunks)
        }
    }
}
