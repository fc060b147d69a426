//! `shoprag`: ingest manuals and worker notes, then ask machine-scoped questions.
//!
//! ```bash
//! shoprag ingest vf2.txt --title "VF-2 Operator Manual" --machine haas-vf2
//! shoprag ingest-dir manuals/ --machine haas-vf2
//! shoprag note "Replaced coolant pump impeller" --note-id N1 --machine haas-vf2
//! shoprag query "spindle warm-up after idle" --machine haas-vf2 --context
//! shoprag machines
//! ```

mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use shoprag_core::config::{Config, Settings};
use shoprag_core::store::MemoryStore;
use shoprag_core::traits::ChunkStore;
use shoprag_core::types::{DocumentId, MachineTag, SourceKind};
use shoprag_embed::get_default_embedder;
use shoprag_hybrid::{DocumentRequest, NoteRequest, QueryRequest, RetrievalService};
use shoprag_vector::LanceChunkStore;

#[derive(Parser)]
#[command(name = "shoprag", version, about = "Hybrid retrieval over machine manuals and worker notes")]
struct Cli {
    /// Directory holding shoprag.toml; relative storage paths resolve against it
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one manual from a text file (pages separated by form feeds)
    Ingest {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        machine: Option<String>,
        /// Explicit document id; derived from title and machine otherwise
        #[arg(long)]
        id: Option<String>,
        /// manual or note
        #[arg(long, default_value = "manual")]
        kind: SourceKind,
    },
    /// Ingest every .txt file under a directory, titled by file name
    IngestDir {
        dir: PathBuf,
        #[arg(long)]
        machine: Option<String>,
    },
    /// Add or replace a worker note
    Note {
        text: String,
        #[arg(long)]
        note_id: String,
        #[arg(long)]
        machine: Option<String>,
    },
    /// Retrieve ranked passages for a question
    Query {
        text: String,
        #[arg(long)]
        machine: Option<String>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Print the grounding context handed to the answer generator
        #[arg(long)]
        context: bool,
        #[arg(long)]
        json: bool,
    },
    /// Remove a document or note by id
    Remove { id: String },
    /// List machine tags present in the corpus
    Machines,
    /// Show corpus counts
    Stats,
}

fn machine_tag(raw: Option<&str>) -> Option<MachineTag> {
    raw.and_then(MachineTag::parse)
}

async fn open_service(settings: Settings, base: &Path) -> Result<RetrievalService> {
    let embedder = get_default_embedder(&settings.embedding)?;
    let store: Arc<dyn ChunkStore> = match settings.storage.lancedb_path(base) {
        Some(path) => Arc::new(LanceChunkStore::open(&path, embedder.dim()).await?),
        None => {
            tracing::warn!("storage.lancedb_dir is not set; nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(RetrievalService::open(settings, embedder, store).await?)
}

fn text_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("txt")))
        .collect();
    files.sort();
    files
}

async fn ingest_dir(service: &RetrievalService, dir: &Path, machine: Option<MachineTag>) -> Result<()> {
    let files = text_files(dir);
    println!("Ingesting {} files from {}", files.len(), dir.display());
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}")?
            .progress_chars("#>-"),
    );
    let mut failed = 0usize;
    for path in &files {
        let title = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        pb.set_message(title.clone());
        let result = match std::fs::read_to_string(path) {
            Ok(text) => service
                .ingest(DocumentRequest::manual(title, text).for_machine(machine.clone()))
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = result {
            failed += 1;
            pb.suspend(|| eprintln!("skipped {}: {e:#}", path.display()));
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");
    println!("Ingested {} of {} files", files.len() - failed, files.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = Config::load_from(&cli.config_dir).context("loading configuration")?;
    let settings = config.settings()?;
    let service = open_service(settings, &cli.config_dir).await?;

    match cli.command {
        Command::Ingest { file, title, machine, id, kind } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let title = title
                .or_else(|| file.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_default();
            let mut request = DocumentRequest::manual(title, text)
                .with_kind(kind)
                .for_machine(machine_tag(machine.as_deref()));
            if let Some(id) = id {
                request = request.with_id(DocumentId::new(id));
            }
            let id = service.ingest(request).await?;
            println!("Ingested {id}");
        }
        Command::IngestDir { dir, machine } => ingest_dir(&service, &dir, machine_tag(machine.as_deref())).await?,
        Command::Note { text, note_id, machine } => {
            let chunks = service
                .ingest_note(NoteRequest::new(note_id.clone(), text).for_machine(machine_tag(machine.as_deref())))
                .await?;
            println!("Stored note {note_id} ({chunks} chunks)");
        }
        Command::Query { text, machine, top_k, context, json } => {
            let mut request = QueryRequest::new(text.clone()).for_machine(machine_tag(machine.as_deref()));
            if let Some(k) = top_k {
                request = request.top_k(k);
            }
            if context {
                let (context, mode) = service.context(request).await?;
                println!("{}", output::format_context(&text, &context, mode));
            } else {
                let outcome = service.query(request).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome.candidates)?);
                } else {
                    println!("{}", output::format_candidates(&text, &outcome));
                }
            }
        }
        Command::Remove { id } => {
            if service.remove_document(&DocumentId::new(id.clone())).await? {
                println!("Removed {id}");
            } else {
                println!("No document {id}");
            }
        }
        Command::Machines => {
            for machine in service.machines()? {
                println!("{machine}");
            }
        }
        Command::Stats => println!("{}", output::format_stats(&service.stats().await?)),
    }
    Ok(())
}
