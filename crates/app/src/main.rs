use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use context_search_core::{
    answer, engine_from_settings, model_from_settings, store_from_settings, DocumentService,
    IngestionJobs, JobState, OllamaCompletion, SearchRequest, Settings, StoreBackend,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "context-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file; `CONTEXT_SEARCH_*` variables override it.
    #[arg(long, env = "CONTEXT_SEARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Vector store backend (overrides the settings file)
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Qdrant base URL (overrides the settings file)
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Qdrant collection (overrides the settings file)
    #[arg(long)]
    collection: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Qdrant,
    /// In-process store; everything is lost on exit.
    Memory,
}

impl From<StoreKind> for StoreBackend {
    fn from(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Qdrant => StoreBackend::Qdrant,
            StoreKind::Memory => StoreBackend::Memory,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List collections in the store.
    Collections,
    /// Create the configured collection when it is missing.
    Init,
    /// Index one document.
    Ingest {
        #[arg(long)]
        path: PathBuf,
        /// Document id; generated when omitted.
        #[arg(long)]
        document_id: Option<Uuid>,
        /// Run as a background job and report its progress; Ctrl-C cancels it.
        #[arg(long, default_value_t = false)]
        background: bool,
    },
    /// Index every supported file under a folder, skipping failures.
    IngestFolder {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Retrieve passages with their neighboring chunks.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        score_threshold: Option<f32>,
        /// Restrict to a file format (pdf, txt, md, html); repeatable.
        #[arg(long = "file-type")]
        file_types: Vec<String>,
        /// Payload match as key=value; repeatable.
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Remove every chunk of a document.
    Delete {
        #[arg(long)]
        document_id: Uuid,
    },
    /// Answer a question from retrieved passages with the completion model.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(fmt::layer())
        .init();

    let mut settings = Settings::load(cli.config.as_deref())
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    if let Some(store) = cli.store {
        settings.store.backend = store.into();
    }
    if let Some(url) = cli.qdrant_url {
        settings.store.url = url;
    }
    if let Some(collection) = cli.collection {
        settings.store.collection = collection;
    }
    settings
        .validate()
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    let store = store_from_settings(&settings.store)
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    let model = model_from_settings(&settings.embedding)
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    let ocr = engine_from_settings(&settings.ocr)
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    let service = Arc::new(DocumentService::new(&settings, store, model, ocr));

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        backend = ?settings.store.backend,
        store = %settings.store.url,
        collection = %settings.store.collection,
        model = %service.embedder().model_name(),
        "context-search boot"
    );

    match cli.command {
        Command::Collections => {
            let collections = service
                .list_collections()
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            for collection in collections {
                let size = collection
                    .vector_size
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let points = collection
                    .points_count
                    .map(|count| count.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!("{} vector_size={size} points={points}", collection.name);
            }
        }
        Command::Init => {
            let created = service
                .ensure_collection()
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            if created {
                println!("collection {} created", service.collection());
            } else {
                println!("collection {} already exists", service.collection());
            }
        }
        Command::Ingest {
            path,
            document_id,
            background,
        } => {
            service
                .ensure_collection()
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            if background {
                run_background_ingest(service.clone(), path, document_id).await?;
            } else {
                let ids = service
                    .ingest(&path, document_id)
                    .await
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
                println!(
                    "{} chunks ingested from {} at {}",
                    ids.len(),
                    path.display(),
                    Utc::now().to_rfc3339()
                );
            }
        }
        Command::IngestFolder { folder } => {
            service
                .ensure_collection()
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let report = service
                .ingest_folder(&folder)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }
            for document in &report.documents {
                println!(
                    "{} document_id={} chunks={}",
                    document.path.display(),
                    document.document_uuid,
                    document.point_ids.len()
                );
            }
            println!(
                "{} chunks ingested from {} documents ({} skipped)",
                report.point_count(),
                report.documents.len(),
                report.skipped_files.len()
            );
        }
        Command::Search {
            query,
            limit,
            score_threshold,
            file_types,
            metadata,
        } => {
            let request = search_request(&settings, limit, score_threshold, file_types, metadata);
            let results = service.search(&query, &request).await;

            println!("query: {query}");
            if results.is_empty() {
                println!("no results");
            }
            for (rank, result) in results.iter().enumerate() {
                println!(
                    "[{}] score={:.4} chunks={:?}",
                    rank + 1,
                    result.score,
                    result.chunks
                );
                for path in &result.file_paths {
                    println!("  source={path}");
                }
                println!("  text:\n{}", result.texts);
            }
        }
        Command::Delete { document_id } => {
            let removed = service
                .delete_document(document_id)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!("{} chunks removed for document {document_id}", removed.len());
        }
        Command::Ask { question, limit } => {
            let llm = OllamaCompletion::from_settings(&settings.completion)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let request = search_request(&settings, limit, None, Vec::new(), Vec::new());
            let reply = answer(
                &service,
                &llm,
                &settings.completion.prompt,
                &question,
                &request,
            )
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            println!("{}", reply.answer);
            for passage in &reply.passages {
                let sources = passage
                    .file_paths
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("  source={sources} chunks={:?} score={:.4}", passage.chunks, passage.score);
            }
        }
    }

    Ok(())
}

fn search_request(
    settings: &Settings,
    limit: Option<usize>,
    score_threshold: Option<f32>,
    file_types: Vec<String>,
    metadata: Vec<(String, String)>,
) -> SearchRequest {
    let mut request = settings.search.request();
    if let Some(limit) = limit {
        request.limit = limit;
    }
    if let Some(score_threshold) = score_threshold {
        request.score_threshold = score_threshold;
    }
    request.filters.file_types = file_types;
    request.filters.metadata = metadata.into_iter().collect::<BTreeMap<_, _>>();
    request
}

async fn run_background_ingest(
    service: Arc<DocumentService>,
    path: PathBuf,
    document_id: Option<Uuid>,
) -> anyhow::Result<()> {
    let jobs = IngestionJobs::new(service);
    let id = jobs.submit(path, document_id).await;
    println!("job {id} submitted");

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_state = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if jobs.cancel(id).await {
                    warn!(job = %id, "cancellation requested");
                }
            }
            _ = ticker.tick() => {}
        }

        let Some(status) = jobs.status(id).await else {
            anyhow::bail!("job {id} disappeared");
        };
        if last_state.as_ref() != Some(&status.state) {
            println!("job {id} state={:?}", status.state);
            last_state = Some(status.state.clone());
        }
        if status.state.is_finished() {
            break;
        }
    }

    let status = jobs
        .wait(id)
        .await
        .ok_or_else(|| anyhow::anyhow!("job {id} disappeared"))?;
    match status.state {
        JobState::Completed { point_ids } => {
            println!(
                "{} chunks ingested for document {} at {}",
                point_ids.len(),
                status.document_uuid,
                Utc::now().to_rfc3339()
            );
            Ok(())
        }
        JobState::Cancelled { flushed } => {
            println!("job {id} cancelled; {flushed} chunks were already stored");
            Ok(())
        }
        JobState::Failed { error } => Err(anyhow::anyhow!(error)),
        state => Err(anyhow::anyhow!("job {id} ended in unexpected state {state:?}")),
    }
}
