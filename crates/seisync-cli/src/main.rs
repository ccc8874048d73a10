//! seisync: pull SEI process metadata, activities and documents into the
//! local state store.
//!
//! Every run is resumable: it selects whatever is not yet `completed` or
//! `error`, so re-running after an interruption continues where the last
//! run stopped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seisync_client::{ClientConfig, SeiClient};
use seisync_core::{defaults, Stage, StateStore};
use seisync_db::{Database, FilesystemBackend, PoolConfig};
use seisync_jobs::{
    BatchSummary, DocumentPipeline, DocumentQuery, DocumentRepository, MetadataPipeline,
    PipelineStatusRepository, SchedulerConfig, StopHandle, WorkQuery,
};

#[derive(Parser)]
#[command(name = "seisync")]
#[command(author, version, about = "Resumable SEI API sync")]
#[command(propagate_version = true)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", default_value = defaults::DATABASE_URL, global = true)]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Fetch process metadata, document listings and activities
    Metadata {
        /// Scope prefix to process (repeat for concurrent per-scope runs)
        #[arg(short, long)]
        scope: Vec<String>,

        /// Stages to fetch (default: all)
        #[arg(long, value_enum)]
        stage: Vec<StageArg>,

        /// Only items that occurred on or after this date (YYYY-MM-DD or RFC 3339)
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Simultaneous SEI metadata calls
        #[arg(long)]
        max_concurrent: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Download pending documents into object storage
    Documents {
        /// Scope prefix of the owning work items
        #[arg(short, long)]
        scope: Option<String>,

        /// Object storage root
        #[arg(long, env = "STORAGE_PATH", default_value = defaults::STORAGE_PATH)]
        storage_path: PathBuf,

        /// Download only this SEI document id
        #[arg(long, requires = "protocol")]
        document_id: Option<String>,

        /// Only documents of this process protocol
        #[arg(long)]
        protocol: Option<String>,

        /// Simultaneous document downloads
        #[arg(long)]
        max_concurrent_downloads: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Move `error` items back to `pending`
    Reset {
        #[arg(long, value_enum)]
        stage: ResetTarget,

        /// Only reset items under this scope prefix
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// List the units visible to the service account
    Units,

    /// Show per-stage progress counts
    Status {
        /// Only count items under this scope prefix
        #[arg(short, long)]
        scope: Option<String>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Maximum number of items to select
    #[arg(short, long)]
    limit: Option<i64>,

    /// Concurrent items per run
    #[arg(long, env = "SYNC_BATCH_SIZE")]
    batch_size: Option<usize>,
}

/// Pool sizes given on the command line. Unset sizes keep the values
/// `ClientConfig::from_env` read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PoolSizes {
    metadata: Option<usize>,
    downloads: Option<usize>,
}

impl PoolSizes {
    fn apply(self, mut config: ClientConfig) -> ClientConfig {
        if let Some(n) = self.metadata {
            config = config.with_max_concurrent(n);
        }
        if let Some(n) = self.downloads {
            config = config.with_max_concurrent_downloads(n);
        }
        config
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Metadata,
    Documents,
    Activity,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Metadata => Stage::Metadata,
            StageArg::Documents => Stage::Documents,
            StageArg::Activity => Stage::Activity,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ResetTarget {
    Metadata,
    Documents,
    Activity,
    /// Document downloads
    Download,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _file_guard = init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Migrate => {
            let db = connect(&cli.database_url).await?;
            db.migrate().await.context("migration failed")?;
            info!(subsystem = "cli", op = "migrate", "Migrations applied");
        }
        Commands::Metadata {
            scope,
            stage,
            since,
            max_concurrent,
            run,
        } => {
            let db = connect(&cli.database_url).await?;
            let client = build_client(PoolSizes {
                metadata: max_concurrent,
                downloads: None,
            })?;
            let query = metadata_query(stage, since, &run);
            cmd_metadata(Arc::new(db), client, scope, query, &run).await?;
        }
        Commands::Documents {
            scope,
            storage_path,
            document_id,
            protocol,
            max_concurrent_downloads,
            run,
        } => {
            let db = connect(&cli.database_url).await?;
            let client = build_client(PoolSizes {
                metadata: None,
                downloads: max_concurrent_downloads,
            })?;
            let storage = FilesystemBackend::new(storage_path);
            storage
                .validate()
                .await
                .context("object storage is not writable")?;
            let query = document_query(scope, document_id, protocol, &run);
            cmd_documents(Arc::new(db), client, Arc::new(storage), query, &run).await?;
        }
        Commands::Reset { stage, scope } => {
            let db = connect(&cli.database_url).await?;
            let reset = match stage {
                ResetTarget::Download => db.reset_document_errors(scope.as_deref()).await?,
                ResetTarget::Metadata => {
                    db.reset_stage_errors(Stage::Metadata, scope.as_deref()).await?
                }
                ResetTarget::Documents => {
                    db.reset_stage_errors(Stage::Documents, scope.as_deref()).await?
                }
                ResetTarget::Activity => {
                    db.reset_stage_errors(Stage::Activity, scope.as_deref()).await?
                }
            };
            print_json(&json!({ "reset": reset }))?;
        }
        Commands::Units => {
            let client = SeiClient::new(ClientConfig::from_env())?;
            let units = client.list_units().await?;
            print_json(&json!({ "units": units }))?;
        }
        Commands::Status { scope } => {
            let db = connect(&cli.database_url).await?;
            let mut stages = serde_json::Map::new();
            for stage in Stage::ALL {
                let counts = db.stage_counts(stage, scope.as_deref()).await?;
                stages.insert(stage.as_str().to_string(), json!(counts));
            }
            let downloads = db.document_counts(scope.as_deref()).await?;
            print_json(&json!({ "stages": stages, "downloads": downloads }))?;
        }
    }
    Ok(())
}

fn metadata_query(stages: Vec<StageArg>, since: Option<DateTime<Utc>>, run: &RunArgs) -> WorkQuery {
    let mut query = WorkQuery::all_stages();
    if !stages.is_empty() {
        query.stages = stages.into_iter().map(Stage::from).collect();
    }
    if let Some(since) = since {
        query = query.with_since(since);
    }
    if let Some(limit) = run.limit {
        query = query.with_limit(limit);
    }
    query
}

fn document_query(
    scope: Option<String>,
    document_id: Option<String>,
    protocol: Option<String>,
    run: &RunArgs,
) -> DocumentQuery {
    let mut query = DocumentQuery::default();
    if let Some(scope) = scope {
        query = query.with_scope(scope);
    }
    if let Some(document_id) = document_id {
        query = query.with_document_id(document_id);
    }
    if let Some(protocol) = protocol {
        query = query.with_protocol(protocol);
    }
    if let Some(limit) = run.limit {
        query = query.with_limit(limit);
    }
    query
}

async fn cmd_metadata(
    store: Arc<dyn StateStore>,
    client: Arc<SeiClient>,
    scopes: Vec<String>,
    mut query: WorkQuery,
    run: &RunArgs,
) -> anyhow::Result<()> {
    let stop = stop_on_ctrl_c();
    let pipeline = MetadataPipeline::new(client.clone(), store, scheduler_config(run), stop);

    if scopes.len() <= 1 {
        if let Some(scope) = scopes.into_iter().next() {
            query = query.with_scope(scope);
        }
        let summary = pipeline.run(&query).await?;
        return print_run(&client, &summary, JsonValue::Null);
    }

    let mut total = BatchSummary::default();
    let mut per_scope = serde_json::Map::new();
    let mut failed = Vec::new();
    for (scope, result) in pipeline.run_scopes(&query, &scopes).await {
        match result {
            Ok(summary) => {
                total = total.merge(&summary);
                per_scope.insert(scope, json!(summary));
            }
            Err(e) => {
                per_scope.insert(scope.clone(), json!({ "error": e.to_string() }));
                failed.push(scope);
            }
        }
    }
    print_run(&client, &total, JsonValue::Object(per_scope))?;
    if !failed.is_empty() {
        bail!("scoped runs failed: {}", failed.join(", "));
    }
    Ok(())
}

async fn cmd_documents(
    store: Arc<dyn StateStore>,
    client: Arc<SeiClient>,
    storage: Arc<FilesystemBackend>,
    query: DocumentQuery,
    run: &RunArgs,
) -> anyhow::Result<()> {
    let stop = stop_on_ctrl_c();
    let pipeline =
        DocumentPipeline::new(client.clone(), store, storage, scheduler_config(run), stop);

    let summary = pipeline.run(&query).await?;
    print_run(&client, &summary, JsonValue::Null)
}

async fn connect(database_url: &str) -> anyhow::Result<Database> {
    Database::connect_with_config(database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to the state store")
}

fn build_client(sizes: PoolSizes) -> anyhow::Result<Arc<SeiClient>> {
    let config = sizes.apply(ClientConfig::from_env());
    Ok(Arc::new(SeiClient::new(config)?))
}

/// `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", value))
}

fn scheduler_config(run: &RunArgs) -> SchedulerConfig {
    let config = SchedulerConfig::from_env();
    match run.batch_size {
        Some(n) => config.with_batch_size(n),
        None => config,
    }
}

/// Stop dispatching new items on the first Ctrl-C; in-flight items finish.
fn stop_on_ctrl_c() -> StopHandle {
    let stop = StopHandle::new();
    let handle = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(subsystem = "cli", "Interrupt received, finishing in-flight items");
            handle.stop();
        }
    });
    stop
}

fn print_run(client: &SeiClient, summary: &BatchSummary, scopes: JsonValue) -> anyhow::Result<()> {
    let (metadata, downloads) = client.stats();
    let mut out = json!({
        "summary": summary,
        "transport": {
            "metadata": metadata,
            "downloads": downloads,
            "logins": client.session().login_count(),
        },
    });
    if !scopes.is_null() {
        out["scopes"] = scopes;
    }
    print_json(&out)
}

fn print_json(value: &JsonValue) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily rolling file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "seisync=info")
///
/// Logs go to stderr so stdout carries only the JSON report.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "seisync=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("seisync.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        subsystem = "cli",
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}
