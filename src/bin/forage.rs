//! forage CLI — operator interface to the aggregation engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use forage::config::{Config, EngineConfig};
use forage::engine::{Engine, Submission};
use forage::key::CacheKey;
use forage::model::{NewTask, PriorityClass, TaskId, TaskKind, TaskStatus};
use forage::store::Store;
use forage::telemetry::{TelemetryConfig, init_telemetry};
use forage::worker::ExecutorRegistry;

#[derive(Parser)]
#[command(name = "forage", about = "Task dispatch and dedup engine")]
struct Cli {
    /// Engine tuning file (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine daemon
    Serve,
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Source operations
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a new task
    Submit {
        /// Task kind (scrape, extract, process, adjust_sentiment,
        /// generate_response, maintenance)
        kind: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Dedup fingerprint (raw). Omit to skip dedup.
        #[arg(long)]
        cache_key: Option<String>,
        /// Priority class override
        #[arg(long)]
        class: Option<String>,
        /// Attempt budget override
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a source for periodic scraping
    Add {
        url: String,
        /// Seconds between eligible re-scans
        #[arg(long, default_value_t = 900)]
        interval: i64,
    },
    /// List registered sources
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env();
    let engine_config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Serve => cmd_serve(config, engine_config).await,
        Command::Task { action } => {
            let engine = Engine::open(
                &config.database_path,
                ExecutorRegistry::empty(),
                engine_config,
            )?;
            match action {
                TaskAction::Submit {
                    kind,
                    payload,
                    cache_key,
                    class,
                    max_attempts,
                } => cmd_task_submit(&engine, kind, payload, cache_key, class, max_attempts),
                TaskAction::List {
                    status,
                    kind,
                    limit,
                } => cmd_task_list(engine.store(), status, kind, limit),
                TaskAction::Show { id } => cmd_task_show(engine.store(), id),
            }
        }
        Command::Source { action } => {
            let store = Store::open(&config.database_path)?;
            match action {
                SourceAction::Add { url, interval } => cmd_source_add(&store, url, interval),
                SourceAction::List => cmd_source_list(&store),
            }
        }
    }
}

async fn cmd_serve(config: Config, engine_config: EngineConfig) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "forage".to_string(),
    })?;

    // Executors for scraping/processing plug in from the embedding
    // application; the bare daemon still runs maintenance cycles and
    // drains whatever executors are registered.
    let engine = Engine::open(
        &config.database_path,
        ExecutorRegistry::empty(),
        engine_config,
    )?;

    engine.start()?;
    tokio::signal::ctrl_c().await.ok();
    engine.shutdown().await;
    Ok(())
}

fn cmd_task_submit(
    engine: &Engine,
    kind: String,
    payload: Option<String>,
    cache_key: Option<String>,
    class: Option<String>,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let kind: TaskKind = kind.parse()?;
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewTask::new(kind).payload(payload);
    if let Some(key) = cache_key {
        new = new.cache_key(CacheKey::from_raw(key));
    }
    if let Some(class) = class {
        new = new.class(class.parse::<PriorityClass>()?);
    }
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    match engine.submit(new)? {
        Submission::Created(task) => {
            println!("Created: {} (status: {})", task.id, task.status);
        }
        Submission::Duplicate {
            task_id,
            cache_key,
        } => {
            println!("Duplicate: key {cache_key} held by task {task_id}");
        }
        Submission::Cached { cache_key, .. } => {
            println!("Cached: key {cache_key} has a live result, nothing queued");
        }
    }

    Ok(())
}

fn cmd_task_list(
    store: &Store,
    status: Option<String>,
    kind: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status_filter: Option<TaskStatus> = status.map(|s| s.parse()).transpose()?;
    let kind_filter: Option<TaskKind> = kind.map(|s| s.parse()).transpose()?;

    let tasks = store.list_tasks(status_filter, kind_filter, limit)?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<8}  {:<18}  {:<13}  {:<11}  {:<3}  CREATED",
        "ID", "KIND", "CLASS", "STATUS", "ATT"
    );
    println!("{}", "-".repeat(80));

    for task in &tasks {
        println!(
            "{:<8}  {:<18}  {:<13}  {:<11}  {:<3}  {}",
            task.id.to_string(),
            task.kind.to_string(),
            task.class.to_string(),
            task.status.to_string(),
            task.attempt_count,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

fn cmd_task_show(store: &Store, id_str: String) -> anyhow::Result<()> {
    // Support prefix matching — find the task whose ID starts with the given string
    let id = if id_str.len() < 36 {
        let tasks = store.list_tasks(None, None, 100)?;
        let matches: Vec<_> = tasks
            .iter()
            .filter(|task| task.id.0.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no task matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} tasks match prefix '{id_str}' — be more specific"),
        }
    } else {
        TaskId(uuid::Uuid::parse_str(&id_str)?)
    };

    let task = store.get_task(id)?;

    println!("ID:          {}", task.id.0);
    println!("Kind:        {}", task.kind);
    println!("Class:       {}", task.class);
    println!("Status:      {}", task.status);
    println!(
        "Cache Key:   {}",
        task.cache_key
            .as_ref()
            .map(|k| k.as_str().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Payload:     {}", serde_json::to_string_pretty(&task.payload)?);
    println!("Attempts:    {}/{}", task.attempt_count, task.max_attempts);
    println!("Created:     {}", task.created_at);
    println!("Updated:     {}", task.updated_at);
    if let Some(retry_at) = task.next_retry_at {
        println!("Next Retry:  {retry_at}");
    }
    if let Some(ref outcome) = task.outcome {
        println!("---");
        println!(
            "Outcome:     {}",
            if outcome.success { "success" } else { "failure" }
        );
        if let Some(ref data) = outcome.data {
            println!("Data:        {}", serde_json::to_string_pretty(data)?);
        }
        if let Some(ref err) = outcome.error {
            println!("Error:       {err}");
        }
        println!("Duration:    {}ms", outcome.duration_ms);
    }

    Ok(())
}

fn cmd_source_add(store: &Store, url: String, interval: i64) -> anyhow::Result<()> {
    let parsed = url::Url::parse(&url)?;
    let domain = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("url has no host: {url}"))?
        .to_ascii_lowercase();

    let source = store.upsert_source(&url, &domain, interval)?;
    println!(
        "Registered: {} ({}) every {}s",
        source.url, source.domain, source.scrape_interval_secs
    );
    Ok(())
}

fn cmd_source_list(store: &Store) -> anyhow::Result<()> {
    let sources = store.list_sources()?;

    if sources.is_empty() {
        println!("No sources registered.");
        return Ok(());
    }

    for source in &sources {
        let last = source
            .last_scraped_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<8}  {:<40}  every {:>6}s  last: {}",
            source.id.to_string(),
            source.url,
            source.scrape_interval_secs,
            last
        );
    }

    println!("\n{} source(s)", sources.len());
    Ok(())
}
