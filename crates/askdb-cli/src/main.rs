use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use askdb_config::{load_config_from_path, validate_config, AgentConfig};
use askdb_dataset::{SchemaInspector, SqliteDataset};
use askdb_domain::{RequestId, RunStatus};
use askdb_orchestrator::{Orchestrator, PresenceValidator, RunConfig};
use askdb_planner::{summarize_answer, OllamaChat, ReasoningCapability, Unconfigured};
use askdb_trace_core::TraceStore;
use askdb_trace_fs::JsonFileTraceStore;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "askdb")]
#[command(about = "Answer questions about a SQLite dataset with replayable step traces")]
struct Cli {
    /// YAML or JSON agent configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Ask(AskArgs),
    Trace(TraceArgs),
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    question: String,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    trace_dir: Option<PathBuf>,
    #[arg(long)]
    reasoning_endpoint: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Plan with the keyword heuristics only.
    #[arg(long, default_value_t = false)]
    no_reasoning: bool,
    #[arg(long, default_value_t = false)]
    summarize: bool,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Show {
        #[arg(long)]
        request_id: String,
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },
    List {
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct SchemaArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    table: Option<String>,
}

fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask(args) => ask_command(config, &args),
        Commands::Trace(args) => trace_command(&config, args),
        Commands::Schema(args) => schema_command(&config, &args),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("askdb=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => load_config_from_path(path),
        None => Ok(AgentConfig::default()),
    }
}

fn ask_command(mut config: AgentConfig, args: &AskArgs) -> Result<ExitCode> {
    if let Some(db) = &args.db {
        config.dataset_path.clone_from(db);
    }
    if let Some(trace_dir) = &args.trace_dir {
        config.trace_dir.clone_from(trace_dir);
    }
    if let Some(endpoint) = &args.reasoning_endpoint {
        config.reasoning.endpoint = Some(endpoint.clone());
    }
    if let Some(model) = &args.model {
        config.reasoning.model.clone_from(model);
    }
    validate_config(&config)?;

    let dataset = SqliteDataset::new(&config.dataset_path);
    let trace_store = JsonFileTraceStore::open(&config.trace_dir);
    trace_store.init()?;

    let ollama = if args.no_reasoning {
        None
    } else {
        OllamaChat::from_config(&config.reasoning)?
    };
    let unconfigured = Unconfigured;
    let capability: &dyn ReasoningCapability = match &ollama {
        Some(client) => client,
        None => &unconfigured,
    };
    let validator = PresenceValidator;

    let response = Orchestrator::new(
        &dataset,
        &dataset,
        capability,
        &validator,
        &trace_store,
        RunConfig::from(&config),
    )
    .run(&args.question)?;

    let mut output = serde_json::to_value(&response)?;
    if args.summarize && ollama.is_none() {
        tracing::warn!("summary requested without a reasoning endpoint; skipping");
    } else if args.summarize && response.status == RunStatus::Success {
        if let Some(summary) = summarize_answer(
            capability,
            &response.question,
            &response.answer,
            &response.sql_used,
        ) {
            output["summary"] = json!(summary);
        }
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(match response.status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::Error => ExitCode::FAILURE,
    })
}

fn trace_command(config: &AgentConfig, args: TraceArgs) -> Result<ExitCode> {
    match args.command {
        TraceSubcommand::Show {
            request_id,
            trace_dir,
        } => {
            let store = JsonFileTraceStore::open(trace_dir.as_deref().unwrap_or(&config.trace_dir));
            let request_id = RequestId::from_str(&request_id)?;
            let raw = store
                .retrieve_raw(request_id)?
                .ok_or_else(|| anyhow!("trace {request_id} not found"))?;
            println!("{raw}");
        }
        TraceSubcommand::List { trace_dir } => {
            let store = JsonFileTraceStore::open(trace_dir.as_deref().unwrap_or(&config.trace_dir));
            for request_id in store.list()? {
                println!("{request_id}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn schema_command(config: &AgentConfig, args: &SchemaArgs) -> Result<ExitCode> {
    let dataset = SqliteDataset::new(args.db.as_deref().unwrap_or(&config.dataset_path));
    match &args.table {
        Some(table) => {
            for field in dataset.describe_table(table)? {
                println!("{}", serde_json::to_string(&field)?);
            }
        }
        None => {
            for table in dataset.list_tables()? {
                println!("{table}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
