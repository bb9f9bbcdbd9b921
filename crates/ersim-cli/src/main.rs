//! `ersim` command line
//!
//! Drives the pipeline over a JSON workbook file and a JSON state file.
//! Every command prints its report as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use ersim_core::{
    read_results, BatchMode, BatchRunner, CategorizationMerger, Categorizer,
    FieldRecommendationCache, FieldSelection, HeaderSnapshot, PipelineConfig, SchemaResolver,
    StepBudget, StepScheduler,
};
use ersim_llm::{ChatModel, CompletionRequest, LlmError, OpenAiClient};
use ersim_sheets::{FileKv, JsonWorkbook, TabularStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ersim", version, about = "Resumable case conversion and categorization")]
struct Cli {
    /// Workbook file (JSON map of sheet name to rows)
    #[arg(long, short, env = "ERSIM_WORKBOOK", default_value = "workbook.json")]
    workbook: PathBuf,

    /// Persisted pipeline state
    #[arg(long, env = "ERSIM_STATE", default_value = "ersim-state.json")]
    state: PathBuf,

    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long, short, env = "ERSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Batch conversion
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Header snapshots
    #[command(subcommand)]
    Schema(SchemaCommand),
    /// Categorize converted cases into the results sheet
    Categorize,
    /// Merge reviewed categorizations into the sink
    ApplyCategories,
    /// Field selection and recommendations
    #[command(subcommand)]
    Fields(FieldsCommand),
}

#[derive(Debug, Subcommand)]
enum BatchCommand {
    /// Queue rows for a new batch
    Start(ModeArgs),
    /// Process exactly one queued row
    Step,
    /// Step until done, interrupted or out of budget
    Run {
        /// Stop after this many steps
        #[arg(long)]
        max_steps: Option<u32>,
        /// Stop after this many seconds (0 for no limit)
        #[arg(long)]
        max_wall_secs: Option<u64>,
    },
    /// Ask the active batch to stop at its next step
    Stop,
    /// Show the active batch and the last finished one
    Status,
}

#[derive(Debug, Args)]
#[group(multiple = false)]
struct ModeArgs {
    /// Next N unprocessed rows (default: configured batch size)
    #[arg(long)]
    next: Option<usize>,
    /// Every unprocessed row
    #[arg(long)]
    all: bool,
    /// Retry error rows in place, e.g. "5, 7, 10-12"
    #[arg(long)]
    rows: Option<String>,
}

impl ModeArgs {
    fn mode(self, default_size: usize) -> BatchMode {
        if let Some(spec) = self.rows {
            BatchMode::Specific(spec)
        } else if self.all {
            BatchMode::All
        } else {
            BatchMode::Next(self.next.unwrap_or(default_size))
        }
    }
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    /// Re-read source and sink headers
    Refresh,
}

#[derive(Debug, Subcommand)]
enum FieldsCommand {
    /// Print the current selection
    Show,
    /// Replace the selection
    Save {
        /// Field names, in order
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Restore the default selection
    Reset,
    /// Recommend fields beyond the current selection
    Recommend,
}

/// Stand-in model for commands that never call one
struct Offline {
    key_var: String,
}

#[async_trait]
impl ChatModel for Offline {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        Err(LlmError::MissingApiKey(self.key_var.clone()))
    }
}

struct App {
    config: PipelineConfig,
    store: Arc<JsonWorkbook>,
    kv: Arc<FileKv>,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => PipelineConfig::default().with_env_overrides(),
        };
        config.validate().context("invalid configuration")?;

        let store = JsonWorkbook::open(&cli.workbook)
            .with_context(|| format!("failed to open workbook {}", cli.workbook.display()))?;
        let kv = FileKv::open(&cli.state)
            .with_context(|| format!("failed to open state {}", cli.state.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            kv: Arc::new(kv),
        })
    }

    fn model(&self) -> Result<Arc<dyn ChatModel>> {
        let llm = &self.config.llm;
        let client = OpenAiClient::from_env(&llm.base_url, &llm.api_key_env, llm.timeout())
            .context("failed to create chat client")?;
        Ok(Arc::new(client))
    }

    fn offline(&self) -> Arc<dyn ChatModel> {
        Arc::new(Offline {
            key_var: self.config.llm.api_key_env.clone(),
        })
    }

    fn runner(&self, model: Arc<dyn ChatModel>) -> BatchRunner {
        BatchRunner::new(self.config.clone(), self.store.clone(), self.kv.clone(), model)
    }

    fn sink_header(&self) -> Result<HeaderSnapshot> {
        let sheets = &self.config.sheets;
        SchemaResolver::new(self.kv.clone())
            .refresh(self.store.as_ref(), &sheets.sink, sheets.sink_layout())
            .with_context(|| format!("failed to read header of '{}'", sheets.sink))
    }

    fn available_fields(&self) -> Option<Vec<String>> {
        if !self.store.sheet_exists(&self.config.sheets.sink) {
            return None;
        }
        match self.sink_header() {
            Ok(header) => Some(header.available_fields().into_iter().map(|f| f.name).collect()),
            Err(e) => {
                warn!("sink fields unavailable: {:#}", e);
                None
            }
        }
    }

    fn fields(&self) -> FieldRecommendationCache {
        FieldRecommendationCache::new(self.kv.clone(), self.config.llm.recommendation.clone())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn batch(app: &App, command: BatchCommand) -> Result<()> {
    match command {
        BatchCommand::Start(args) => {
            let mode = args.mode(app.config.batch.max_batch_size);
            let report = app.runner(app.offline()).start(mode)?;
            emit(&report)
        }
        BatchCommand::Step => {
            let outcome = app.runner(app.model()?).step().await?;
            emit(&outcome)
        }
        BatchCommand::Run {
            max_steps,
            max_wall_secs,
        } => {
            let mut budget = StepBudget::from_settings(&app.config.batch);
            if max_steps.is_some() {
                budget.max_steps = max_steps;
            }
            if let Some(secs) = max_wall_secs {
                budget.max_wall = (secs > 0).then(|| Duration::from_secs(secs));
            }
            let scheduler = StepScheduler::from_settings(&app.config.batch).with_budget(budget);

            let cancel = scheduler.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, pausing after the current step");
                    cancel.cancel();
                }
            });

            let summary = scheduler.run(&app.runner(app.model()?)).await?;
            emit(&summary)
        }
        BatchCommand::Stop => {
            let stopping = app.runner(app.offline()).stop()?;
            emit(&serde_json::json!({ "stop_requested": stopping }))
        }
        BatchCommand::Status => {
            let runner = app.runner(app.offline());
            emit(&serde_json::json!({
                "active": runner.status()?,
                "last_report": runner.last_report()?,
            }))
        }
    }
}

async fn fields(app: &App, command: FieldsCommand) -> Result<()> {
    let available = app.available_fields();
    let cache = app.fields();
    match command {
        FieldsCommand::Show => emit(&cache.load(available.as_deref())?),
        FieldsCommand::Save { fields } => {
            let selection = FieldSelection::user(fields);
            cache.save(&selection)?;
            emit(&selection)
        }
        FieldsCommand::Reset => emit(&cache.reset(available.as_deref())?),
        FieldsCommand::Recommend => {
            let cache = match app.model() {
                Ok(model) => cache.with_model(model),
                Err(e) => {
                    warn!("{:#}, using static recommendations", e);
                    cache
                }
            };
            let selection = cache.load(available.as_deref())?;
            let recommendations = cache
                .recommend(&selection, available.as_deref().unwrap_or_default())
                .await?;
            emit(&recommendations)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let app = App::open(&cli)?;
    match cli.command {
        Command::Batch(command) => batch(&app, command).await,
        Command::Schema(SchemaCommand::Refresh) => {
            let sheets = &app.config.sheets;
            let schema = SchemaResolver::new(app.kv.clone());
            let store = app.store.as_ref();
            let source = schema.refresh(store, &sheets.source, sheets.source_layout())?;
            let sink = schema.refresh(store, &sheets.sink, sheets.sink_layout())?;
            emit(&serde_json::json!({
                "source": source.available_fields(),
                "sink": sink.available_fields(),
            }))
        }
        Command::Categorize => {
            let header = app.sink_header()?;
            let categorizer = Categorizer::from_config(app.store.clone(), app.model()?, &app.config)
                .load_symptom_mapping()?;
            emit(&categorizer.run(&header).await?)
        }
        Command::ApplyCategories => {
            let header = app.sink_header()?;
            let results = read_results(
                app.store.as_ref(),
                &app.config.sheets.results,
                &app.config.categorize,
            )?;
            let merger = CategorizationMerger::from_config(app.store.clone(), &app.config);
            emit(&merger.apply(&results, &header)?)
        }
        Command::Fields(command) => fields(&app, command).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    run(cli).await
}
