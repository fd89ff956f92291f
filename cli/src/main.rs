//! `docflow`: run extraction workflows on local documents.

mod config;
mod output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use docflow_engine::prelude::*;
use docflow_providers::{
    probe_tools, ExtractorContext, ExtractorRegistry, PdftoppmRasterizer, ProviderError, RigLlm,
};
use rig::client::{CompletionClient, ProviderClient};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;
use crate::output::{JsonSink, LogProgress};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a structured record from a PDF or image
    Run(RunArgs),
    /// List the registered text extractors and their parameters
    Extractors,
    /// Report whether tesseract and pdftoppm are installed
    Tools,
    /// Print the JSON Schema of the configuration file
    ConfigSchema,
}

#[derive(Args)]
struct RunArgs {
    /// Document to process
    file: PathBuf,
    /// Schema file: an extraction schema, or a bare JSON Schema
    #[arg(long)]
    schema: PathBuf,
    /// Configuration file (default: <config dir>/docflow/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the schema's extraction strategy (ocr-first, vision-only, vision-first, two-stage)
    #[arg(long)]
    strategy: Option<ExtractionStrategy>,
    /// Re-extract only this field of the record given with --previous
    #[arg(long, requires = "previous")]
    field: Option<String>,
    /// Previously extracted record (JSON)
    #[arg(long, requires = "field")]
    previous: Option<PathBuf>,
    /// Overrides the configured retry ceiling
    #[arg(long)]
    max_retries: Option<u32>,
    /// Extra instructions for the model
    #[arg(long)]
    prompt: Option<String>,
    /// Text file used instead of OCR output
    #[arg(long)]
    text: Option<PathBuf>,
    /// Document identifier (default: the file name)
    #[arg(long)]
    manifest_id: Option<String>,
    /// Write the result here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Extractors => {
            let registry = ExtractorRegistry::with_defaults();
            let list: Vec<_> = registry.list().collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tools => {
            let statuses = probe_tools().await;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            let all_installed = statuses.iter().all(|s| s.is_installed());
            Ok(if all_installed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::ConfigSchema => {
            let schema = schemars::schema_for!(CliConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = CliConfig::load(args.config.as_deref())?;
    if let Some(max) = args.max_retries {
        config.workflow.max_retries = max;
    }

    let schema = load_schema(&args.schema)?;
    let schema_id = schema.id.clone();
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .context("Document path has no file name")?
        .to_string();

    let llm = build_llm(&config.provider)?;
    let context = ExtractorContext {
        llm: Some(Arc::clone(&llm)),
        provider: config.provider.clone(),
    };

    let mut builder = WorkflowEngine::builder(
        llm,
        Arc::new(StaticSchemaSource::new().with_schema(schema)),
        Arc::new(JsonSink::new(args.output.clone())),
    )
    .config(config.workflow.clone())
    .provider(config.provider.clone());

    match ExtractorRegistry::with_defaults().create(
        &config.extractor.id,
        &config.extractor.params,
        &context,
    ) {
        Ok(ocr) => builder = builder.ocr(ocr),
        Err(e @ (ProviderError::ExecutableNotFound { .. } | ProviderError::MissingDependency { .. })) => {
            tracing::warn!(extractor = %config.extractor.id, error = %e, "Text extractor unavailable");
        }
        Err(e) => return Err(e).context("Invalid extractor configuration"),
    }
    match PdftoppmRasterizer::discover(None) {
        Ok(rasterizer) => builder = builder.rasterizer(Arc::new(rasterizer)),
        Err(e) => tracing::warn!(error = %e, "PDF rasterization unavailable"),
    }
    let engine = builder.build()?;

    let manifest_id = args.manifest_id.clone().unwrap_or_else(|| file_name.clone());
    let mut request = WorkflowRequest::new(manifest_id, schema_id, Document::new(file_name, bytes));
    if let Some(strategy) = args.strategy {
        request = request.with_strategy(strategy);
    }
    if let Some(prompt) = args.prompt {
        request = request.with_custom_prompt(prompt);
    }
    if let Some(path) = &args.text {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        request = request.with_text_context(text);
    }
    if let (Some(field), Some(previous)) = (args.field, &args.previous) {
        request = request.with_field_reextract(field, read_json(previous)?);
    }

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, canceling");
            on_signal.cancel();
        }
    });

    let outcome = engine.run(request, &LogProgress, &cancel).await;
    match outcome {
        WorkflowOutcome::Completed(_) => Ok(ExitCode::SUCCESS),
        WorkflowOutcome::Failed { error, .. } => {
            tracing::error!(error = %error, "Extraction failed");
            Ok(ExitCode::FAILURE)
        }
        WorkflowOutcome::Canceled {
            manifest_id,
            last_status,
            last_progress,
        } => {
            let summary = json!({
                "manifestId": manifest_id,
                "status": "CANCELED",
                "lastStatus": last_status,
                "lastProgress": last_progress,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::from(130))
        }
    }
}

/// Builds the model client for `provider.kind`; keys come from the environment.
fn build_llm(provider: &ProviderConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    match provider.kind.as_str() {
        "openai" => {
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set for the openai provider")?;
            let client = rig::providers::openai::Client::from_env();
            Ok(Arc::new(RigLlm::new(client.completion_model(provider.model_name.clone()))))
        }
        "anthropic" => {
            std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY must be set for the anthropic provider")?;
            let client = rig::providers::anthropic::Client::from_env();
            Ok(Arc::new(RigLlm::new(client.completion_model(provider.model_name.clone()))))
        }
        other => anyhow::bail!("Unsupported provider kind: {other} (expected openai or anthropic)"),
    }
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Accepts a full extraction schema or a bare JSON Schema named after the file.
fn load_schema(path: &Path) -> anyhow::Result<ExtractionSchema> {
    let mut value = read_json(path)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("schema")
        .to_string();
    let Some(object) = value.as_object_mut() else {
        anyhow::bail!("Schema {} must be a JSON object", path.display());
    };
    if !object.contains_key("jsonSchema") {
        return Ok(ExtractionSchema::new(stem, value));
    }
    object.entry("id").or_insert_with(|| Value::String(stem));
    serde_json::from_value(value).with_context(|| format!("Invalid schema {}", path.display()))
}
