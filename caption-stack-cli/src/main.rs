//! Caption Stack CLI - synthesize, inspect and simulate the captioning topology

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use caption_stack::events::{LoggingEventSink, PipelineExecutionStatus};
use caption_stack::lifecycle::{plan, summarize};
use caption_stack::network::analyze_routing;
use caption_stack::observability::{init_tracing, LogFormat};
use caption_stack::simulation::{CloudEnvironment, ControlPlane, DeployLatestModel, TriggerPipeline, MODEL_ARTIFACT};
use caption_stack::topology::ids;
use caption_stack::{CaptionTopology, Stack, StackConfig};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

/// Caption Stack - image-captioning deployment topology
#[derive(Debug, Parser)]
#[command(name = "caption-stack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CAPTION_STACK_CONFIG")]
    config: Option<PathBuf>,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print or write the template
    Synth(SynthArgs),

    /// Print the creation order with each resource's dependencies
    Graph,

    /// Print the changes from the stack an older configuration produces
    Plan(PlanArgs),

    /// Validate the configuration and report subnet routing
    Check,

    /// Deploy into an in-memory control plane and replay uploads
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SynthArgs {
    /// Write the template to this file instead of stdout
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Emit compact JSON
    #[arg(long)]
    compact: bool,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Configuration of the deployed stack
    #[arg(long)]
    from: PathBuf,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Object keys to upload to the ingest bucket
    #[arg(long = "upload", default_value = "train-images/sample.jpg")]
    uploads: Vec<String>,

    /// Status every started pipeline execution finishes with
    #[arg(long, default_value = "Succeeded")]
    status: PipelineExecutionStatus,
}

fn load_config(path: Option<&Path>) -> Result<StackConfig> {
    match path {
        Some(path) => {
            StackConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(StackConfig::default()),
    }
}

fn synthesize(config: &StackConfig) -> Result<Stack> {
    CaptionTopology::new(config.clone())
        .synthesize()
        .with_context(|| format!("failed to synthesize {}", config.stack_name))
}

fn run_synth(config: &StackConfig, args: &SynthArgs) -> Result<()> {
    let stack = synthesize(config)?;
    let text = if args.compact {
        stack.template().to_json()?
    } else {
        stack.to_json_pretty()?
    };
    match &args.out {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), fingerprint = %stack.fingerprint(), "template written");
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn run_graph(config: &StackConfig) -> Result<()> {
    let stack = synthesize(config)?;
    for (index, id) in stack.creation_order().iter().enumerate() {
        let resource_type = stack.resource(id).map(|r| r.resource_type.as_str()).unwrap_or_default();
        let deps: Vec<String> = stack.dependencies_of(id).into_iter().collect();
        if deps.is_empty() {
            println!("{:>3}. {id} ({resource_type})", index + 1);
        } else {
            println!("{:>3}. {id} ({resource_type}) <- {}", index + 1, deps.join(", "));
        }
    }
    Ok(())
}

fn run_plan(config: &StackConfig, args: &PlanArgs) -> Result<()> {
    let old_config = load_config(Some(&args.from))?;
    let old = synthesize(&old_config)?;
    let new = synthesize(config)?;
    let changes = plan(&old, &new);
    print!("{changes}");
    if !changes.is_empty() {
        let summary: Vec<String> = summarize(&changes)
            .into_iter()
            .map(|(action, count)| format!("{action}: {count}"))
            .collect();
        println!("{}", summary.join(", "));
    }
    Ok(())
}

fn run_check(config: &StackConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let stack = synthesize(config)?;
    println!(
        "{}: {} resources, fingerprint {}",
        stack.name(),
        stack.resource_count(),
        stack.fingerprint()
    );
    for routing in analyze_routing(&stack) {
        println!(
            "  {:<28} {:<8} default route: {:<24} storage endpoint: {}",
            routing.subnet,
            if routing.public { "public" } else { "private" },
            routing.default_route.to_string(),
            routing.s3_endpoint.as_deref().unwrap_or("none")
        );
    }
    if !config.variant.event_schema.is_documented() {
        println!("warning: the deploy rule matches a pipelineName field the service never emits");
    }
    Ok(())
}

async fn run_simulate(config: &StackConfig, args: &SimulateArgs) -> Result<()> {
    let stack = synthesize(config)?;
    let cloud = ControlPlane::with_sink(CloudEnvironment::default(), Arc::new(LoggingEventSink::default()));

    let model_bucket = cloud.resolve_text(&config.model.bucket)?;
    cloud.create_bucket(&model_bucket)?;
    cloud.put_object(&model_bucket, &config.model.artifact_key, 1024).await?;
    cloud.register_pipeline(config.pipeline.name.as_str());
    cloud.register_handler(ids::TRIGGER_FUNCTION, Arc::new(TriggerPipeline));
    cloud.register_handler(ids::DEPLOY_FUNCTION, Arc::new(DeployLatestModel::from_config(config)));

    let deployment = cloud.deploy(&stack)?;
    let physical = |id: &str| deployment.resources.get(id).map(|r| r.physical_id.clone());
    let Some(ingest) = physical(ids::INGEST_BUCKET) else {
        bail!("stack has no ingest bucket");
    };

    let mut invocations = Vec::new();
    for key in &args.uploads {
        invocations.extend(cloud.put_object(&ingest, key, 1024).await?);
    }
    for execution in cloud.executions() {
        if args.status == PipelineExecutionStatus::Succeeded {
            let run = execution.arn.rsplit('/').next().unwrap_or_default();
            let key = format!("{}{run}/{MODEL_ARTIFACT}", config.pipeline.output_prefix);
            cloud.put_object(&model_bucket, &key, 1024).await?;
        }
        invocations.extend(cloud.complete_execution(&execution.arn, args.status).await?);
    }

    let endpoint = physical(ids::ENDPOINT).and_then(|name| cloud.endpoint(&name));
    let report = json!({
        "stack": deployment.name,
        "fingerprint": deployment.fingerprint,
        "invocations": invocations,
        "executions": cloud.executions(),
        "endpoint": endpoint,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let directives = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    init_tracing(cli.log_format, directives)?;

    let config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Commands::Synth(args) => run_synth(&config, args),
        Commands::Graph => run_graph(&config),
        Commands::Plan(args) => run_plan(&config, args),
        Commands::Check => run_check(&config),
        Commands::Simulate(args) => run_simulate(&config, args).await,
    }
}
