//! Hearth CLI - run generation scenarios from the terminal
//!
//! Usage:
//!   hearth init                  Write the default .hearth/config.toml
//!   hearth run <scenario.toml>   Run a scenario and stream events as JSON lines
//!   hearth validate <scenario>   Check a scenario's operation graph

mod scenario;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hearth_artifacts::{InMemoryArtifactBackend, PersistedArtifactStore};
use hearth_core::{ExecutionMode, HearthConfig, Hook, PromptMessage};
use hearth_llm::{ChatCompletionsClient, LlmClient, ScriptedLlmClient};
use hearth_runtime::{
    validate_operation_graph, ChannelEventSink, FinishedStatus, GenerationRuntime,
    InMemoryTurnPersistence, MiniJinjaRenderer, RunOutcome,
};
use scenario::Scenario;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(author, version, about = "Generation runs with template operations around one LLM call")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Repository path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Run a scenario; events go to stdout as JSON lines
    Run {
        /// Scenario file (TOML)
        scenario: PathBuf,

        /// Override the execution mode (sequential, concurrent)
        #[arg(long)]
        mode: Option<ExecutionMode>,

        /// Config file (defaults to .hearth/config.toml when present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Call the configured LLM endpoint instead of the scripted reply
        #[arg(long)]
        live: bool,

        /// Print the final run state of each turn after its events
        #[arg(long)]
        state: bool,
    },

    /// Check a scenario's operation graph
    Validate {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays a clean event stream
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::Run {
            scenario,
            mode,
            config,
            live,
            state,
        } => cmd_run(scenario, mode, config, live, state).await,
        Commands::Validate { scenario } => cmd_validate(scenario),
    }
}

fn cmd_init(path: PathBuf) -> Result<()> {
    info!("Initializing Hearth in {:?}", path);
    HearthConfig::write_default(&path).context("Failed to write default config")?;

    println!("Initialized Hearth in {:?}", path);
    println!("Created:");
    println!("  .hearth/config.toml");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<HearthConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            Ok(HearthConfig::from_toml(&content)?)
        }
        None => Ok(HearthConfig::load_or_default(Path::new("."))?),
    }
}

async fn cmd_run(
    scenario_path: PathBuf,
    mode: Option<ExecutionMode>,
    config_path: Option<PathBuf>,
    live: bool,
    print_state: bool,
) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let scenario = Scenario::load(&scenario_path)?;

    for issue in validate_operation_graph(&scenario.operations) {
        warn!("Operation graph: {}", issue);
    }

    let llm: Arc<dyn LlmClient> = if live {
        let client = ChatCompletionsClient::from_settings(&config.llm)
            .context("Failed to configure the LLM client")?;
        Arc::new(client)
    } else {
        Arc::new(
            ScriptedLlmClient::from_text(&scenario.reply)
                .with_delay(Duration::from_millis(scenario.reply_delay_ms)),
        )
    };

    let (sink, mut events) = ChannelEventSink::new();
    let printer = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        }
    });

    let store = PersistedArtifactStore::new(
        Arc::new(InMemoryArtifactBackend::new()),
        config.artifacts.retention,
    );
    let runtime = GenerationRuntime::new(
        Arc::new(MiniJinjaRenderer::new()),
        llm,
        Arc::new(InMemoryTurnPersistence::new()),
    )
    .with_persisted_store(store)
    .with_event_sink(Arc::new(sink))
    .with_settings(config.generation.clone())
    .with_max_tokens(config.llm.max_tokens);

    let mut history = scenario.history.clone();
    let mut outcomes = Vec::new();

    for user_text in scenario.user_turns() {
        let request = scenario.request(user_text, history.clone(), mode);
        let run_id = request.run_id.clone();

        let registry = runtime.registry().clone();
        let cancel_run_id = run_id.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run {}", cancel_run_id);
                registry.cancel(&cancel_run_id);
            }
        });

        let outcome = runtime
            .run_chat_generation(request)
            .await
            .with_context(|| format!("Run {} could not start", run_id))?;
        ctrl_c.abort();

        info!("Run {} finished: {}", outcome.run_id, outcome.status);
        let done = outcome.status == FinishedStatus::Done;
        if done {
            history.push(PromptMessage::user(outcome.state.user_text.clone()));
            history.push(PromptMessage::assistant(outcome.state.assistant_text.clone()));
        }
        outcomes.push(outcome);
        if !done {
            break;
        }
    }

    // Dropping the runtime closes the event channel
    drop(runtime);
    printer.await.context("Event printer stopped unexpectedly")?;

    if print_state {
        for outcome in &outcomes {
            print_outcome(outcome)?;
        }
    }

    match outcomes.last() {
        Some(last) if last.status != FinishedStatus::Done => {
            bail!("Run {} finished with status {}", last.run_id, last.status)
        }
        _ => Ok(()),
    }
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    let summary = serde_json::json!({
        "type": "run.outcome",
        "run_id": outcome.run_id,
        "status": outcome.status,
        "failed_type": outcome.failed_type,
        "message": outcome.message,
        "state": outcome.state,
    });
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_validate(scenario_path: PathBuf) -> Result<()> {
    let scenario = Scenario::load(&scenario_path)?;
    let issues = validate_operation_graph(&scenario.operations);

    for hook in [Hook::BeforeMainLlm, Hook::AfterMainLlm] {
        let count = scenario.operations.iter().filter(|op| op.hook == hook).count();
        println!("{}: {} operation(s)", hook, count);
    }

    if issues.is_empty() {
        println!("Operation graph OK");
        return Ok(());
    }

    for issue in &issues {
        println!("  - {}", issue);
    }
    bail!("{} issue(s) in {:?}", issues.len(), scenario_path)
}
