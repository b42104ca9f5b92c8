//! Command-line front door for the BPMN engine: load a process definition,
//! start an instance, drive it to completion (or to its first wait state),
//! and print the resulting token/variable state.

use anyhow::{Context, Result};
use bpmn_core::graph::parse_bpmn;
use bpmn_core::state::memory::MemoryStateManager;
use bpmn_core::{Config, EventBus, Executor, ServiceTaskRegistry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bpmn-cli")]
#[command(author = "bpmn-engine")]
#[command(version = "0.1.0")]
#[command(about = "Run BPMN 2.0 process definitions against the in-memory engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one instance of a process definition and drive it to completion.
    Run {
        /// Path to a BPMN 2.0 XML file.
        file: PathBuf,

        /// definitionId recorded on the started instance (defaults to the file stem).
        #[arg(long)]
        definition_id: Option<String>,
    },

    /// Parse and validate a BPMN file without executing it.
    Validate {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let _config = Config::from_env();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, definition_id } => run(&file, definition_id).await,
        Commands::Validate { file } => validate(&file),
    }
}

async fn run(file: &PathBuf, definition_id: Option<String>) -> Result<()> {
    let xml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let graph = Arc::new(parse_bpmn(&xml).with_context(|| format!("parsing {}", file.display()))?);
    let definition_id = definition_id.unwrap_or_else(|| {
        file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "process".to_string())
    });

    let store: Arc<dyn bpmn_core::StateManager> = Arc::new(MemoryStateManager::new());
    let events = Arc::new(EventBus::default());
    let services = Arc::new(ServiceTaskRegistry::new());
    let executor = Executor::new(graph, store.clone(), events, services);

    info!(%definition_id, file = %file.display(), "starting process instance");
    let instance_id = executor.start_instance(&definition_id).await?;

    let tokens = store.tokens_in_instance(instance_id).await?;
    println!("instance {instance_id} settled with {} token(s):", tokens.len());
    for token in &tokens {
        println!("  - {} @ {} ({:?})", token.id, token.node_id, token.state);
    }

    let variables = store.all_variables(instance_id, None).await?;
    if !variables.is_empty() {
        println!("root variables:");
        for (name, value) in &variables {
            println!("  - {name} = {value:?}");
        }
    }

    Ok(())
}

fn validate(file: &PathBuf) -> Result<()> {
    let xml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let graph = parse_bpmn(&xml).with_context(|| format!("parsing {}", file.display()))?;
    bpmn_core::graph::validate(&graph)?;
    println!(
        "{}: {} node(s), {} flow(s), valid",
        file.display(),
        graph.nodes.len(),
        graph.flows.len()
    );
    Ok(())
}
