//! MESH CLI — run and inspect agent workflows from the command line.
//!
//! Builds the same registry, dispatcher and orchestrator from mesh-core that
//! the network servers use, seeded from an agent roster file.

use mesh_cli::commands;

use clap::{Parser, Subcommand};

/// MESH CLI — Multi-agent workflow orchestration
#[derive(Parser)]
#[command(name = "mesh", version, about = "MESH CLI — Multi-agent workflow orchestration")]
pub struct Cli {
    /// Path to the mesh configuration YAML
    #[arg(long, env = "MESH_CONFIG", global = true)]
    config: Option<String>,

    /// Path to the agent roster YAML
    #[arg(long, env = "MESH_AGENTS", global = true)]
    agents: Option<String>,

    /// Serve agents in-process using the roster's `simulate` blocks
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition file
    Run {
        /// Workflow YAML file
        file: String,
        /// Override the workflow timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Compile a workflow file and print its execution plan
    Validate {
        /// Workflow YAML file
        file: String,
    },

    /// List built-in workflow templates
    Templates,

    /// Instantiate and execute a built-in template
    Template {
        /// Template name (e.g. "email_composition")
        name: String,
        /// Template input as key=value, repeatable
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
        /// Override the workflow timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Inspect registered agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List every registered agent
    List,
    /// Find agents by capability, protocol and status
    Discover {
        #[arg(long)]
        capability: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        /// ONLINE, DEGRADED or OFFLINE
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_core=info,mesh_cli=info".into()),
        )
        .init();

    let result = match cli.command {
        Some(Commands::Validate { file }) => commands::validate::validate(&file),

        Some(command) => match init(&cli.config, &cli.agents, cli.simulate) {
            Ok(mesh) => match command {
                Commands::Run { file, timeout_ms } => {
                    commands::run::run(&mesh, &file, timeout_ms).await
                }
                Commands::Templates => commands::templates::list(&mesh),
                Commands::Template {
                    name,
                    inputs,
                    timeout_ms,
                } => commands::templates::run(&mesh, &name, &inputs, timeout_ms).await,
                Commands::Agents { action } => match action {
                    AgentsAction::List => commands::agents::list(&mesh),
                    AgentsAction::Discover {
                        capability,
                        protocol,
                        status,
                        limit,
                    } => commands::agents::build_query(
                        capability.as_deref(),
                        protocol.as_deref(),
                        status.as_deref(),
                        limit,
                    )
                    .and_then(|query| commands::agents::discover(&mesh, &query)),
                },
                Commands::Validate { .. } => Ok(()),
            },
            Err(e) => Err(e),
        },

        None => {
            // No subcommand — show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init(
    config: &Option<String>,
    agents: &Option<String>,
    simulate: bool,
) -> Result<mesh_core::WorkflowOrchestrator, String> {
    let config = commands::load_config(config.as_deref())?;
    commands::init_mesh(config, agents.as_deref(), simulate)
}
