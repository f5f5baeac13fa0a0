//! Joblet CLI tool.

use clap::{Parser, Subcommand};

mod commands;

use commands::{Client, jobs, volumes, workflows};

#[derive(Parser)]
#[command(name = "jobctl")]
#[command(about = "Joblet job execution CLI", long_about = None)]
struct Cli {
    /// Daemon URL
    #[arg(long, env = "JOBLET_API_URL", default_value = "http://127.0.0.1:7621")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command as a job
    Run {
        /// Command to execute
        command: String,
        /// Arguments for the command
        args: Vec<String>,
        /// CPU limit as percent of one core
        #[arg(long, default_value_t = 0)]
        max_cpu: i64,
        /// Memory limit in megabytes
        #[arg(long, default_value_t = 0)]
        max_memory: i64,
        /// IO limit in bytes per second
        #[arg(long, default_value_t = 0)]
        max_iobps: i64,
        /// Network mode: bridge, host, none, or a custom network
        #[arg(long, default_value = "bridge")]
        network: String,
        /// Named volumes to mount
        #[arg(long)]
        volume: Vec<String>,
        /// Runtime spec, e.g. python:3.11
        #[arg(long)]
        runtime: Option<String>,
        /// KEY=VALUE environment entries
        #[arg(long = "env")]
        env: Vec<String>,
        /// Files to upload into /uploads
        #[arg(long)]
        upload: Vec<String>,
        /// RFC3339 time to run at
        #[arg(long)]
        schedule: Option<String>,
    },
    /// List jobs
    List,
    /// Show one job by UUID or prefix
    Status { reference: String },
    /// Stream a job's logs
    Logs { reference: String },
    /// Show a job's recorded metrics
    Metrics { reference: String },
    /// Stop a job
    Stop { reference: String },
    /// Delete a finished job
    Delete { reference: String },
    /// Delete every finished job
    Clear,
    /// Manage workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Manage runtimes
    Runtime {
        #[command(subcommand)]
        command: RuntimeCommands,
    },
    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Run a workflow YAML file
    Run {
        /// Path to the workflow file
        path: String,
    },
    /// List workflows
    List {
        #[arg(long)]
        include_completed: bool,
    },
    /// Show workflow status
    Status { id: String },
    /// Show the jobs of a workflow
    Jobs { id: String },
}

#[derive(Subcommand)]
enum RuntimeCommands {
    /// List installed runtimes
    List,
    /// Show one runtime
    Info { name: String },
    /// Check that a runtime resolves
    Test { name: String },
    /// Remove a runtime, optionally scoped with name@version
    Remove { name: String },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    List,
    /// Create a volume
    Create {
        name: String,
        #[arg(long, default_value = "1GB")]
        size: String,
    },
    /// Delete a volume
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new(cli.api_url);

    match cli.command {
        Commands::Run {
            command,
            args,
            max_cpu,
            max_memory,
            max_iobps,
            network,
            volume,
            runtime,
            env,
            upload,
            schedule,
        } => {
            jobs::run(
                &client,
                jobs::RunArgs {
                    command,
                    args,
                    max_cpu,
                    max_memory,
                    max_iobps,
                    network,
                    volumes: volume,
                    runtime,
                    env,
                    uploads: upload,
                    schedule,
                },
            )
            .await
        }
        Commands::List => jobs::list(&client).await,
        Commands::Status { reference } => jobs::status(&client, &reference).await,
        Commands::Logs { reference } => jobs::logs(&client, &reference).await,
        Commands::Metrics { reference } => jobs::metrics(&client, &reference).await,
        Commands::Stop { reference } => jobs::stop(&client, &reference).await,
        Commands::Delete { reference } => jobs::delete(&client, &reference).await,
        Commands::Clear => jobs::clear(&client).await,
        Commands::Workflow { command } => match command {
            WorkflowCommands::Run { path } => workflows::run(&client, &path).await,
            WorkflowCommands::List { include_completed } => {
                workflows::list(&client, include_completed).await
            }
            WorkflowCommands::Status { id } => workflows::status(&client, &id).await,
            WorkflowCommands::Jobs { id } => workflows::jobs(&client, &id).await,
        },
        Commands::Runtime { command } => match command {
            RuntimeCommands::List => volumes::runtime_list(&client).await,
            RuntimeCommands::Info { name } => volumes::runtime_info(&client, &name).await,
            RuntimeCommands::Test { name } => volumes::runtime_test(&client, &name).await,
            RuntimeCommands::Remove { name } => volumes::runtime_remove(&client, &name).await,
        },
        Commands::Volume { command } => match command {
            VolumeCommands::List => volumes::list(&client).await,
            VolumeCommands::Create { name, size } => {
                volumes::create(&client, &name, &size).await
            }
            VolumeCommands::Delete { name } => volumes::delete(&client, &name).await,
        },
    }
}
