mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use migration_console::types::{LogEntry, MigrationRequest, MigrationType, UploadCodeRequest};
use migration_console::{
    default_config_path, logging, BatchItem, BatchItemStatus, BatchOrchestrator, BatchPlan,
    CommandClient, Console, ConsoleConfig,
};

#[derive(Parser, Debug)]
#[command(name = "migctl")]
#[command(about = "Operator console for the code migration platform", long_about = None)]
struct Args {
    /// Config file (defaults to <config dir>/migration-console/config.json)
    #[arg(long, env = "MIGCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Command API base URL, including the /api prefix
    #[arg(long, env = "MIGCTL_API_URL")]
    api_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered nodes
    Nodes,
    /// Show the cluster topology snapshot
    Topology,
    /// Show the latest metrics of one node
    Metrics { node_id: String },
    /// List migrations
    Migrations,
    /// Show one migration
    Migration { id: String },
    /// Cancel a running migration
    Cancel { id: String },
    /// Inspect uploaded code packages
    Code {
        #[command(subcommand)]
        command: CodeCommands,
    },
    /// Upload a code package
    Upload {
        #[arg(long)]
        name: String,
        /// Source file holding the code
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "main")]
        entry_point: String,
        /// Node the package starts on
        #[arg(long)]
        node: Option<String>,
    },
    /// Start a single migration
    Migrate {
        #[arg(long)]
        code: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long = "type", default_value = "weak")]
        migration_type: MigrationType,
    },
    /// Migrate several code packages one after another
    Batch {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long = "type", default_value = "weak")]
        migration_type: MigrationType,
        /// Code package id; repeat for each package
        #[arg(long = "code", required = true)]
        codes: Vec<String>,
    },
    /// Follow the live event feed and print the operator log
    Watch {
        #[arg(long)]
        broker_host: Option<String>,
        #[arg(long)]
        broker_port: Option<u16>,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CodeCommands {
    List,
    Get { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration to the config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = ConsoleConfig::load(&config_path)?;
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    debug!("Using config {:?} (api={})", config_path, config.api_base_url);

    match args.command {
        Commands::Watch {
            broker_host,
            broker_port,
        } => {
            if let Some(host) = broker_host {
                config.feed.broker_host = host;
            }
            if let Some(port) = broker_port {
                config.feed.broker_port = port;
            }
            watch(&config).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => output::print_json(&config),
            ConfigCommands::Init => {
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
                Ok(())
            }
        },
        Commands::Batch {
            source,
            target,
            migration_type,
            codes,
        } => {
            let plan = BatchPlan {
                source_node_id: source,
                target_node_id: target,
                migration_type,
                code_ids: codes,
            };
            batch(&config, plan).await
        }
        command => {
            let client = CommandClient::new(&config.api_base_url, config.request_timeout())?;
            request(&client, command).await
        }
    }
}

async fn request(client: &CommandClient, command: Commands) -> Result<()> {
    match command {
        Commands::Nodes => output::print_json(&client.list_nodes().await?),
        Commands::Topology => output::print_json(&client.topology().await?),
        Commands::Metrics { node_id } => output::print_json(&client.node_metrics(&node_id).await?),
        Commands::Migrations => output::print_json(&client.list_migrations().await?),
        Commands::Migration { id } => output::print_json(&client.get_migration(&id).await?),
        Commands::Cancel { id } => output::print_json(&client.cancel_migration(&id).await?),
        Commands::Code { command } => match command {
            CodeCommands::List => output::print_json(&client.list_code().await?),
            CodeCommands::Get { id } => output::print_json(&client.get_code(&id).await?),
        },
        Commands::Upload {
            name,
            file,
            entry_point,
            node,
        } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let request = UploadCodeRequest {
                name,
                code,
                entry_point,
                initial_node_id: node,
            };
            output::print_json(&client.upload_code(&request).await?)
        }
        Commands::Migrate {
            code,
            source,
            target,
            migration_type,
        } => {
            if source == target {
                anyhow::bail!("Source and target nodes must differ");
            }
            let request = MigrationRequest {
                code_id: code,
                source_node_id: source,
                target_node_id: target,
                migration_type,
            };
            output::print_json(&client.create_migration(&request).await?)
        }
        Commands::Batch { .. } | Commands::Watch { .. } | Commands::Config { .. } => {
            anyhow::bail!("command does not map to a single request")
        }
    }
}

async fn batch(config: &ConsoleConfig, plan: BatchPlan) -> Result<()> {
    let client = Arc::new(CommandClient::new(
        &config.api_base_url,
        config.request_timeout(),
    )?);
    let orchestrator = Arc::new(BatchOrchestrator::new(client, config.batch.pacing()));

    // Ctrl-C skips whatever has not started yet.
    let canceller = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel();
            }
        }
    });

    let mut items = orchestrator.subscribe();
    let mut printed = 0;
    let run = orchestrator.run(plan);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            res = items.changed() => {
                if res.is_ok() {
                    let current = items.borrow_and_update().clone();
                    print_settled(&current, &mut printed);
                }
            }
        }
    };
    canceller.abort();
    print_settled(&orchestrator.items(), &mut printed);

    let report = result?;
    println!("Batch migration complete: {}", report);
    if report.failed > 0 {
        anyhow::bail!("{} of {} migrations failed", report.failed, report.total());
    }
    Ok(())
}

/// Print items past `printed` that reached a final status, in order.
fn print_settled(items: &[BatchItem], printed: &mut usize) {
    while let Some(item) = items.get(*printed) {
        if matches!(item.status, BatchItemStatus::Pending | BatchItemStatus::InProgress) {
            break;
        }
        output::print_batch_item(item);
        *printed += 1;
    }
}

async fn watch(config: &ConsoleConfig) -> Result<()> {
    let console = Console::start(config)?;
    info!(
        "Watching feed at {}:{}",
        config.feed.broker_host, config.feed.broker_port
    );

    // Failures are already in the log ring.
    let _ = console.refresh_topology().await;
    let _ = console.refresh_migrations().await;
    let _ = console.refresh_code_packages().await;

    let mut changes = console.store().subscribe();
    let mut last_seen: Option<LogEntry> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let logs: Vec<LogEntry> = changes.borrow_and_update().logs.iter().cloned().collect();
        for entry in output::new_entries(&logs, last_seen.as_ref()) {
            output::print_log(entry);
        }
        if let Some(last) = logs.last() {
            last_seen = Some(last.clone());
        }

        tokio::select! {
            _ = &mut ctrl_c => break,
            res = changes.changed() => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(active) = console.store().active_migration() {
        println!(
            "Active migration {} ({}%) {} -> {}",
            active.id, active.progress, active.source_node_id, active.target_node_id
        );
    }
    console.shutdown().await;
    Ok(())
}
