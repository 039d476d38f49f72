mod config;

use basalt_core::{Coordinator, StorageNode};
use clap::{Parser, Subcommand};
use config::{CoordinatorConfig, NodeConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Block-based distributed file storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator server
    Coordinator {
        /// Path to configuration file
        #[arg(short, long, default_value = "coordinator.yaml")]
        config: String,
    },
    /// Start a storage node
    StorageNode {
        /// Path to configuration file
        #[arg(short, long, default_value = "storage_node.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "basalt=info,basalt_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Coordinator { config } => {
            tracing::info!("Starting Basalt coordinator with config: {}", config);

            let cfg = match CoordinatorConfig::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            let coordinator = match Coordinator::bind(cfg.into_options()).await {
                Ok(coordinator) => coordinator,
                Err(e) => {
                    tracing::error!("Failed to start coordinator: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = coordinator.run().await {
                tracing::error!("Coordinator error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::StorageNode { config } => {
            tracing::info!("Starting Basalt storage node with config: {}", config);

            let cfg = match NodeConfig::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            let node = match StorageNode::bind(cfg.into_options()).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("Failed to start storage node: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = node.run().await {
                tracing::error!("Storage node error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
