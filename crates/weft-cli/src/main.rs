use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use weft::mapper::MapperContext;
use weft::wire::{WireGraph, encode_results};
use weft::{Graph, MapperFactory, Type};
use weft_server::{Client, ExecuteOptions, Handler, ServerConfig, net};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Serve and evaluate weft computation graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve graph execution over WebSocket
    Serve {
        /// Server config (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the config
        #[arg(long)]
        addr: Option<String>,
    },

    /// Evaluate a wire graph file and print its results as JSON
    Eval {
        /// Path to the graph JSON
        graph: PathBuf,

        /// Server config (TOML); embedded when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Re-run every op instead of using cached results
        #[arg(long)]
        no_cache: bool,
    },

    /// Validate a config file
    CheckConfig {
        /// Path to the config
        file: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    match path {
        Some(path) => Ok(ServerConfig::load(path)?),
        None => Ok(ServerConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, addr } => {
            let config = load_config(config.as_deref())?;
            let addr = addr.unwrap_or(config.net.addr);
            let handler = Arc::new(Handler::new(config.storage.context()));

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let listener = tokio::net::TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("Failed to bind {addr}"))?;
                net::serve(listener, handler, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::warn!("ctrl-c handler failed: {e}");
                    }
                })
                .await?;
                Ok::<_, anyhow::Error>(())
            })?;
        }

        Commands::Eval {
            graph,
            config,
            no_cache,
        } => {
            let config = load_config(config.as_deref())?;
            let content = std::fs::read_to_string(&graph)
                .with_context(|| format!("Failed to read {}", graph.display()))?;
            let wire: WireGraph = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", graph.display()))?;

            let mappers = MapperFactory::new(MapperContext::transport());
            let mut nodes = Graph::with_builtins();
            let roots = wire.decode(&mut nodes, &mappers)?;

            let mut client = Client::from_config(&config)?;
            let results = client.use_nodes_with(&roots, ExecuteOptions { no_cache })?;

            let types: Vec<Type> = roots.iter().map(|root| root.ty().clone()).collect();
            let encoded = encode_results(&results, &types, &mappers)?;
            println!("{}", serde_json::to_string_pretty(&encoded)?);
        }

        Commands::CheckConfig { file } => {
            let config = ServerConfig::load(&file)?;
            println!("backend: {}", config.backend);
            match config.storage.context() {
                Some(storage) => println!(
                    "storage: {} ({})",
                    storage.root().root().display(),
                    storage.namespace()
                ),
                None => println!("storage: none"),
            }
        }
    }

    Ok(())
}
