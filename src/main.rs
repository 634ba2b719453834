//! Flowsift CLI
//!
//! Command-line interface for the flowsift log importer.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowsift::config::{self, Config};
use flowsift::importer::Importer;
use flowsift::store::{MetaStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowsift", version, about = "Network-flow log import and aggregation")]
struct Cli {
    /// Path to a config file (default locations are searched otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a directory of log files into a logical database
    Import {
        /// Directory to scan for .log / .gz files
        directory: PathBuf,

        /// Logical database the import targets
        #[arg(long, short)]
        database: String,
    },
    /// Print a default config file to stdout
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    init_logging(&config);

    match cli.command {
        Command::Import {
            directory,
            database,
        } => run_import(config, &directory, &database).await,
        Command::Config => {
            print!("{}", config::generate_default_config());
            Ok(())
        }
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("flowsift={}", config.logging.level)),
    );

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_import(config: Config, directory: &PathBuf, database: &str) -> anyhow::Result<()> {
    tracing::info!("Flowsift v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", config.storage.data_dir);

    anyhow::ensure!(
        directory.is_dir(),
        "{} is not a directory",
        directory.display()
    );

    let store = Arc::new(
        SqliteStore::open(config.storage.store_path()).context("failed to open datastore")?,
    );
    let meta =
        MetaStore::open(config.storage.meta_path()).context("failed to open metadata store")?;

    let importer = Importer::new(config.import, database, store, meta);
    let stats = importer.run(directory).await?;

    println!("Files discovered:  {}", stats.files_discovered);
    println!("Files imported:    {}", stats.files_imported);
    println!("Records decoded:   {}", stats.records_decoded);
    println!("Decode failures:   {}", stats.decode_failures);
    println!("Connection pairs:  {}", stats.uconn_pairs);
    println!("Hosts written:     {}", stats.hosts_written);
    println!("Domains:           {}", stats.domains);
    println!("Strobes extracted: {}", stats.strobes.pairs_extracted);
    Ok(())
}
