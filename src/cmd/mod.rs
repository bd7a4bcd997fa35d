use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use blob_store::BlobStore;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info_span};

use crate::{config::CliConfig, tracing::setup_tracing};

mod blob;
mod init_config;
mod store;

/// Global arguments for the CLI. These are arguments that are shared across all
/// subcommands.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    #[arg(
        global = true,
        short = 'c',
        long,
        value_name = "config file",
        help = "Path to config file; defaults plus BLOBSTORE_ overrides when omitted"
    )]
    pub config: Option<PathBuf>,

    /// how verbose the logging should be
    #[arg(
        global = true,
        short = 'v',
        long = None,
        default_value = "1",
        action = clap::ArgAction::Count,
    )]
    pub verbosity: u8,
}

impl GlobalArgs {
    fn load_config(&self) -> Result<CliConfig> {
        match &self.config {
            Some(path) => CliConfig::from_path(path),
            None => CliConfig::from_env(),
        }
    }
}

/// The list of commands that can be run against a blob store.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a default config file
    InitConfig(init_config::Args),
    #[command(flatten)]
    Store(StoreCommands),
}

/// Commands that open the configured store.
#[derive(Debug, Subcommand)]
pub enum StoreCommands {
    /// Store a file as a new blob
    Put(blob::PutArgs),
    /// Write a blob's content to a file or stdout
    Get(blob::GetArgs),
    /// Copy a blob into a new blob
    Copy(blob::CopyArgs),
    /// Delete a blob, soft or hard depending on retention
    Delete(blob::DeleteArgs),
    /// Restore a soft-deleted blob
    Undelete(blob::IdArgs),
    /// Show a blob's attributes
    Stat(blob::IdArgs),
    /// List blob ids
    List(store::ListArgs),
    /// Show the store's blob count and total size
    Metrics,
    /// Remove the store's bookkeeping and, when empty, its bucket
    Remove,
}

impl StoreCommands {
    async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        match self {
            StoreCommands::Put(args) => args.run(store).await,
            StoreCommands::Get(args) => args.run(store).await,
            StoreCommands::Copy(args) => args.run(store).await,
            StoreCommands::Delete(args) => args.run(store).await,
            StoreCommands::Undelete(args) => args.undelete(store).await,
            StoreCommands::Stat(args) => args.stat(store).await,
            StoreCommands::List(args) => args.run(store).await,
            StoreCommands::Metrics => store::metrics(store).await,
            StoreCommands::Remove => store::remove(store).await,
        }
    }
}

/// The main CLI struct. This is the root of the CLI tree.
#[derive(Debug, Parser)]
#[command(name = "blobstore")]
#[command(version, about = "CLI for artifact blob stores", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

impl Cli {
    /// Run the CLI
    pub async fn run(self) -> Result<()> {
        let command = match self.command {
            Commands::InitConfig(args) => return args.run(),
            Commands::Store(command) => command,
        };

        let config = self.global_args.load_config()?;
        setup_tracing(&config, self.global_args.verbosity);
        let root_span = info_span!(
            "blobstore",
            env = config.env,
            store = config.store.name,
            bucket = config.store.bucket
        );
        let _guard = root_span.enter();

        let store = BlobStore::connect(config.store).await?;
        let result = command.run(&store).await;
        if let Err(err) = &result {
            error!("Command failed: {:?}", err);
        }
        store.stop().await;
        result
    }
}
