use anyhow::Result;
use clap::Parser;

mod cmd;
mod config;
mod tracing;

#[tokio::main]
async fn main() -> Result<()> {
    cmd::Cli::parse().run().await
}
