use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::config::CliConfig;

#[derive(Debug, ClapArgs)]
pub struct Args {
    #[arg(short, long, default_value = "blobstore.yaml")]
    path: PathBuf,
}

impl Args {
    pub fn run(self) -> Result<()> {
        let Self { path } = self;

        println!("Initializing config file at: {}", path.display());
        CliConfig::generate(&path)
            .map_err(|e| e.context(format!("failed to generate config file at: {}", path.display())))
    }
}
