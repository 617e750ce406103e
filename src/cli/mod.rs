//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oxcheck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Log level")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "validate", about = "Validate a configuration file")]
    Validate(ValidateArgs),

    #[command(name = "run", about = "Run a standalone health check node")]
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[arg(short, long, help = "Path to the TOML configuration file")]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[arg(short, long, help = "Path to the TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Stop after the given number of seconds")]
    pub duration_secs: Option<u64>,

    #[arg(long, default_value_t = 0, help = "Register simulated instances")]
    pub demo_instances: usize,

    #[arg(long, default_value_t = 0.0, help = "Fraction of simulated instances that stop heartbeating")]
    pub demo_fail_ratio: f64,
}

mod run;
mod validate;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::utils::init_logging(&cli.log_level);

    match &cli.command {
        Commands::Validate(args) => validate::execute(args).await,
        Commands::Run(args) => run::execute(args).await,
    }
}
