//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了配置校验命令的实现。

use crate::cli::ValidateArgs;
use crate::config::Config;
use anyhow::{bail, Context, Result};

pub async fn execute(args: &ValidateArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }

    println!("Configuration OK: {}", args.config.display());
    println!("  local_host: {}", config.health_check.local_host);
    println!(
        "  check interval: {}s - {}s",
        config.health_check.min_check_interval_sec, config.health_check.max_check_interval_sec
    );
    println!(
        "  checkers: {}",
        config
            .checkers
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}
