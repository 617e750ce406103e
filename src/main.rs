//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块是健康检查服务的入口点。

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    oxcheck::cli::run().await
}
