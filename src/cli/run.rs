//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了单机运行命令的实现，使用内存存储层。

use crate::cache_provider::CacheListener;
use crate::checker::build_checkers;
use crate::cli::RunArgs;
use crate::config::Config;
use crate::metrics::get_metrics_string;
use crate::server::{Heartbeat, HealthCheckServer};
use crate::store::MemoryStore;
use crate::utils::heartbeat_instance;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn execute(args: &RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    let checkers = build_checkers(&config.checkers).await?;
    let server = HealthCheckServer::builder(config, Arc::new(MemoryStore::new()))
        .checkers(checkers)
        .build()?;
    server.start().await?;

    let cancel = CancellationToken::new();
    let clients = spawn_demo_clients(&server, args, cancel.clone());

    match args.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("shutting down");
    cancel.cancel();
    for client in clients {
        let _ = client.await;
    }
    server.shutdown(true).await;

    println!("{}", get_metrics_string());
    Ok(())
}

fn spawn_demo_clients(
    server: &Arc<HealthCheckServer>,
    args: &RunArgs,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let silent = (args.demo_instances as f64 * args.demo_fail_ratio.clamp(0.0, 1.0)) as usize;
    let mut handles = Vec::with_capacity(args.demo_instances);
    for i in 0..args.demo_instances {
        let instance = heartbeat_instance(&format!("demo-{}", i), "127.0.0.1", 8000 + i as u32, 5);
        server.cache_provider().on_created(&instance);
        if i < silent {
            continue;
        }

        let server = server.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            let mut count = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        count += 1;
                        let heartbeat = Heartbeat {
                            instance_id: instance.id.clone(),
                            count,
                            ..Default::default()
                        };
                        if let Err(e) = server.report(&heartbeat).await {
                            warn!(instance = %instance.id, error = %e, "demo heartbeat failed");
                        }
                    }
                }
            }
        }));
    }
    handles
}
