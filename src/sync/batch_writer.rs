//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康状态批量写入器，合并短时间内的状态变更后批量写入存储层。

use super::common::*;
use crate::config::BatchWriteConfig;
use crate::model::Instance;
use crate::store::Store;

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 缓冲区条目
///
/// 同一实例的多次提交合并为一条，以最后一次的状态为准
struct BufferEntry {
    healthy: bool,
    waiters: Vec<oneshot::Sender<WriteCode>>,
}

/// 心跳批量写入器
pub struct HeartbeatBatchWriter {
    /// 缓冲区
    buffer: Arc<DashMap<String, BufferEntry>>,
    /// 存储层
    store: Arc<dyn Store>,
    /// 刷新触发器
    flush_trigger: Arc<Notify>,
    /// 配置
    config: BatchWriteConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatBatchWriter {
    /// 创建新的批量写入器
    ///
    /// # 参数
    ///
    /// * `store` - 存储层
    /// * `config` - 批量写入配置
    pub fn new(store: Arc<dyn Store>, config: BatchWriteConfig) -> Self {
        Self {
            buffer: Arc::new(DashMap::new()),
            store,
            flush_trigger: Arc::new(Notify::new()),
            config,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 启动批量写入器
    ///
    /// 启动后台任务，定期或按需刷新缓冲区
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        let buffer = self.buffer.clone();
        let store = self.store.clone();
        let trigger = self.flush_trigger.clone();
        let max_batch_size = self.config.max_batch_size.max(1);
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let cancel = self.cancel.clone();

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        while !buffer.is_empty() {
                            Self::flush(&buffer, store.as_ref(), max_batch_size).await;
                        }
                        break;
                    }
                    _ = interval.tick() => {
                        Self::flush(&buffer, store.as_ref(), max_batch_size).await;
                    }
                    _ = trigger.notified() => {
                        Self::flush(&buffer, store.as_ref(), max_batch_size).await;
                    }
                }
            }
            tracing::debug!("HeartbeatBatchWriter exited");
        }));
    }

    /// 停止批量写入器，剩余缓冲在退出前写入
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// 缓冲中的实例数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 将一个批次写入存储层
    ///
    /// 按目标状态分组，每组一次批量写入，结果通知到每个等待者
    async fn flush(buffer: &DashMap<String, BufferEntry>, store: &dyn Store, max_batch_size: usize) {
        if buffer.is_empty() {
            return;
        }

        let keys: Vec<String> = buffer
            .iter()
            .take(max_batch_size)
            .map(|entry| entry.key().clone())
            .collect();

        let mut healthy_ids = Vec::new();
        let mut healthy_waiters = Vec::new();
        let mut unhealthy_ids = Vec::new();
        let mut unhealthy_waiters = Vec::new();
        for key in keys {
            if let Some((id, entry)) = buffer.remove(&key) {
                if entry.healthy {
                    healthy_ids.push(id);
                    healthy_waiters.extend(entry.waiters);
                } else {
                    unhealthy_ids.push(id);
                    unhealthy_waiters.extend(entry.waiters);
                }
            }
        }

        for (healthy, ids, waiters) in [
            (true, healthy_ids, healthy_waiters),
            (false, unhealthy_ids, unhealthy_waiters),
        ] {
            if ids.is_empty() {
                continue;
            }
            let revision = Uuid::new_v4().to_string();
            let code = match store
                .batch_set_instance_health_status(&ids, Instance::status_of(healthy), &revision)
                .await
            {
                Ok(()) => {
                    tracing::debug!("batch wrote {} health status, healthy={}", ids.len(), healthy);
                    WriteCode::ExecuteSuccess
                }
                Err(e) => {
                    tracing::error!("batch health status write failed: {}", e);
                    WriteCode::StoreLayerException
                }
            };
            for waiter in waiters {
                let _ = waiter.send(code);
            }
        }

        crate::metrics::GLOBAL_METRICS.set_batch_buffer_size("heartbeat", buffer.len());
    }
}

impl BatchController for HeartbeatBatchWriter {
    fn heartbeat_open(&self) -> bool {
        self.config.enable && !self.cancel.is_cancelled()
    }

    fn async_heartbeat(&self, instance: &Instance, healthy: bool) -> HeartbeatFuture {
        if self.cancel.is_cancelled() {
            return HeartbeatFuture::ready(WriteCode::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut entry = self
                .buffer
                .entry(instance.id.clone())
                .or_insert_with(|| BufferEntry {
                    healthy,
                    waiters: Vec::new(),
                });
            entry.healthy = healthy;
            entry.waiters.push(tx);
        }

        let len = self.buffer.len();
        crate::metrics::GLOBAL_METRICS.set_batch_buffer_size("heartbeat", len);
        if len >= self.config.max_batch_size {
            self.flush_trigger.notify_one();
        }
        HeartbeatFuture::new(rx)
    }
}
