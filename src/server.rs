//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康检查服务，负责组装各个组件并管理后台任务的生命周期。

use crate::cache_provider::{CacheProvider, CheckerRegistry};
use crate::checker::{HealthChecker, QueryRequest, QueryResponse, ReportRequest, TimeFn};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{CheckError, Result};
use crate::model::InstanceEventRecord;
use crate::scheduler::CheckScheduler;
use crate::store::Store;
use crate::sync::batch_writer::HeartbeatBatchWriter;
use crate::sync::common::BatchController;
use crate::time_adjust::TimeAdjuster;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 客户端心跳
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    pub instance_id: String,
    pub host: String,
    pub port: u32,
    /// 客户端累计上报次数
    pub count: i64,
}

/// 健康检查服务构建器
pub struct HealthCheckServerBuilder {
    config: Config,
    store: Arc<dyn Store>,
    checkers: Vec<Arc<dyn HealthChecker>>,
    batch: Option<Arc<dyn BatchController>>,
    local_clock: Option<TimeFn>,
}

impl HealthCheckServerBuilder {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            checkers: Vec::new(),
            batch: None,
            local_clock: None,
        }
    }

    /// 注册检查器
    pub fn checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn checkers(mut self, checkers: impl IntoIterator<Item = Arc<dyn HealthChecker>>) -> Self {
        self.checkers.extend(checkers);
        self
    }

    /// 使用外部的批量写入控制器
    pub fn batch_controller(mut self, batch: Arc<dyn BatchController>) -> Self {
        self.batch = Some(batch);
        self
    }

    /// 替换本地时钟
    pub fn local_clock(mut self, clock: TimeFn) -> Self {
        self.local_clock = Some(clock);
        self
    }

    /// 校验配置并组装服务
    pub fn build(self) -> Result<Arc<HealthCheckServer>> {
        self.config.validate().map_err(CheckError::ConfigError)?;

        let mut registry: CheckerRegistry = HashMap::new();
        for checker in self.checkers {
            let check_type = checker.check_type();
            if let Some(existing) = registry.insert(check_type, checker.clone()) {
                return Err(CheckError::ConfigError(format!(
                    "duplicate checker for {}: {} and {}",
                    check_type,
                    existing.name(),
                    checker.name()
                )));
            }
        }
        let health_check = &self.config.health_check;
        if health_check.enable && registry.is_empty() {
            return Err(CheckError::ConfigError(
                "health check enabled without any checker".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let interval = Duration::from_secs(self.config.time_adjust.interval_sec);
        let time_adjuster = Arc::new(match self.local_clock {
            Some(clock) => TimeAdjuster::with_local_clock(self.store.clone(), interval, clock),
            None => TimeAdjuster::new(self.store.clone(), interval),
        });

        let owned_writer = match (&self.batch, self.config.batch_write.enable) {
            (None, true) => Some(Arc::new(HeartbeatBatchWriter::new(
                self.store.clone(),
                self.config.batch_write.clone(),
            ))),
            _ => None,
        };
        let batch: Option<Arc<dyn BatchController>> = match (self.batch, &owned_writer) {
            (Some(batch), _) => Some(batch),
            (None, Some(writer)) => Some(writer.clone() as Arc<dyn BatchController>),
            (None, None) => None,
        };

        let cache = Arc::new(CacheProvider::new(
            registry.clone(),
            health_check.self_service.clone(),
            health_check.self_service_key.clone(),
        ));
        let scheduler = CheckScheduler::new(
            health_check,
            cache.clone(),
            self.store.clone(),
            batch,
            time_adjuster.current_time_fn(),
            &cancel,
        )?;
        let dispatcher = Arc::new(Dispatcher::new(
            cache.clone(),
            scheduler.clone(),
            self.config.dispatch.clone(),
            health_check.local_host.clone(),
        ));

        Ok(Arc::new(HealthCheckServer {
            config: self.config,
            checkers: registry,
            cache,
            time_adjuster,
            scheduler,
            dispatcher,
            owned_writer,
            cancel,
            handles: Mutex::new(Vec::new()),
        }))
    }
}

/// 健康检查服务
pub struct HealthCheckServer {
    config: Config,
    checkers: CheckerRegistry,
    cache: Arc<CacheProvider>,
    time_adjuster: Arc<TimeAdjuster>,
    scheduler: Arc<CheckScheduler>,
    dispatcher: Arc<Dispatcher>,
    owned_writer: Option<Arc<HeartbeatBatchWriter>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthCheckServer {
    pub fn builder(config: Config, store: Arc<dyn Store>) -> HealthCheckServerBuilder {
        HealthCheckServerBuilder::new(config, store)
    }

    /// 启动后台任务
    ///
    /// 依次完成首次时钟校准，启动调度器，再启动分发循环
    #[instrument(skip(self), level = "info", name = "start_health_check_server")]
    pub async fn start(&self) -> Result<()> {
        if !self.config.health_check.enable {
            info!("health check disabled, server not started");
            return Ok(());
        }
        let events = self
            .cache
            .cache_events()
            .ok_or_else(|| CheckError::ConfigError("server already started".to_string()))?;

        if let Some(writer) = &self.owned_writer {
            writer.start();
        }
        if let Err(e) = self.time_adjuster.adjust_once().await {
            warn!(error = %e, "initial time adjust failed, use local clock");
        }

        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.time_adjuster.clone().run(self.cancel.clone()),
        ));
        self.scheduler.start();
        handles.push(tokio::spawn(
            self.dispatcher.clone().run(events, self.cancel.clone()),
        ));
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        info!(
            local_host = %self.config.health_check.local_host,
            checkers = ?self.checkers.values().map(|c| c.name().to_string()).collect::<Vec<_>>(),
            "health check server started"
        );
        Ok(())
    }

    /// 关闭服务
    ///
    /// # 参数
    ///
    /// * `wait` - 是否等待正在执行的检查回调结束
    pub async fn shutdown(&self, wait: bool) {
        self.cancel.cancel();
        self.scheduler.stop(wait).await;
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(writer) = &self.owned_writer {
            writer.stop().await;
        }
        info!("health check server stopped");
    }

    /// 处理客户端心跳
    pub async fn report(&self, heartbeat: &Heartbeat) -> Result<()> {
        let id = &heartbeat.instance_id;
        let (instance, checker) = match self.cache.get_instance_with_checker(id) {
            Some(iwc) => (iwc.instance().clone(), iwc.checker().clone()),
            None => {
                if self.cache.is_disabled(id) {
                    return Err(CheckError::HeartbeatOnDisabledInstance(id.clone()));
                }
                let instance = self
                    .cache
                    .get_self_service_instance(id)
                    .ok_or_else(|| CheckError::NotFound(id.clone()))?;
                let checker = self
                    .cache
                    .checker_of(&instance)
                    .ok_or_else(|| CheckError::HeartbeatOnDisabledInstance(id.clone()))?;
                (instance, checker)
            }
        };

        let request = ReportRequest {
            instance_id: id.clone(),
            host: if heartbeat.host.is_empty() {
                instance.host.clone()
            } else {
                heartbeat.host.clone()
            },
            port: if heartbeat.port == 0 {
                instance.port
            } else {
                heartbeat.port
            },
            local_host: self.config.health_check.local_host.clone(),
            cur_time_sec: self.time_adjuster.current_time_sec(),
            count: heartbeat.count,
        };
        debug!(instance = %id, cur_time_sec = request.cur_time_sec, "heartbeat received");
        checker.report(&request).await
    }

    /// 查询实例最近一次心跳
    pub async fn last_heartbeat(&self, instance_id: &str) -> Result<QueryResponse> {
        let iwc = self
            .cache
            .get_instance_with_checker(instance_id)
            .ok_or_else(|| CheckError::NotFound(instance_id.to_string()))?;
        iwc.checker()
            .query(&QueryRequest {
                instance_id: instance_id.to_string(),
                host: iwc.instance().host.clone(),
                port: iwc.instance().port,
                healthy: iwc.instance().healthy,
            })
            .await
    }

    pub fn cache_provider(&self) -> &Arc<CacheProvider> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<CheckScheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn time_adjuster(&self) -> &Arc<TimeAdjuster> {
        &self.time_adjuster
    }

    /// 订阅健康状态变更记录
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEventRecord> {
        self.scheduler.subscribe_events()
    }
}
