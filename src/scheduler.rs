//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了健康检查调度器。
//!
//! 每个被调度的实例在时间轮上始终只有一个待触发的检查任务。检查完成后根据结果
//! 计算下一次检查的延迟并重新入轮。实例加入或离开调度时，向对应检查器声明或
//! 撤销领养关系，这些声明由后台任务按检查器分组批量提交。

use crate::cache_provider::CacheProvider;
use crate::checker::{AdoptRequest, CheckRequest, CheckResponse, HealthChecker, QueryRequest, TimeFn};
use crate::config::HealthCheckConfig;
use crate::error::{CheckError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::model::{Instance, InstanceEventRecord, InstanceWithChecker};
use crate::store::Store;
use crate::sync::common::BatchController;
use crate::timewheel::TimeWheel;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 实例未声明TTL时使用的心跳有效期（秒）
pub const DEFAULT_TTL_SEC: u32 = 5;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const JITTER_MS: u64 = 1000;

/// 实例的可变调度状态，只在持有实例锁时读写
struct ValueState {
    host: String,
    port: u32,
    /// 实例声明的TTL（秒），0表示未声明
    ttl_sec: u32,
    expire_duration_sec: u32,
    checker: Arc<dyn HealthChecker>,
}

/// 被调度的实例
struct InstanceValue {
    id: String,
    /// 调度代次，实例被删除后重新加入会得到新的代次
    generation: u64,
    state: tokio::sync::Mutex<ValueState>,
}

/// 时间轮上的检查任务
#[derive(Debug, Clone)]
struct CheckTask {
    instance_id: String,
    generation: u64,
}

/// 领养事件
struct AdoptEvent {
    instance_id: String,
    add: bool,
    checker: Arc<dyn HealthChecker>,
}

fn expire_duration_of(ttl_sec: u32, multiplier: u32) -> u32 {
    let ttl_sec = if ttl_sec == 0 { DEFAULT_TTL_SEC } else { ttl_sec };
    ttl_sec.saturating_mul(multiplier.max(1))
}

/// 健康实例的下次检查延迟（秒）
///
/// 在心跳即将过期时检查，至少间隔`min_check_interval_sec`
pub(crate) fn healthy_delay_sec(
    expire_duration_sec: u32,
    last_heartbeat_sec: i64,
    now_sec: i64,
    min_check_interval_sec: u64,
) -> u64 {
    let expire = expire_duration_sec as u64;
    let remaining = if last_heartbeat_sec <= 0 {
        expire
    } else {
        let elapsed = (now_sec - last_heartbeat_sec).max(0) as u64;
        expire.saturating_sub(elapsed)
    };
    remaining.max(min_check_interval_sec)
}

/// 不健康实例（或本次没有得到有效结果）的下次检查延迟（秒）
pub(crate) fn unhealthy_delay_sec(expire_duration_sec: u32, max_check_interval_sec: u64) -> u64 {
    let expire = expire_duration_sec as u64;
    if max_check_interval_sec > 0 {
        expire.min(max_check_interval_sec)
    } else {
        expire
    }
}

fn jitter_ms() -> u64 {
    rand::thread_rng().gen_range(0..JITTER_MS)
}

/// 健康检查调度器
pub struct CheckScheduler {
    me: Weak<Self>,
    scheduled: DashMap<String, Arc<InstanceValue>>,
    wheel: Arc<TimeWheel<CheckTask>>,
    cache: Arc<CacheProvider>,
    store: Arc<dyn Store>,
    batch: Option<Arc<dyn BatchController>>,
    time_fn: TimeFn,
    local_host: String,
    min_check_interval_sec: u64,
    max_check_interval_sec: u64,
    expire_multiplier: u32,
    adopt_batch_count: usize,
    adopt_batch_interval: Duration,
    adopt_tx: mpsc::Sender<AdoptEvent>,
    adopt_rx: Mutex<Option<mpsc::Receiver<AdoptEvent>>>,
    adopt_handle: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    cancel: CancellationToken,
    events: broadcast::Sender<InstanceEventRecord>,
}

impl CheckScheduler {
    /// 创建调度器
    ///
    /// # 参数
    ///
    /// * `config` - 健康检查配置
    /// * `cache` - 实例缓存，检查前从中读取实例快照
    /// * `store` - 存储层，持久化健康状态变更
    /// * `batch` - 可选的批量写入控制器
    /// * `time_fn` - 与存储层对齐的当前时间
    /// * `cancel` - 上层的取消令牌
    pub fn new(
        config: &HealthCheckConfig,
        cache: Arc<CacheProvider>,
        store: Arc<dyn Store>,
        batch: Option<Arc<dyn BatchController>>,
        time_fn: TimeFn,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let wheel = TimeWheel::new(
            format!("check-{}", config.local_host),
            Duration::from_millis(config.time_wheel.interval_ms),
            config.time_wheel.slot_num,
        )
        .ok_or_else(|| {
            CheckError::ConfigError(format!(
                "invalid time wheel: interval_ms={}, slot_num={}",
                config.time_wheel.interval_ms, config.time_wheel.slot_num
            ))
        })?;
        let (adopt_tx, adopt_rx) = mpsc::channel(config.adoption.channel_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scheduled: DashMap::new(),
            wheel,
            cache,
            store,
            batch,
            time_fn,
            local_host: config.local_host.clone(),
            min_check_interval_sec: config.min_check_interval_sec,
            max_check_interval_sec: config.max_check_interval_sec,
            expire_multiplier: config.expire_multiplier,
            adopt_batch_count: config.adoption.batch_count.max(1),
            adopt_batch_interval: Duration::from_millis(config.adoption.batch_interval_ms.max(1)),
            adopt_tx,
            adopt_rx: Mutex::new(Some(adopt_rx)),
            adopt_handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            cancel: cancel.child_token(),
            events,
        }))
    }

    /// 启动时间轮和领养批处理任务，重复调用无效
    pub fn start(&self) {
        let rx = self
            .adopt_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(rx) = rx else {
            return;
        };
        self.wheel.start();
        let batcher = AdoptionBatcher {
            rx,
            local_host: self.local_host.clone(),
            batch_count: self.adopt_batch_count,
            interval: self.adopt_batch_interval,
            cancel: self.cancel.clone(),
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(batcher.run());
        *self
            .adopt_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(local_host = %self.local_host, "check scheduler started");
    }

    /// 停止调度
    ///
    /// # 参数
    ///
    /// * `wait` - 是否等待正在执行的检查回调结束
    pub async fn stop(&self, wait: bool) {
        self.cancel.cancel();
        self.wheel.stop(wait).await;
        let handle = self
            .adopt_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(local_host = %self.local_host, "check scheduler stopped");
    }

    /// 订阅健康状态变更记录
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEventRecord> {
        self.events.subscribe()
    }

    /// 调度中的实例数
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_scheduled(&self, instance_id: &str) -> bool {
        self.scheduled.contains_key(instance_id)
    }

    /// 时间轮上等待触发的检查数
    pub fn pending_checks(&self) -> usize {
        self.wheel.len()
    }

    /// 将实例加入调度
    ///
    /// 已在调度中时不做任何事并返回false
    pub async fn add_instance(&self, iwc: &InstanceWithChecker) -> bool {
        let instance = iwc.instance();
        let value = match self.scheduled.entry(instance.id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(e) => {
                let value = Arc::new(InstanceValue {
                    id: instance.id.clone(),
                    generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
                    state: tokio::sync::Mutex::new(ValueState {
                        host: instance.host.clone(),
                        port: instance.port,
                        ttl_sec: instance.ttl_sec(),
                        expire_duration_sec: expire_duration_of(
                            instance.ttl_sec(),
                            self.expire_multiplier,
                        ),
                        checker: iwc.checker().clone(),
                    }),
                });
                e.insert(value.clone());
                value
            }
        };
        GLOBAL_METRICS.set_scheduled(&self.local_host, self.scheduled.len());
        info!(
            instance = %instance.id,
            host = %instance.host,
            port = instance.port,
            checker = iwc.checker().name(),
            "add instance to check"
        );

        self.add_adopting(&instance.id, iwc.checker().clone(), true)
            .await;
        self.schedule(&value, self.min_check_interval_sec * 1000 + jitter_ms());
        true
    }

    /// 更新调度中的实例，不在调度中时加入调度
    ///
    /// 只更新地址、TTL和检查器，不影响已在时间轮上的检查任务
    pub async fn upsert_instance(&self, iwc: &InstanceWithChecker) -> bool {
        let value = self
            .scheduled
            .get(&iwc.instance().id)
            .map(|v| v.value().clone());
        let Some(value) = value else {
            return self.add_instance(iwc).await;
        };

        let instance = iwc.instance();
        let replaced = {
            let mut state = value.state.lock().await;
            state.host = instance.host.clone();
            state.port = instance.port;
            if state.ttl_sec != instance.ttl_sec() {
                debug!(instance = %instance.id, from = state.ttl_sec, to = instance.ttl_sec(), "ttl changed");
                state.ttl_sec = instance.ttl_sec();
                state.expire_duration_sec =
                    expire_duration_of(state.ttl_sec, self.expire_multiplier);
            }
            if state.checker.name() != iwc.checker().name() {
                Some(std::mem::replace(&mut state.checker, iwc.checker().clone()))
            } else {
                None
            }
        };
        debug!(instance = %instance.id, revision = %instance.revision, "update scheduled instance");

        if let Some(prev) = replaced {
            self.add_adopting(&instance.id, prev, false).await;
            self.add_adopting(&instance.id, iwc.checker().clone(), true)
                .await;
        }
        false
    }

    /// 将实例移出调度
    ///
    /// 时间轮上残留的检查任务触发时发现实例已不在调度中，直接结束
    pub async fn del_instance(&self, iwc: &InstanceWithChecker) -> bool {
        let instance = iwc.instance();
        if self.scheduled.remove(&instance.id).is_none() {
            return false;
        }
        GLOBAL_METRICS.set_scheduled(&self.local_host, self.scheduled.len());
        info!(instance = %instance.id, host = %instance.host, "remove instance from check");
        self.add_adopting(&instance.id, iwc.checker().clone(), false)
            .await;
        true
    }

    async fn add_adopting(&self, instance_id: &str, checker: Arc<dyn HealthChecker>, add: bool) {
        let event = AdoptEvent {
            instance_id: instance_id.to_string(),
            add,
            checker,
        };
        tokio::select! {
            res = self.adopt_tx.send(event) => {
                if res.is_err() {
                    debug!(instance = instance_id, "adoption loop closed, event dropped");
                }
            }
            _ = self.cancel.cancelled() => {
                debug!(instance = instance_id, "scheduler stopping, adoption event dropped");
            }
        }
    }

    fn schedule(&self, value: &InstanceValue, delay_ms: u64) {
        let me = self.me.clone();
        let task = CheckTask {
            instance_id: value.id.clone(),
            generation: value.generation,
        };
        let added = self.wheel.add_task(delay_ms, task, move |task| async move {
            if let Some(scheduler) = me.upgrade() {
                scheduler.check_callback(task).await;
            }
        });
        if !added {
            debug!(instance = %value.id, "time wheel stopped, check not scheduled");
        }
    }

    fn is_current(&self, value: &InstanceValue) -> bool {
        self.scheduled
            .get(&value.id)
            .is_some_and(|v| v.generation == value.generation)
    }

    async fn check_callback(&self, task: CheckTask) {
        let value = self
            .scheduled
            .get(&task.instance_id)
            .map(|v| v.value().clone());
        let Some(value) = value else {
            debug!(instance = %task.instance_id, "instance not scheduled, skip check");
            return;
        };
        if value.generation != task.generation {
            debug!(instance = %task.instance_id, "stale check task, skip");
            return;
        }

        let state = value.state.lock().await;
        let response = match self.cache.get_instance(&value.id) {
            Some(instance) => self.do_check(&state, &instance).await,
            None => {
                info!(instance = %value.id, "instance not found in cache, skip check");
                None
            }
        };

        if !self.is_current(&value) {
            debug!(instance = %value.id, "instance removed during check, not rescheduled");
            return;
        }

        let delay_sec = match response {
            Some(resp) if resp.regular && resp.healthy => healthy_delay_sec(
                state.expire_duration_sec,
                resp.last_heartbeat_time_sec,
                (self.time_fn)(),
                self.min_check_interval_sec,
            ),
            _ => unhealthy_delay_sec(state.expire_duration_sec, self.max_check_interval_sec),
        };
        drop(state);
        self.schedule(&value, delay_sec * 1000 + jitter_ms());
    }

    async fn do_check(&self, state: &ValueState, instance: &Arc<Instance>) -> Option<CheckResponse> {
        let request = CheckRequest {
            query: QueryRequest {
                instance_id: instance.id.clone(),
                host: state.host.clone(),
                port: state.port,
                healthy: instance.healthy,
            },
            expire_duration_sec: state.expire_duration_sec,
            cur_time_sec: self.time_fn.clone(),
        };
        let started = Instant::now();
        match state.checker.check(&request).await {
            Ok(resp) => {
                GLOBAL_METRICS.record_check(
                    state.checker.name(),
                    if resp.healthy { "healthy" } else { "unhealthy" },
                    started.elapsed().as_secs_f64(),
                );
                if !resp.stay_unchanged && resp.healthy != instance.healthy {
                    self.persist_transition(instance, &resp).await;
                }
                Some(resp)
            }
            Err(e) => {
                GLOBAL_METRICS.record_check(
                    state.checker.name(),
                    "error",
                    started.elapsed().as_secs_f64(),
                );
                warn!(instance = %instance.id, checker = state.checker.name(), error = %e, "health check failed");
                None
            }
        }
    }

    async fn persist_transition(&self, instance: &Instance, resp: &CheckResponse) {
        let healthy = resp.healthy;
        let result = match &self.batch {
            Some(batch) if batch.heartbeat_open() => {
                let mut fut = batch.async_heartbeat(instance, healthy);
                fut.wait().await
            }
            _ => {
                self.store
                    .set_instance_health_status(
                        &instance.id,
                        Instance::status_of(healthy),
                        &Uuid::new_v4().to_string(),
                    )
                    .await
            }
        };
        let persisted = match result {
            Ok(()) => true,
            Err(e) => {
                error!(instance = %instance.id, healthy, error = %e, "persist health status failed");
                false
            }
        };
        GLOBAL_METRICS.record_transition(healthy);

        let record = InstanceEventRecord {
            instance_id: instance.id.clone(),
            service: instance.service.clone(),
            namespace: instance.namespace.clone(),
            host: instance.host.clone(),
            port: instance.port,
            healthy,
            last_heartbeat_sec: resp.last_heartbeat_time_sec,
            local_host: self.local_host.clone(),
            persisted,
            create_time: Utc::now(),
        };
        info!(
            target: "oxcheck::audit",
            instance = %record.instance_id,
            service = %record.service,
            namespace = %record.namespace,
            host = %record.host,
            port = record.port,
            healthy,
            last_heartbeat_sec = record.last_heartbeat_sec,
            persisted,
            "instance health status changed"
        );
        let _ = self.events.send(record);
    }
}

/// 单个检查器上待提交的领养变更
struct PendingAdoption {
    checker: Arc<dyn HealthChecker>,
    to_add: HashSet<String>,
    to_remove: HashSet<String>,
    /// 上次提交失败后只在定时器触发时重试
    add_failed: bool,
    remove_failed: bool,
}

impl PendingAdoption {
    fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self {
            checker,
            to_add: HashSet::new(),
            to_remove: HashSet::new(),
            add_failed: false,
            remove_failed: false,
        }
    }
}

/// 领养事件批处理
///
/// 单一消费者，按检查器分组；同一实例的增删相互抵消。
/// 数量达到阈值或定时器触发时提交，提交失败的集合保留到下一次定时器触发。
struct AdoptionBatcher {
    rx: mpsc::Receiver<AdoptEvent>,
    local_host: String,
    batch_count: usize,
    interval: Duration,
    cancel: CancellationToken,
    pending: HashMap<String, PendingAdoption>,
}

impl AdoptionBatcher {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.accept(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_all().await,
            }
        }
        debug!(local_host = %self.local_host, "adoption loop exited");
    }

    async fn accept(&mut self, event: AdoptEvent) {
        let pending = self
            .pending
            .entry(event.checker.name().to_string())
            .or_insert_with(|| PendingAdoption::new(event.checker.clone()));
        if event.add {
            if !pending.to_remove.remove(&event.instance_id) {
                pending.to_add.insert(event.instance_id);
            }
        } else if !pending.to_add.remove(&event.instance_id) {
            pending.to_remove.insert(event.instance_id);
        }

        if !pending.add_failed && pending.to_add.len() >= self.batch_count {
            flush_pending(pending, &self.local_host, true).await;
        }
        if !pending.remove_failed && pending.to_remove.len() >= self.batch_count {
            flush_pending(pending, &self.local_host, false).await;
        }
    }

    async fn flush_all(&mut self) {
        for pending in self.pending.values_mut() {
            flush_pending(pending, &self.local_host, true).await;
            flush_pending(pending, &self.local_host, false).await;
        }
    }
}

async fn flush_pending(pending: &mut PendingAdoption, local_host: &str, add: bool) {
    let (set, failed) = if add {
        (&mut pending.to_add, &mut pending.add_failed)
    } else {
        (&mut pending.to_remove, &mut pending.remove_failed)
    };
    if set.is_empty() {
        return;
    }
    let mut instances: Vec<String> = set.iter().cloned().collect();
    instances.sort();
    let request = AdoptRequest {
        instances,
        local_host: local_host.to_string(),
    };
    let (op, result) = if add {
        ("add", pending.checker.add_to_check(&request).await)
    } else {
        ("remove", pending.checker.remove_from_check(&request).await)
    };
    match result {
        Ok(()) => {
            debug!(checker = pending.checker.name(), op, count = request.instances.len(), "adoption flushed");
            GLOBAL_METRICS.record_adopt_flush(pending.checker.name(), op, true);
            set.clear();
            *failed = false;
        }
        Err(e) => {
            error!(checker = pending.checker.name(), op, count = request.instances.len(), error = %e, "adoption flush failed, will retry");
            GLOBAL_METRICS.record_adopt_flush(pending.checker.name(), op, false);
            *failed = true;
        }
    }
}
