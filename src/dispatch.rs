//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块负责在检查节点之间分配实例。
//!
//! 健康的检查节点按权重组成一致性哈希环，每个实例按ID哈希落到一个节点上，
//! 本节点只调度落到自己身上的实例。

use crate::cache_provider::{CacheEvent, CacheProvider};
use crate::config::DispatchConfig;
use crate::model::{hash_of, InstanceWithChecker};
use crate::scheduler::CheckScheduler;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 节点默认权重
pub const DEFAULT_WEIGHT: u32 = 100;

/// 一致性哈希环
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u32, String)>,
}

impl HashRing {
    /// 构建哈希环
    ///
    /// # 参数
    ///
    /// * `buckets` - 节点地址到权重的映射
    /// * `virtual_nodes` - 默认权重下每个节点的虚拟节点数
    pub fn new(buckets: &BTreeMap<String, u32>, virtual_nodes: u32) -> Self {
        let mut points = Vec::new();
        for (host, weight) in buckets {
            let weight = if *weight == 0 { DEFAULT_WEIGHT } else { *weight };
            let replicas = (virtual_nodes as u64 * weight as u64 / DEFAULT_WEIGHT as u64).max(1);
            for i in 0..replicas {
                points.push((hash_of(&format!("{}#{}", host, i)), host.clone()));
            }
        }
        points.sort();
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 查找哈希值所属的节点
    pub fn lookup(&self, hash: u32) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, host) = &self.points[idx % self.points.len()];
        Some(host)
    }
}

struct DispatchState {
    managed: HashMap<String, InstanceWithChecker>,
    buckets: BTreeMap<String, u32>,
    ring: Option<HashRing>,
}

/// 实例分发器
pub struct Dispatcher {
    cache: Arc<CacheProvider>,
    scheduler: Arc<CheckScheduler>,
    config: DispatchConfig,
    local_host: String,
    health_check_changed: AtomicBool,
    self_service_changed: AtomicBool,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<CacheProvider>,
        scheduler: Arc<CheckScheduler>,
        config: DispatchConfig,
        local_host: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            scheduler,
            config,
            local_host: local_host.into(),
            health_check_changed: AtomicBool::new(false),
            self_service_changed: AtomicBool::new(false),
            state: Mutex::new(DispatchState {
                managed: HashMap::new(),
                buckets: BTreeMap::new(),
                ring: None,
            }),
        }
    }

    /// 记录缓存变更，由事件定时器统一处理
    pub fn update_status_by_event(&self, event: CacheEvent) {
        if event.health_check_instances_changed {
            self.health_check_changed.store(true, Ordering::Release);
        }
        if event.self_service_instances_changed {
            self.self_service_changed.store(true, Ordering::Release);
        }
    }

    /// 处理累积的变更标记，返回是否重新计算了分配
    pub async fn process_event(&self) -> bool {
        let self_changed = self.self_service_changed.swap(false, Ordering::AcqRel);
        let instances_changed = self.health_check_changed.swap(false, Ordering::AcqRel);
        if !self_changed && !instances_changed {
            return false;
        }
        let mut state = self.state.lock().await;
        if self_changed {
            self.reload_self_continuum(&mut state);
        }
        self.reload_managed_instances(&mut state).await;
        true
    }

    /// 全量重新计算节点环和分配
    pub async fn ensure(&self) {
        self.self_service_changed.store(false, Ordering::Release);
        self.health_check_changed.store(false, Ordering::Release);
        let mut state = self.state.lock().await;
        self.reload_self_continuum(&mut state);
        self.reload_managed_instances(&mut state).await;
    }

    /// 本节点当前负责的实例数
    pub async fn managed_count(&self) -> usize {
        self.state.lock().await.managed.len()
    }

    /// 本节点是否负责该实例
    pub async fn is_managed(&self, instance_id: &str) -> bool {
        self.state.lock().await.managed.contains_key(instance_id)
    }

    /// 运行分发循环，直到取消
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<CacheEvent>, cancel: CancellationToken) {
        self.ensure().await;

        let event_interval = Duration::from_millis(self.config.event_interval_ms.max(1));
        let ensure_interval = Duration::from_secs(self.config.ensure_interval_sec.max(1));
        let mut event_ticker = interval_at(Instant::now() + event_interval, event_interval);
        event_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ensure_ticker = interval_at(Instant::now() + ensure_interval, ensure_interval);
        ensure_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.update_status_by_event(event),
                    None => events_open = false,
                },
                _ = event_ticker.tick() => {
                    self.process_event().await;
                }
                _ = ensure_ticker.tick() => {
                    self.ensure().await;
                }
            }
        }
        debug!(local_host = %self.local_host, "dispatcher exited");
    }

    fn reload_self_continuum(&self, state: &mut DispatchState) {
        let mut buckets = BTreeMap::new();
        self.cache.range_self_service_instances(|instance| {
            if instance.healthy && !instance.isolate {
                buckets.insert(instance.host.clone(), instance.weight);
            }
            true
        });
        if buckets == state.buckets && state.ring.is_some() == !buckets.is_empty() {
            return;
        }
        if buckets.is_empty() {
            warn!("no available checker nodes, local node checks all instances");
            state.ring = None;
        } else {
            info!(nodes = ?buckets.keys().collect::<Vec<_>>(), "checker nodes changed");
            state.ring = Some(HashRing::new(&buckets, self.config.virtual_nodes));
        }
        state.buckets = buckets;
    }

    fn owns(&self, ring: Option<&HashRing>, iwc: &InstanceWithChecker) -> bool {
        if self.config.shared_checker {
            return true;
        }
        match ring.and_then(|ring| ring.lookup(iwc.hash_value())) {
            Some(host) => host == self.local_host,
            None => true,
        }
    }

    async fn reload_managed_instances(&self, state: &mut DispatchState) {
        let mut next = HashMap::new();
        let ring = state.ring.as_ref();
        self.cache.range_health_check_instances(|iwc| {
            if self.owns(ring, iwc) {
                next.insert(iwc.instance().id.clone(), iwc.clone());
            }
            true
        });

        let prev = std::mem::replace(&mut state.managed, next);
        let (mut added, mut updated, mut removed) = (0usize, 0usize, 0usize);

        for (id, iwc) in &state.managed {
            match prev.get(id) {
                None => {
                    self.scheduler.add_instance(iwc).await;
                    added += 1;
                }
                Some(old) if old.instance().revision != iwc.instance().revision => {
                    self.scheduler.upsert_instance(iwc).await;
                    updated += 1;
                }
                Some(_) => {}
            }
        }
        for (id, old) in &prev {
            if state.managed.contains_key(id) {
                continue;
            }
            self.scheduler.del_instance(old).await;
            removed += 1;
            if self.cache.get_instance(id).is_none() {
                if let Err(e) = old.checker().delete(id).await {
                    warn!(instance = %id, error = %e, "delete heartbeat record failed");
                }
            }
        }

        if added + updated + removed > 0 {
            info!(
                local_host = %self.local_host,
                managed = state.managed.len(),
                added,
                updated,
                removed,
                "managed instances reloaded"
            );
        }
    }
}
