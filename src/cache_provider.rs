//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块维护需要健康检查的实例快照，以及检查节点自身所在服务的实例集合。
//!
//! 外部的发现缓存通过[`CacheListener`]推送实例的创建、更新和删除，
//! 这里只在集合真正发生变化时发出变更事件。

use crate::checker::HealthChecker;
use crate::model::{HealthCheckType, Instance, InstanceWithChecker};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 变更事件通道容量，满时丢弃事件
pub const CACHE_EVENT_CAPACITY: usize = 100;

/// 按检查类型索引的检查器
pub type CheckerRegistry = HashMap<HealthCheckType, Arc<dyn HealthChecker>>;

/// 缓存变更监听接口
pub trait CacheListener<T>: Send + Sync {
    fn on_created(&self, value: &T);
    fn on_updated(&self, value: &T);
    fn on_deleted(&self, value: &T);
}

/// 缓存变更事件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEvent {
    pub health_check_instances_changed: bool,
    pub self_service_instances_changed: bool,
}

/// 健康检查实例缓存
pub struct CacheProvider {
    health_check_instances: DashMap<String, InstanceWithChecker>,
    self_service_instances: DashMap<String, Arc<Instance>>,
    /// 关闭了健康检查的实例
    disabled_instances: DashSet<String>,
    checkers: CheckerRegistry,
    self_service: String,
    self_service_key: String,
    events_tx: mpsc::Sender<CacheEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<CacheEvent>>>,
}

impl CacheProvider {
    /// 创建实例缓存
    ///
    /// # 参数
    ///
    /// * `checkers` - 可用的检查器
    /// * `self_service` - 检查节点自身所在的服务名
    /// * `self_service_key` - 标识服务名的元数据键
    pub fn new(
        checkers: CheckerRegistry,
        self_service: impl Into<String>,
        self_service_key: impl Into<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(CACHE_EVENT_CAPACITY);
        Self {
            health_check_instances: DashMap::new(),
            self_service_instances: DashMap::new(),
            disabled_instances: DashSet::new(),
            checkers,
            self_service: self_service.into(),
            self_service_key: self_service_key.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// 取走变更事件的接收端，只能取一次
    pub fn cache_events(&self) -> Option<mpsc::Receiver<CacheEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// 是否为检查节点自身的实例
    pub fn is_self_service_instance(&self, instance: &Instance) -> bool {
        instance
            .metadata
            .get(&self.self_service_key)
            .is_some_and(|service| *service == self.self_service)
    }

    /// 查找负责该实例的检查器
    pub fn checker_of(&self, instance: &Instance) -> Option<Arc<dyn HealthChecker>> {
        if !instance.health_check_enabled() {
            return None;
        }
        self.checkers.get(&instance.health_check_type()).cloned()
    }

    /// 需要健康检查的实例
    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.health_check_instances
            .get(instance_id)
            .map(|iwc| iwc.instance().clone())
    }

    /// 需要健康检查的实例及其检查器
    pub fn get_instance_with_checker(&self, instance_id: &str) -> Option<InstanceWithChecker> {
        self.health_check_instances
            .get(instance_id)
            .map(|iwc| iwc.value().clone())
    }

    /// 检查节点自身的实例
    pub fn get_self_service_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.self_service_instances
            .get(instance_id)
            .map(|ins| ins.value().clone())
    }

    /// 实例是否已知且关闭了健康检查
    pub fn is_disabled(&self, instance_id: &str) -> bool {
        self.disabled_instances.contains(instance_id)
    }

    /// 遍历需要健康检查的实例，回调返回false时停止
    pub fn range_health_check_instances<F>(&self, mut f: F)
    where
        F: FnMut(&InstanceWithChecker) -> bool,
    {
        for entry in self.health_check_instances.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// 遍历检查节点自身的实例，回调返回false时停止
    pub fn range_self_service_instances<F>(&self, mut f: F)
    where
        F: FnMut(&Instance) -> bool,
    {
        for entry in self.self_service_instances.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    pub fn health_check_count(&self) -> usize {
        self.health_check_instances.len()
    }

    pub fn self_service_count(&self) -> usize {
        self.self_service_instances.len()
    }

    fn send_event(&self, event: CacheEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "cache event dropped");
        }
    }

    fn notify_health_check_changed(&self) {
        self.send_event(CacheEvent {
            health_check_instances_changed: true,
            ..Default::default()
        });
    }

    fn notify_self_service_changed(&self) {
        self.send_event(CacheEvent {
            self_service_instances_changed: true,
            ..Default::default()
        });
    }

    /// 以修订号比较后保存自身实例，返回是否发生变化
    fn store_self_service_instance(&self, instance: &Instance) -> bool {
        match self.self_service_instances.entry(instance.id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().revision == instance.revision {
                    false
                } else {
                    e.insert(Arc::new(instance.clone()));
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(Arc::new(instance.clone()));
                true
            }
        }
    }

    /// 保存或驱逐业务实例，返回健康检查集合是否发生变化
    fn store_health_check_instance(&self, instance: &Instance) -> bool {
        let checker = match self.checker_of(instance) {
            Some(checker) => checker,
            None => {
                if instance.health_check_enabled() {
                    warn!(
                        instance = %instance.id,
                        check_type = %instance.health_check_type(),
                        "no checker for health check type"
                    );
                } else {
                    self.disabled_instances.insert(instance.id.clone());
                }
                return self.health_check_instances.remove(&instance.id).is_some();
            }
        };
        self.disabled_instances.remove(&instance.id);

        match self.health_check_instances.entry(instance.id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().instance().revision == instance.revision {
                    false
                } else {
                    e.insert(InstanceWithChecker::new(Arc::new(instance.clone()), checker));
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(InstanceWithChecker::new(Arc::new(instance.clone()), checker));
                true
            }
        }
    }

    fn upsert(&self, instance: &Instance) {
        if self.is_self_service_instance(instance) {
            if self.health_check_instances.remove(&instance.id).is_some() {
                self.notify_health_check_changed();
            }
            if self.store_self_service_instance(instance) {
                info!(instance = %instance.id, host = %instance.host, "self service instance changed");
                self.notify_self_service_changed();
            }
        } else if self.store_health_check_instance(instance) {
            debug!(instance = %instance.id, revision = %instance.revision, "health check instance changed");
            self.notify_health_check_changed();
        }
    }
}

impl CacheListener<Instance> for CacheProvider {
    fn on_created(&self, value: &Instance) {
        self.upsert(value);
    }

    fn on_updated(&self, value: &Instance) {
        self.upsert(value);
    }

    fn on_deleted(&self, value: &Instance) {
        self.disabled_instances.remove(&value.id);
        if self.self_service_instances.remove(&value.id).is_some() {
            info!(instance = %value.id, "self service instance removed");
            self.notify_self_service_changed();
        }
        if self.health_check_instances.remove(&value.id).is_some() {
            self.notify_health_check_changed();
        }
    }
}
