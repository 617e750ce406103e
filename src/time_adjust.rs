//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了本地时钟与存储层时钟的校准。

use crate::checker::{system_time_sec, TimeFn};
use crate::error::Result;
use crate::store::Store;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 时钟校准器
///
/// 周期性地读取存储层时间，保存`本地时间 - 存储时间`的差值。
/// 检查器通过[`TimeAdjuster::current_time_sec`]获取与存储层对齐的当前时间。
pub struct TimeAdjuster {
    store: Arc<dyn Store>,
    diff: AtomicI64,
    local_clock: TimeFn,
    interval: Duration,
}

impl TimeAdjuster {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self::with_local_clock(store, interval, Arc::new(system_time_sec))
    }

    /// 使用指定的本地时钟创建校准器
    pub fn with_local_clock(store: Arc<dyn Store>, interval: Duration, local_clock: TimeFn) -> Self {
        Self {
            store,
            diff: AtomicI64::new(0),
            local_clock,
            interval,
        }
    }

    /// 当前的时钟差值（秒）
    pub fn get_diff(&self) -> i64 {
        self.diff.load(Ordering::Acquire)
    }

    /// 校准后的当前时间（秒）
    pub fn current_time_sec(&self) -> i64 {
        (self.local_clock)() - self.get_diff()
    }

    /// 校准后的时间函数
    pub fn current_time_fn(self: &Arc<Self>) -> TimeFn {
        let this = self.clone();
        Arc::new(move || this.current_time_sec())
    }

    /// 执行一次校准，失败时保留上一次的差值
    pub async fn adjust_once(&self) -> Result<i64> {
        let store_now = self.store.get_now().await?;
        let local_now = (self.local_clock)();
        let diff = local_now - store_now;
        let prev = self.diff.swap(diff, Ordering::AcqRel);
        if prev != diff {
            info!(prev, diff, store_now, local_now, "time diff adjusted");
        }
        crate::metrics::GLOBAL_METRICS.set_time_diff("store", diff);
        Ok(diff)
    }

    /// 周期性校准，直到取消
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("time adjuster exiting");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.adjust_once().await {
                        warn!(error = %e, diff = self.get_diff(), "time adjust failed, keep previous diff");
                    }
                }
            }
        }
    }
}
