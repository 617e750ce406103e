//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康检查引擎的指标收集和监控功能。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{span, Level};

/// 指标收集器
///
/// 用于收集和存储健康检查引擎的各种运行时指标
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 每个检查器的检查次数与耗时，检查热路径上只做原子累加
    pub checks: Arc<DashMap<String, CheckStats>>,
    /// 健康状态变更次数
    /// key: "healthy" / "unhealthy"
    pub transitions_total: Arc<Mutex<HashMap<String, u64>>>,
    /// 领养批次提交次数
    /// key: "checker:op:result"
    pub adopt_flushes: Arc<Mutex<HashMap<String, u64>>>,
    /// 当前调度中的实例数
    pub scheduled_instances: Arc<Mutex<HashMap<String, usize>>>,
    /// 批量写入缓冲区大小
    pub batch_buffer_size: Arc<Mutex<HashMap<String, usize>>>,
    /// 本地时钟与存储时钟的差值（秒）
    pub time_diff_sec: Arc<Mutex<HashMap<String, i64>>>,
}

/// 单个检查器的检查统计
#[derive(Debug, Default)]
pub struct CheckStats {
    pub healthy: AtomicU64,
    pub unhealthy: AtomicU64,
    pub error: AtomicU64,
    /// 累计耗时（微秒）
    pub duration_micros: AtomicU64,
    pub count: AtomicU64,
}

impl CheckStats {
    fn record(&self, result: &str, duration_secs: f64) {
        let counter = match result {
            "healthy" => &self.healthy,
            "unhealthy" => &self.unhealthy,
            _ => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.duration_micros
            .fetch_add((duration_secs.max(0.0) * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// 平均耗时（秒）
    pub fn avg_duration_secs(&self) -> Option<f64> {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some(self.duration_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0 / count as f64)
    }
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

fn guard<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Metrics {
    /// 记录一次检查
    ///
    /// # 参数
    ///
    /// * `checker` - 检查器名称
    /// * `result` - 检查结果（healthy/unhealthy/error）
    /// * `duration_secs` - 检查耗时
    pub fn record_check(&self, checker: &str, result: &str, duration_secs: f64) {
        let span = span!(Level::TRACE, "health_check", checker, result);
        let _enter = span.enter();
        // 已存在的检查器只持有读锁，不分配键
        if let Some(stats) = self.checks.get(checker) {
            stats.record(result, duration_secs);
            return;
        }
        self.checks
            .entry(checker.to_string())
            .or_default()
            .record(result, duration_secs);
    }

    /// 读取某个检查器某类结果的检查次数
    pub fn checks(&self, checker: &str, result: &str) -> u64 {
        self.checks.get(checker).map_or(0, |stats| {
            let counter = match result {
                "healthy" => &stats.healthy,
                "unhealthy" => &stats.unhealthy,
                _ => &stats.error,
            };
            counter.load(Ordering::Relaxed)
        })
    }

    /// 记录一次健康状态变更
    pub fn record_transition(&self, healthy: bool) {
        let key = if healthy { "healthy" } else { "unhealthy" };
        *guard(&self.transitions_total)
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    /// 记录一次领养批次提交
    pub fn record_adopt_flush(&self, checker: &str, op: &str, success: bool) {
        let result = if success { "ok" } else { "fail" };
        *guard(&self.adopt_flushes)
            .entry(format!("{}:{}:{}", checker, op, result))
            .or_insert(0) += 1;
    }

    /// 设置调度中的实例数
    pub fn set_scheduled(&self, local_host: &str, count: usize) {
        guard(&self.scheduled_instances).insert(local_host.to_string(), count);
    }

    /// 设置批量写入缓冲区大小
    pub fn set_batch_buffer_size(&self, name: &str, size: usize) {
        guard(&self.batch_buffer_size).insert(name.to_string(), size);
    }

    /// 设置时钟差值
    pub fn set_time_diff(&self, name: &str, diff_sec: i64) {
        guard(&self.time_diff_sec).insert(name.to_string(), diff_sec);
    }

    /// 读取计数器
    pub fn transitions(&self, healthy: bool) -> u64 {
        let key = if healthy { "healthy" } else { "unhealthy" };
        guard(&self.transitions_total).get(key).copied().unwrap_or(0)
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为文本格式返回，用于监控系统采集
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;
    let mut output = String::new();

    for stats in metrics.checks.iter() {
        for (result, counter) in [
            ("healthy", &stats.healthy),
            ("unhealthy", &stats.unhealthy),
            ("error", &stats.error),
        ] {
            output.push_str(&format!(
                "health_checks_total{{checker=\"{}\",result=\"{}\"}} {}\n",
                stats.key(),
                result,
                counter.load(Ordering::Relaxed)
            ));
        }
        if let Some(avg) = stats.avg_duration_secs() {
            output.push_str(&format!(
                "health_check_duration_seconds_avg{{checker=\"{}\"}} {:.6}\n",
                stats.key(),
                avg
            ));
        }
    }
    for (k, v) in guard(&metrics.transitions_total).iter() {
        output.push_str(&format!(
            "health_transitions_total{{status=\"{}\"}} {}\n",
            k, v
        ));
    }
    for (k, v) in guard(&metrics.adopt_flushes).iter() {
        output.push_str(&format!("adopt_flushes_total{{labels=\"{}\"}} {}\n", k, v));
    }
    for (k, v) in guard(&metrics.scheduled_instances).iter() {
        output.push_str(&format!("scheduled_instances{{host=\"{}\"}} {}\n", k, v));
    }
    for (k, v) in guard(&metrics.batch_buffer_size).iter() {
        output.push_str(&format!("batch_buffer_size{{name=\"{}\"}} {}\n", k, v));
    }
    for (k, v) in guard(&metrics.time_diff_sec).iter() {
        output.push_str(&format!("time_diff_seconds{{name=\"{}\"}} {}\n", k, v));
    }
    output
}
