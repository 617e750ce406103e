//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了分槽加锁的时间轮，用于大量一次性延迟回调的调度。
//!
//! 每个槽位持有独立的锁，指针每个间隔前进一格，只处理当前到期的槽位。
//! 到期任务的回调在独立的tokio任务中执行（无界派发，由`TaskTracker`跟踪），
//! 因此慢回调不会阻塞时间轮。

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

type Callback<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

/// 时间轮中的任务
struct Task<T> {
    /// 剩余需要转动的圈数
    circle: usize,
    payload: T,
    callback: Callback<T>,
}

/// 时间轮
pub struct TimeWheel<T> {
    name: String,
    interval: Duration,
    slots: Vec<Mutex<Vec<Task<T>>>>,
    current_pos: AtomicUsize,
    pending: AtomicUsize,
    cancel: CancellationToken,
    tracker: TaskTracker,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> TimeWheel<T> {
    /// 创建新的时间轮
    ///
    /// # 参数
    ///
    /// * `name` - 时间轮名称，用于日志
    /// * `interval` - 指针移动间隔
    /// * `slot_num` - 槽位数量
    ///
    /// # 返回值
    ///
    /// 间隔或槽位数为0时返回None
    pub fn new(name: impl Into<String>, interval: Duration, slot_num: usize) -> Option<Arc<Self>> {
        if interval.is_zero() || slot_num == 0 {
            return None;
        }
        let slots = (0..slot_num).map(|_| Mutex::new(Vec::new())).collect();
        Some(Arc::new(Self {
            name: name.into(),
            interval,
            slots,
            current_pos: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ticker: Mutex::new(None),
        }))
    }

    /// 启动时间轮的指针循环，重复调用无效
    pub fn start(self: &Arc<Self>) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let name = self.name.clone();

        info!(
            wheel = %name,
            interval_ms = interval.as_millis() as u64,
            slots = self.slots.len(),
            "TimeWheel starting"
        );

        *ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(wheel = %name, "TimeWheel ticker exiting");
                        break;
                    }
                    _ = ticks.tick() => {
                        match weak.upgrade() {
                            Some(wheel) => wheel.on_tick(),
                            None => break,
                        }
                    }
                }
            }
        }));
    }

    /// 添加延迟任务
    ///
    /// 延迟精度受指针间隔限制：任务在`delay_ms / interval + 1`次指针移动后触发，
    /// 不足一个间隔的延迟也要等到下一次移动。
    ///
    /// # 返回值
    ///
    /// 时间轮已停止时返回false，任务不会被执行
    pub fn add_task<F, Fut>(&self, delay_ms: u64, payload: T, callback: F) -> bool
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }

        let slot_num = self.slots.len();
        let interval_ms = (self.interval.as_millis() as u64).max(1);
        let ticks = (delay_ms / interval_ms) as usize + 1;
        let circle = (ticks - 1) / slot_num;
        let task = Task {
            circle,
            payload,
            callback: Box::new(move |payload| callback(payload).boxed()),
        };

        loop {
            let pos = self.current_pos.load(Ordering::Acquire);
            let target = (pos + ticks) % slot_num;
            let mut slot = lock(&self.slots[target]);
            // 指针在计算期间移动过则重新定位，避免任务提前触发
            if self.current_pos.load(Ordering::Acquire) != pos {
                continue;
            }
            slot.push(task);
            break;
        }
        self.pending.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 等待触发的任务数
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 正在执行的回调数
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// 停止时间轮
    ///
    /// # 参数
    ///
    /// * `wait` - 是否等待已派发的回调执行完毕
    pub async fn stop(&self, wait: bool) {
        self.cancel.cancel();
        self.tracker.close();
        let handle = lock(&self.ticker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if wait {
            self.tracker.wait().await;
        }
        info!(wheel = %self.name, wait, "TimeWheel stopped");
    }

    fn on_tick(&self) {
        let slot_num = self.slots.len();
        let pos = (self.current_pos.load(Ordering::Acquire) + 1) % slot_num;
        self.current_pos.store(pos, Ordering::Release);

        let due = {
            let mut slot = lock(&self.slots[pos]);
            let tasks = std::mem::take(&mut *slot);
            let mut due = Vec::new();
            for mut task in tasks {
                if task.circle > 0 {
                    task.circle -= 1;
                    slot.push(task);
                } else {
                    due.push(task);
                }
            }
            due
        };

        if due.is_empty() {
            return;
        }
        self.pending.fetch_sub(due.len(), Ordering::Relaxed);
        for task in due {
            self.tracker.spawn((task.callback)(task.payload));
        }
    }
}
