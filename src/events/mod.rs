//! 上传事件发布
//!
//! 队列通过广播通道对外发布进度与终态事件，
//! 进度事件经节流器限频，避免事件风暴

use crate::api::RemoteFile;
use crate::errors::UploadError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件已入队
    Enqueued { file_id: String },
    /// 进度更新
    Progress {
        file_id: String,
        uploaded_bytes: u64,
        total_bytes: u64,
        /// 进度比例 [0, 1]
        fraction: f64,
    },
    /// 上传成功（携带远端文件描述）
    Completed {
        file_id: String,
        remote_file: RemoteFile,
    },
    /// 上传终态失败（已分类的错误）
    Failed {
        file_id: String,
        error: UploadError,
    },
    /// 目录/盘维度的待上传数量变化
    PendingCount {
        parent_directory_id: u64,
        drive_id: u64,
        count: usize,
    },
    /// 队列挂起状态变化
    SuspensionChanged { suspended: bool },
}

/// 事件总线
///
/// 包装 broadcast 通道；没有订阅者时发送失败被忽略
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    /// 发布事件
    pub fn publish(&self, event: UploadEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用原子操作避免锁竞争。
/// 典型用法：每次更新进度时调用 `should_emit()`，返回 true 时才发布事件
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间戳（纳秒，相对创建时刻）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
    /// 计时起点
    origin: Instant,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
            origin: Instant::now(),
        }
    }

    /// 使用默认间隔（200ms）创建节流器
    pub fn default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS))
    }

    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// 检查是否应该发布事件
    ///
    /// 距上次发布超过节流间隔时返回 true 并更新时间戳；
    /// 使用 CAS 保证并发下同一窗口只放行一次
    pub fn should_emit(&self) -> bool {
        // 保证首次调用一定放行
        let now_nanos = self.now_nanos() + self.interval_nanos;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if now_nanos.saturating_sub(last) >= self.interval_nanos {
            self.last_emit_nanos
                .compare_exchange_weak(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 强制发布（用于终态或最后一次进度）
    pub fn force_emit(&self) -> bool {
        let now_nanos = self.now_nanos() + self.interval_nanos;
        self.last_emit_nanos.store(now_nanos, Ordering::Relaxed);
        true
    }
}
