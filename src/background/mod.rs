//! 进程挂起信号与后台传输改派
//!
//! 移动平台在挂起进程前会给出一段有限的收尾时间。
//! `ExpiringActivity` 把这个信号建模为带截止时间的取消令牌；
//! 收到信号的操作应尝试把在途分片请求移交给后台传输器，
//! 移交成功后记录后台任务标识，等待带外回调

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// 挂起前的收尾活动
///
/// 宿主在收到系统"即将挂起"通知时调用 `expire`，
/// 各操作通过 `expired_token` 的子令牌感知
#[derive(Debug, Clone)]
pub struct ExpiringActivity {
    /// 挂起信号令牌
    token: CancellationToken,
    /// 收尾截止时间（expire 时设置）
    deadline: std::sync::Arc<parking_lot::Mutex<Option<DateTime<Utc>>>>,
}

impl ExpiringActivity {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: std::sync::Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// 宿主触发挂起信号，给出收尾预算
    pub fn expire(&self, budget: Duration) {
        *self.deadline.lock() = Some(Utc::now() + budget);
        self.token.cancel();
    }

    /// 是否已触发挂起
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 收尾截止时间
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        *self.deadline.lock()
    }

    /// 订阅挂起信号（子令牌）
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for ExpiringActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// 待移交的在途分片请求描述
#[derive(Debug, Clone)]
pub struct InFlightChunkRequest {
    /// 上传文件 ID
    pub file_id: String,
    /// 会话令牌
    pub session_token: String,
    /// 分片号
    pub chunk_number: i64,
    /// 暂存分片文件路径
    pub chunk_path: PathBuf,
    /// 分片 SHA-256
    pub chunk_hash: String,
}

/// 后台传输器
///
/// 由宿主平台实现（如 iOS 的后台 URLSession）。
/// `adopt` 接收一个在途请求的描述，返回后台任务标识；
/// 返回 None 表示该平台无法移交，请求只能被取消
#[async_trait]
pub trait BackgroundTransport: Send + Sync {
    /// 尝试把分片请求移交到后台传输，返回可恢复的任务标识
    async fn adopt(&self, request: InFlightChunkRequest) -> Option<String>;
}

/// 不支持后台传输的空实现
pub struct NoBackgroundTransport;

#[async_trait]
impl BackgroundTransport for NoBackgroundTransport {
    async fn adopt(&self, _request: InFlightChunkRequest) -> Option<String> {
        None
    }
}
