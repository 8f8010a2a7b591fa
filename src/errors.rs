//! 上传错误类型定义
//!
//! 所有对外暴露的错误统一为 `UploadError`，
//! 内部按错误性质划分处理策略：
//! - 可重试错误：在重试预算内由操作内部吸收
//! - 会话级错误：触发会话重建，不上报调用方
//! - 静默错误：清理内部状态但不广播终态事件
//! - 致命错误：直接上报调用方

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UploadError {
    /// 网络错误（瞬时，可在重试预算内重试）
    #[error("网络错误: {0}")]
    Network(String),

    /// 本地错误（文件系统/持久化失败，可有限重试）
    #[error("本地错误: {0}")]
    Local(String),

    /// 任务被用户取消（不重试，不广播）
    #[error("任务已取消")]
    TaskCancelled,

    /// 任务因进程挂起被改派到后台传输（非失败，稍后恢复）
    #[error("任务已改派到后台传输")]
    TaskRescheduled,

    /// 会话已过期（触发会话重建，不上报调用方）
    #[error("上传会话已过期")]
    SessionExpired,

    /// 源文件在上传过程中被修改（触发会话重建）
    #[error("源文件身份已变化: {0}")]
    FileIdentityChanged(String),

    /// 远端在关闭会话时拒绝（哈希/大小不一致，致命，不自动重试）
    #[error("远端拒绝合并会话: {0}")]
    RemoteRejected(String),

    /// 会话令牌无效（认证问题，上报调用方，不静默重试）
    #[error("会话令牌无效: {0}")]
    UnknownToken(String),

    /// 重试预算耗尽
    #[error("重试次数已用尽")]
    RetryExhausted,

    /// 源文件不存在或不可读
    #[error("源文件不可读: {0}")]
    FileNotFound(String),

    /// 文件超出可分片上限
    #[error("文件过大: {size} 字节超出上限 {limit} 字节")]
    FileTooLarge { size: u64, limit: u64 },

    /// 会话记录缺失（持久化状态不完整）
    #[error("上传会话记录缺失")]
    SessionTaskMissing,

    /// 无法将远端分片回执匹配到本地分片
    #[error("无法匹配分片回执: 分片号 {0}")]
    UnableToMatchChunk(i64),
}

impl UploadError {
    /// 是否可在重试预算内自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network(_) | UploadError::Local(_))
    }

    /// 是否为静默错误（清理状态但不广播终态事件）
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            UploadError::TaskCancelled | UploadError::TaskRescheduled
        )
    }

    /// 是否需要丢弃当前会话并重建
    pub fn requires_session_restart(&self) -> bool {
        matches!(
            self,
            UploadError::SessionExpired
                | UploadError::FileIdentityChanged(_)
                | UploadError::UnknownToken(_)
        )
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => UploadError::FileNotFound(err.to_string()),
            _ => UploadError::Local(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Local(format!("序列化失败: {}", err))
    }
}

/// 上传结果
pub type UploadResult<T> = Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(UploadError::Network("timeout".to_string()).is_retryable());
        assert!(UploadError::Local("io".to_string()).is_retryable());

        assert!(!UploadError::TaskCancelled.is_retryable());
        assert!(!UploadError::RemoteRejected("hash".to_string()).is_retryable());
        assert!(!UploadError::RetryExhausted.is_retryable());
    }

    #[test]
    fn test_silent_classification() {
        assert!(UploadError::TaskCancelled.is_silent());
        assert!(UploadError::TaskRescheduled.is_silent());

        assert!(!UploadError::Network("x".to_string()).is_silent());
        assert!(!UploadError::RemoteRejected("x".to_string()).is_silent());
    }

    #[test]
    fn test_session_restart_classification() {
        assert!(UploadError::SessionExpired.requires_session_restart());
        assert!(UploadError::FileIdentityChanged("x".to_string()).requires_session_restart());
        assert!(UploadError::UnknownToken("x".to_string()).requires_session_restart());

        assert!(!UploadError::Network("x".to_string()).requires_session_restart());
        assert!(!UploadError::RemoteRejected("x".to_string()).requires_session_restart());
    }

    #[test]
    fn test_io_error_conversion() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(
            UploadError::from(not_found),
            UploadError::FileNotFound(_)
        ));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(UploadError::from(other), UploadError::Local(_)));
    }

    #[test]
    fn test_error_serialization_roundtrip() {
        let err = UploadError::FileTooLarge {
            size: 100,
            limit: 50,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: UploadError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
