//! 远端接口数据类型
//!
//! 会话接口的请求/响应结构。响应统一包裹在 `ApiResponse` 信封中，
//! `result == "success"` 时 `data` 有效，否则 `error` 携带错误码

use serde::{Deserialize, Serialize};

/// 远端接口响应信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// "success" 或 "error"
    pub result: String,
    /// 成功时的数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// 失败时的错误
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// 是否成功
    pub fn is_success(&self) -> bool {
        self.result == "success"
    }
}

/// 远端接口错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// 机器可读错误码
    pub code: String,
    /// 人类可读描述
    #[serde(default)]
    pub description: String,
}

/// 会话令牌无效类错误码
const TOKEN_ERROR_CODES: &[&str] = &[
    "upload_token_is_not_valid",
    "invalid_upload_token",
    "upload_token_canceled",
];

impl ApiError {
    /// 是否为令牌无效类错误
    pub fn is_token_error(&self) -> bool {
        TOKEN_ERROR_CODES.contains(&self.code.as_str())
    }
}

/// 冲突解决方式（与 UploadFile 的声明一致，随开启会话请求上送）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// 同名冲突时报错
    Error,
    /// 覆盖已有文件
    Replace,
    /// 自动改名
    Rename,
    /// 忽略本次上传
    Ignore,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Rename
    }
}

/// 开启会话请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// 文件名
    pub file_name: String,
    /// 文件总大小（字节）
    pub total_size: u64,
    /// 总分片数
    pub total_chunks: usize,
    /// 目标目录 ID
    pub directory_id: u64,
    /// 冲突解决方式
    pub conflict: ConflictPolicy,
    /// 源文件创建时间（Unix 秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// 源文件修改时间（Unix 秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<i64>,
}

/// 开启会话响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedSession {
    /// 会话令牌
    pub token: String,
}

/// 会话实时状态（用于续传前与远端对账）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSession {
    /// 会话令牌
    pub token: String,
    /// 远端预期分片总数
    pub expected_chunks: usize,
    /// 远端已成功接收分片数
    pub received_chunks: usize,
    /// 远端视角下仍在上传中的分片数
    pub uploading_chunks: usize,
    /// 远端记录的失败分片数
    pub failed_chunks: usize,
    /// 已接收分片明细
    #[serde(default)]
    pub chunks: Vec<UploadedChunk>,
}

/// 分片上传回执
///
/// 远端确认收到一个分片后返回；只有 status == "ok" 视为成功
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedChunk {
    /// 分片号（1 起始）
    pub number: i64,
    /// 状态，"ok" 为成功
    pub status: String,
    /// 远端记录的接收时间（Unix 秒）
    pub created_at: i64,
    /// 远端记录的分片大小
    pub size: u64,
    /// 远端计算的分片 SHA-256
    #[serde(default)]
    pub hash: Option<String>,
}

impl UploadedChunk {
    /// 回执是否为有效成功
    pub fn is_valid_upload(&self) -> bool {
        self.status == "ok"
    }
}

/// 远端文件描述（关闭会话成功后返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    /// 远端文件 ID
    pub id: u64,
    /// 文件名（冲突改名后可能与请求不同）
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 所在目录 ID
    pub parent_id: u64,
    /// 远端记录的创建时间（Unix 秒）
    pub created_at: i64,
}

/// 关闭会话响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedSession {
    /// 合并生成的远端文件
    pub file: RemoteFile,
}

/// 取消会话响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledSession {
    /// 远端是否确认取消
    pub cancelled: bool,
}
