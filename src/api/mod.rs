// 远端对象存储接口模块
//
// 语义上只有三个核心调用：开启会话、上传分片、关闭会话；
// 另有取消会话（释放服务端资源）与查询会话（续传对账）两个辅助调用。
// 引擎只依赖 RemoteStore trait，具体 HTTP 实现与测试桩均可注入

pub mod client;
pub mod types;

pub use client::DriveApiClient;
pub use types::{
    ApiError, ApiResponse, CancelledSession, ClosedSession, ConflictPolicy, LiveSession,
    RemoteFile, StartSessionRequest, StartedSession, UploadedChunk,
};

use crate::errors::UploadResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// 远端对象存储
///
/// 所有调用都是可取消的异步请求；实现方负责把传输层错误
/// 归类为 `UploadError` 的对应变体
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 开启上传会话，返回会话令牌
    async fn open_session(
        &self,
        drive_id: u64,
        request: StartSessionRequest,
    ) -> UploadResult<StartedSession>;

    /// 查询会话实时状态（续传前对账用）
    async fn get_session(&self, drive_id: u64, token: &str) -> UploadResult<LiveSession>;

    /// 上传一个分片，返回远端回执
    async fn upload_chunk(
        &self,
        drive_id: u64,
        token: &str,
        chunk_number: i64,
        chunk_hash: &str,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> UploadResult<UploadedChunk>;

    /// 关闭会话，远端合并所有分片并返回文件描述
    async fn close_session(&self, drive_id: u64, token: &str) -> UploadResult<RemoteFile>;

    /// 取消会话，释放服务端资源（尽力而为）
    async fn cancel_session(&self, drive_id: u64, token: &str) -> UploadResult<bool>;
}

/// 访问令牌提供者
///
/// 认证流程不在本库范围内，由宿主注入
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 当前有效的访问令牌
    async fn access_token(&self) -> UploadResult<String>;
}

/// 固定令牌提供者（测试与简单场景用）
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> UploadResult<String> {
        Ok(self.token.clone())
    }
}
