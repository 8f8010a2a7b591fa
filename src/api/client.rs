// 远端对象存储 HTTP 客户端实现

use crate::api::types::{
    ApiError, ApiResponse, CancelledSession, ClosedSession, LiveSession, RemoteFile,
    StartSessionRequest, StartedSession, UploadedChunk,
};
use crate::api::{RemoteStore, TokenProvider};
use crate::errors::{UploadError, UploadResult};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 默认请求超时（秒）
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// 云盘 API 客户端
#[derive(Clone)]
pub struct DriveApiClient {
    /// HTTP 客户端
    client: Client,
    /// API 基础地址，如 https://api.drive.example.com/3
    base_url: String,
    /// 访问令牌提供者
    token_provider: Arc<dyn TokenProvider>,
}

impl DriveApiClient {
    /// 创建新的 API 客户端
    ///
    /// # 参数
    /// * `base_url` - API 基础地址
    /// * `token_provider` - 访问令牌提供者
    pub fn new(base_url: String, token_provider: Arc<dyn TokenProvider>) -> UploadResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| UploadError::Local(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("初始化云盘 API 客户端: base_url={}", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_provider,
        })
    }

    /// 会话接口地址
    fn session_url(&self, drive_id: u64, suffix: &str) -> String {
        format!("{}/drive/{}/upload/session{}", self.base_url, drive_id, suffix)
    }

    /// 解包响应信封，失败时按上下文归类错误
    ///
    /// `at_close` 为 true 时，非令牌类错误视为远端拒绝合并（致命）
    fn unwrap_response<T>(resp: ApiResponse<T>, at_close: bool) -> UploadResult<T> {
        if resp.is_success() {
            resp.data
                .ok_or_else(|| UploadError::Network("响应缺少 data 字段".to_string()))
        } else {
            let error = resp.error.unwrap_or(ApiError {
                code: "unknown".to_string(),
                description: String::new(),
            });
            Err(Self::classify_api_error(error, at_close))
        }
    }

    /// 远端错误码归类
    fn classify_api_error(error: ApiError, at_close: bool) -> UploadError {
        let detail = format!("{}: {}", error.code, error.description);
        if error.is_token_error() {
            UploadError::UnknownToken(detail)
        } else if at_close {
            // 关闭会话被拒绝意味着分片状态不可信，属于数据一致性错误
            UploadError::RemoteRejected(detail)
        } else {
            UploadError::Network(detail)
        }
    }
}

#[async_trait]
impl RemoteStore for DriveApiClient {
    async fn open_session(
        &self,
        drive_id: u64,
        request: StartSessionRequest,
    ) -> UploadResult<StartedSession> {
        let token = self.token_provider.access_token().await?;
        let url = self.session_url(drive_id, "/start");

        debug!(
            "开启上传会话: file_name={}, total_size={}, total_chunks={}",
            request.file_name, request.total_size, request.total_chunks
        );

        let resp: ApiResponse<StartedSession> = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        let session = Self::unwrap_response(resp, false)?;
        info!("上传会话已开启: token={}...", &session.token[..session.token.len().min(8)]);
        Ok(session)
    }

    async fn get_session(&self, drive_id: u64, token: &str) -> UploadResult<LiveSession> {
        let access_token = self.token_provider.access_token().await?;
        let url = self.session_url(drive_id, &format!("/{}", token));

        let resp: ApiResponse<LiveSession> = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?
            .json()
            .await?;

        Self::unwrap_response(resp, false)
    }

    async fn upload_chunk(
        &self,
        drive_id: u64,
        token: &str,
        chunk_number: i64,
        chunk_hash: &str,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> UploadResult<UploadedChunk> {
        let access_token = self.token_provider.access_token().await?;
        let chunk_size = data.len();
        let url = format!(
            "{}?chunk_number={}&chunk_size={}&chunk_hash=sha256:{}",
            self.session_url(drive_id, &format!("/{}/chunk", token)),
            chunk_number,
            chunk_size,
            chunk_hash
        );

        debug!(
            "上传分片: number={}, size={} bytes",
            chunk_number, chunk_size
        );

        let request = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .body(data)
            .send();

        // 请求与取消令牌竞争，取消时立即放弃请求
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("分片请求被取消: number={}", chunk_number);
                return Err(UploadError::TaskCancelled);
            }
            result = request => result?,
        };

        let resp: ApiResponse<UploadedChunk> = response.json().await?;
        Self::unwrap_response(resp, false)
    }

    async fn close_session(&self, drive_id: u64, token: &str) -> UploadResult<RemoteFile> {
        let access_token = self.token_provider.access_token().await?;
        let url = self.session_url(drive_id, &format!("/{}/finish", token));

        let resp: ApiResponse<ClosedSession> = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await?
            .json()
            .await?;

        let closed = Self::unwrap_response(resp, true)?;
        info!(
            "会话已关闭: remote_file_id={}, name={}",
            closed.file.id, closed.file.name
        );
        Ok(closed.file)
    }

    async fn cancel_session(&self, drive_id: u64, token: &str) -> UploadResult<bool> {
        let access_token = self.token_provider.access_token().await?;
        let url = self.session_url(drive_id, &format!("/{}", token));

        let resp: ApiResponse<CancelledSession> = self
            .client
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await?
            .json()
            .await?;

        let cancelled = Self::unwrap_response(resp, false)?;
        Ok(cancelled.cancelled)
    }
}
