// 上传操作状态机
//
// 驱动单个文件从入队到终态的全过程：
//
//   queued -> opening-session -> slicing -> uploading-chunks -> finalizing
//          -> { completed | failed | cancelled }
//
// 会话获取阶段可能回到自身：已持久化的会话若已过期或源文件身份
// 指纹不匹配，则连同分片一起废弃并重建（向失效会话提交字节不安全）。
// 分片级瞬时错误在文件重试预算内由操作自行吸收重试；
// 预算耗尽后把错误附着到文件并作为终态失败上报。
// 进程即将挂起时，在途分片请求尝试移交后台传输器，
// 移交成功的分片持久化后台任务标识，恢复时跳过重新提交

use crate::api::{RemoteFile, RemoteStore, StartSessionRequest, UploadedChunk};
use crate::background::{BackgroundTransport, InFlightChunkRequest};
use crate::config::UploadConfig;
use crate::errors::{UploadError, UploadResult};
use crate::events::{EventBus, ProgressThrottler, UploadEvent};
use crate::fsx::{self, ChunkStaging, FileSource, SourceResolver};
use crate::store::{UploadRecord, UploadStore};
use crate::uploader::parallelism::ParallelismController;
use crate::uploader::queue::SuspensionGate;
use crate::uploader::range::build_ranges;
use crate::uploader::session::{FileIdentity, SessionTask};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =====================================================
// 重试退避
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - attempt=0: 100ms
/// - attempt=1: 200ms
/// - attempt=2: 400ms
/// - 最大: 5000ms
fn calculate_backoff_delay(attempt: u32) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    base_delay.min(MAX_BACKOFF_MS)
}

// =====================================================
// 共享协作者
// =====================================================

/// 上传操作共享的协作者集合
///
/// 队列创建后注入每个操作；全部以 trait 对象持有，测试可整体替换
pub struct UploadContext {
    /// 持久化存储
    pub store: Arc<dyn UploadStore>,
    /// 远端对象存储
    pub remote: Arc<dyn RemoteStore>,
    /// 平台资产解析器（不处理资产来源时可为 None）
    pub resolver: Option<Arc<dyn SourceResolver>>,
    /// 后台传输器
    pub background: Arc<dyn BackgroundTransport>,
    /// 分片暂存器
    pub staging: ChunkStaging,
    /// 事件总线
    pub events: Arc<EventBus>,
    /// 并行度控制器
    pub parallelism: Arc<ParallelismController>,
    /// 挂起闸门（队列拨动，挂起时不发起新分片请求）
    pub gate: Arc<SuspensionGate>,
    /// 上传配置
    pub config: UploadConfig,
}

// =====================================================
// 状态与结果
// =====================================================

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// 等待执行
    Queued,
    /// 获取/校验会话
    OpeningSession,
    /// 切片
    Slicing,
    /// 分片上传中
    UploadingChunks,
    /// 关闭会话中
    Finalizing,
    /// 成功
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl OperationState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// 操作终态结果
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// 上传成功，携带远端文件描述
    Completed(RemoteFile),
    /// 终态失败
    Failed(UploadError),
    /// 用户取消
    Cancelled,
    /// 已移交后台传输，稍后恢复
    Rescheduled,
}

/// 分片扇出阶段的退出方式
enum FanOutExit {
    /// 所有可调度分片都已得到终态
    Drained,
    /// 进程挂起，在途请求已处理
    Suspended,
}

// =====================================================
// 上传操作
// =====================================================

/// 上传操作
pub struct UploadOperation {
    /// 上传文件 ID
    file_id: String,
    /// 共享协作者
    ctx: Arc<UploadContext>,
    /// 取消令牌（用户取消）
    cancel_token: CancellationToken,
    /// 挂起令牌（进程即将挂起）
    suspend_token: CancellationToken,
    /// 当前状态
    state: SyncMutex<OperationState>,
    /// 进度事件节流器（与分片 worker 共享）
    progress_throttler: Arc<ProgressThrottler>,
}

impl std::fmt::Debug for UploadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOperation")
            .field("file_id", &self.file_id)
            .field("state", &self.state())
            .finish()
    }
}

impl UploadOperation {
    /// 创建新操作
    ///
    /// # 参数
    /// * `file_id` - 上传文件 ID
    /// * `ctx` - 共享协作者
    /// * `suspend_token` - 挂起信号令牌（ExpiringActivity 子令牌）
    pub fn new(file_id: String, ctx: Arc<UploadContext>, suspend_token: CancellationToken) -> Self {
        Self {
            file_id,
            ctx,
            cancel_token: CancellationToken::new(),
            suspend_token,
            state: SyncMutex::new(OperationState::Queued),
            progress_throttler: Arc::new(ProgressThrottler::default_interval()),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// 当前状态
    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// 是否已到终态
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// 请求取消：撤销所有在途分片请求，操作随后进入 cancelled
    pub fn cancel(&self) {
        info!("请求取消上传操作: file_id={}", self.file_id);
        self.cancel_token.cancel();
    }

    fn set_state(&self, next: OperationState) {
        let mut state = self.state.lock();
        debug!(
            "操作状态迁移: file_id={}, {:?} -> {:?}",
            self.file_id, *state, next
        );
        *state = next;
    }

    /// 执行操作直到终态
    pub async fn run(&self) -> OperationOutcome {
        match self.execute().await {
            Ok(remote_file) => {
                self.set_state(OperationState::Completed);
                info!(
                    "上传完成: file_id={}, remote_file_id={}",
                    self.file_id, remote_file.id
                );
                OperationOutcome::Completed(remote_file)
            }
            Err(UploadError::TaskCancelled) => {
                self.cleanup_after_cancel().await;
                self.set_state(OperationState::Cancelled);
                info!("上传已取消: file_id={}", self.file_id);
                OperationOutcome::Cancelled
            }
            Err(UploadError::TaskRescheduled) => {
                // 会话与分片记录保持原样，恢复时继续
                self.persist_error(UploadError::TaskRescheduled).await;
                self.set_state(OperationState::Failed);
                info!("上传已改派后台: file_id={}", self.file_id);
                OperationOutcome::Rescheduled
            }
            Err(e) => {
                self.persist_error(e.clone()).await;
                self.set_state(OperationState::Failed);
                error!("上传失败: file_id={}, 错误: {}", self.file_id, e);
                OperationOutcome::Failed(e)
            }
        }
    }

    /// 主执行流程
    async fn execute(&self) -> UploadResult<RemoteFile> {
        // 启动前已被取消则直接快速失败
        self.check_cancellation()?;

        let record = self
            .ctx
            .store
            .load(&self.file_id)
            .await?
            .ok_or_else(|| UploadError::Local(format!("上传记录缺失: {}", self.file_id)))?;

        // 解析来源为可读的本地路径
        let source_path = self.resolve_source(&record).await?;

        let record = Arc::new(Mutex::new(record));

        // 把源文件时间写回记录（开启会话时上送）
        {
            let times = fsx::file_times(&source_path)?;
            let mut rec = record.lock().await;
            rec.file.creation_date = Some(times.created_secs);
            rec.file.modification_date = Some(times.modified_secs);
        }

        let mut attempt: u32 = 0;
        loop {
            self.check_cancellation()?;
            self.set_state(OperationState::OpeningSession);

            // 预算检查与扣减：每轮会话获取消耗一次预算
            {
                let mut rec = record.lock().await;
                if !rec.file.can_retry() {
                    return Err(UploadError::RetryExhausted);
                }
                rec.file.consume_retry();
                debug!(
                    "重试预算剩余: file_id={}, 剩余={}",
                    self.file_id, rec.file.max_retry_count
                );
                self.ctx.store.save(&rec).await?;
            }

            // 获取可用会话（复用或新建）
            if let Err(e) = self.acquire_session(&record, &source_path).await {
                if e.requires_session_restart() {
                    // 会话级错误通过状态迁移消化，不上报调用方
                    warn!(
                        "会话不可用，废弃重建: file_id={}, 原因: {}",
                        self.file_id, e
                    );
                    self.discard_session(&record).await?;
                    continue;
                }
                return Err(e);
            }

            // 分片扇出
            self.set_state(OperationState::UploadingChunks);
            match self.fan_out_chunks(&record).await {
                Ok(FanOutExit::Suspended) => return Err(UploadError::TaskRescheduled),
                Ok(FanOutExit::Drained) => {}
                Err(e) if e.requires_session_restart() => {
                    warn!(
                        "分片阶段发现会话失效: file_id={}, 原因: {}",
                        self.file_id, e
                    );
                    self.discard_session(&record).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            // 收尾判定
            let (all_success, chunk_error) = {
                let rec = record.lock().await;
                let session = rec.session.as_ref().ok_or(UploadError::SessionTaskMissing)?;
                let first_error = session
                    .chunk_tasks
                    .iter()
                    .find_map(|c| c.error.clone());
                (session.all_chunks_success(), first_error)
            };

            if all_success {
                match self.finalize(&record).await {
                    Ok(remote_file) => return Ok(remote_file),
                    Err(e) if e.is_retryable() => {
                        // 关闭会话时的瞬时网络错误在预算内重试
                        let can_retry = { record.lock().await.file.can_retry() };
                        if !can_retry {
                            return Err(e);
                        }
                        warn!(
                            "关闭会话失败，准备重试: file_id={}, 错误: {}",
                            self.file_id, e
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else if let Some(chunk_error) = chunk_error {
                let can_retry = { record.lock().await.file.can_retry() };
                if !can_retry {
                    // 预算耗尽，分片错误成为文件终态错误
                    return Err(chunk_error);
                }
                warn!(
                    "存在失败分片，预算内重试: file_id={}, 错误: {}",
                    self.file_id, chunk_error
                );
            } else {
                // 没有成功也没有错误：分片仍被后台传输占用，等待带外回调
                return Err(UploadError::TaskRescheduled);
            }

            let backoff_ms = calculate_backoff_delay(attempt);
            attempt += 1;
            debug!(
                "退避等待 {}ms 后重试: file_id={}",
                backoff_ms, self.file_id
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    /// 操作被取消则报错
    fn check_cancellation(&self) -> UploadResult<()> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::TaskCancelled);
        }
        Ok(())
    }

    /// 解析来源为本地路径
    async fn resolve_source(&self, record: &UploadRecord) -> UploadResult<PathBuf> {
        match &record.file.source {
            FileSource::LocalFile(path) => Ok(path.clone()),
            FileSource::PlatformAsset(asset_id) => {
                let resolver = self
                    .ctx
                    .resolver
                    .as_ref()
                    .ok_or_else(|| UploadError::Local("缺少平台资产解析器".to_string()))?;
                let path = resolver.resolve(asset_id).await?;
                debug!(
                    "资产已解析: asset_id={}, path={:?}",
                    asset_id, path
                );
                Ok(path)
            }
        }
    }

    /// 获取可用会话：已有会话通过校验则复用，否则新建
    ///
    /// 新会话的全部分片任务在任何网络传输发生前整体落盘，
    /// 此后任意时刻崩溃都能从持久化状态恢复
    async fn acquire_session(
        &self,
        record: &Arc<Mutex<UploadRecord>>,
        source_path: &PathBuf,
    ) -> UploadResult<()> {
        let mut rec = record.lock().await;

        if let Some(session) = rec.session.as_ref() {
            if session.is_expired() {
                return Err(UploadError::SessionExpired);
            }
            if !session.file_identity_has_not_changed() {
                return Err(UploadError::FileIdentityChanged(
                    session.file_identity.as_str().to_string(),
                ));
            }

            // 与远端对账：崩溃可能吞掉成功回调，远端已确认而本地
            // 缺少回执的分片在这里补记，避免重复上传
            let drive_id = rec.file.drive_id;
            let token = session.token.clone();
            match self.ctx.remote.get_session(drive_id, &token).await {
                Ok(live) => {
                    let session = rec.session.as_mut().unwrap();
                    for receipt in live.chunks.into_iter().filter(|c| c.is_valid_upload()) {
                        let number = receipt.number;
                        if let Some(chunk) = session.chunk_by_number_mut(number) {
                            if !chunk.done_uploading_success() {
                                debug!(
                                    "远端已确认分片，本地补记: file_id={}, number={}",
                                    self.file_id, number
                                );
                                chunk.error = None;
                                chunk.task_identifier = None;
                                chunk.chunk = Some(receipt);
                            }
                        }
                    }
                }
                // 远端不认识该令牌：会话必须废弃重建
                Err(e @ UploadError::UnknownToken(_)) => return Err(e),
                // 对账失败不阻断，按本地状态继续
                Err(e) => {
                    debug!(
                        "会话对账失败（按本地状态继续）: file_id={}, 错误: {}",
                        self.file_id, e
                    );
                }
            }

            // 会话可复用：清理未完成分片的在途状态，保留已成功与后台分片
            let session = rec.session.as_mut().unwrap();
            session.clean_chunks_for_reuse();
            self.ctx.store.save(&rec).await?;
            info!(
                "复用已持久化会话: file_id={}, 待传分片={}",
                self.file_id,
                rec.session.as_ref().map(|s| s.chunks_to_upload_count()).unwrap_or(0)
            );
            return Ok(());
        }

        // 新建会话：切片 -> 远端开启会话 -> 整体落盘
        self.set_state(OperationState::Slicing);

        if !fsx::is_readable_file(source_path) {
            return Err(UploadError::FileNotFound(format!("{:?}", source_path)));
        }
        let file_size = fsx::file_size(source_path)?;
        let ranges = build_ranges(file_size)?;
        let identity = FileIdentity::of_path(source_path)?;
        info!(
            "文件切片完成: file_id={}, size={} bytes, 分片数={}",
            self.file_id,
            file_size,
            ranges.len()
        );

        let request = StartSessionRequest {
            file_name: rec.file.name.clone(),
            total_size: file_size,
            total_chunks: ranges.len(),
            directory_id: rec.file.parent_directory_id,
            conflict: rec.file.conflict,
            created_at: rec.file.creation_date,
            last_modified_at: rec.file.modification_date,
        };
        let drive_id = rec.file.drive_id;

        self.check_cancellation()?;
        let started = self.ctx.remote.open_session(drive_id, request).await?;

        rec.session = Some(SessionTask::new(
            started.token,
            source_path.clone(),
            identity,
            &ranges,
        ));
        self.ctx.store.save(&rec).await?;
        info!("新会话已持久化: file_id={}", self.file_id);

        Ok(())
    }

    /// 废弃当前会话：清理暂存分片、通知远端释放、清空本地会话记录
    async fn discard_session(&self, record: &Arc<Mutex<UploadRecord>>) -> UploadResult<()> {
        let mut rec = record.lock().await;
        if let Some(session) = rec.session.take() {
            self.ctx
                .staging
                .remove_session(&self.file_id, &session.token)
                .await;

            // 尽力而为地释放服务端会话，失败不影响流程
            let drive_id = rec.file.drive_id;
            if let Err(e) = self
                .ctx
                .remote
                .cancel_session(drive_id, &session.token)
                .await
            {
                debug!(
                    "释放远端会话失败（忽略）: file_id={}, 错误: {}",
                    self.file_id, e
                );
            }
        }
        self.ctx.store.save(&rec).await?;
        Ok(())
    }

    /// 分片扇出：暂存 + 并发上传所有可调度分片
    async fn fan_out_chunks(&self, record: &Arc<Mutex<UploadRecord>>) -> UploadResult<FanOutExit> {
        // 挂起/取消时撤销在途分片请求用的独立令牌
        let chunks_cancel = CancellationToken::new();
        let mut join_set: JoinSet<()> = JoinSet::new();

        let result = self
            .drive_fan_out(record, &chunks_cancel, &mut join_set)
            .await;

        match result {
            Ok(FanOutExit::Drained) => {
                // 发布一次最终进度
                self.publish_progress(record, true).await;
                debug!("分片扇出结束: file_id={}", self.file_id);
                Ok(FanOutExit::Drained)
            }
            // 挂起路径在移交处理中已排空 worker
            Ok(FanOutExit::Suspended) => Ok(FanOutExit::Suspended),
            Err(e) => {
                // 任何错误退出前必须排空在途 worker，
                // 避免残留请求把旧会话的结果写进重建后的会话
                chunks_cancel.cancel();
                while join_set.join_next().await.is_some() {}
                Err(e)
            }
        }
    }

    /// 扇出主循环
    async fn drive_fan_out(
        &self,
        record: &Arc<Mutex<UploadRecord>>,
        chunks_cancel: &CancellationToken,
        join_set: &mut JoinSet<()>,
    ) -> UploadResult<FanOutExit> {
        let chunk_limit = self
            .ctx
            .parallelism
            .chunk_limit(self.ctx.config.chunk_parallelism);
        let semaphore = Arc::new(Semaphore::new(chunk_limit));

        debug!(
            "分片扇出开始: file_id={}, 并发上限={}",
            self.file_id, chunk_limit
        );

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(UploadError::TaskCancelled);
            }
            if self.suspend_token.is_cancelled() {
                self.hand_off_in_flight(record, chunks_cancel, join_set).await?;
                return Ok(FanOutExit::Suspended);
            }

            // 队列挂起期间不发起新的分片请求
            if self.ctx.gate.is_suspended() {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => {}
                    _ = self.suspend_token.cancelled() => {}
                    _ = self.ctx.gate.wait_until_resumed() => {}
                }
                continue;
            }

            // 下一个待调度分片（优先已就绪，其次需要暂存）
            let next = {
                let rec = record.lock().await;
                let session = rec.session.as_ref().ok_or(UploadError::SessionTaskMissing)?;
                session
                    .chunk_tasks
                    .iter()
                    .find(|c| c.can_start_uploading() || c.needs_staging())
                    .map(|c| c.chunk_number)
            };

            let Some(chunk_number) = next else {
                break;
            };

            // 暂存分片字节（若尚未就绪）
            self.stage_chunk_if_needed(record, chunk_number).await?;

            // 占一个并发槽位，同时保持对取消/挂起的响应
            let permit = tokio::select! {
                _ = self.cancel_token.cancelled() => continue,
                _ = self.suspend_token.cancelled() => continue,
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| UploadError::Local("并发信号量已关闭".to_string()))?
                }
            };

            // 标记调度中并落盘，之后才发起网络请求
            let (token, chunk_path, chunk_hash, drive_id) = {
                let mut rec = record.lock().await;
                let drive_id = rec.file.drive_id;
                let session = rec.session.as_mut().ok_or(UploadError::SessionTaskMissing)?;
                let token = session.token.clone();
                let chunk = session
                    .chunk_by_number_mut(chunk_number)
                    .ok_or(UploadError::UnableToMatchChunk(chunk_number))?;

                if !chunk.can_start_uploading() {
                    // 其他分支已处理过该分片
                    continue;
                }
                chunk.task_identifier = Some(Uuid::new_v4().to_string());
                let chunk_path = chunk.path.clone().unwrap_or_default();
                let chunk_hash = chunk.sha256.clone().unwrap_or_default();
                self.ctx.store.save(&rec).await?;
                (token, chunk_path, chunk_hash, drive_id)
            };

            let worker = ChunkWorker {
                file_id: self.file_id.clone(),
                chunk_number,
                drive_id,
                token,
                chunk_path,
                chunk_hash,
                ctx: self.ctx.clone(),
                record: record.clone(),
                cancel: chunks_cancel.child_token(),
                throttler: self.progress_throttler.clone(),
            };

            join_set.spawn(async move {
                worker.run().await;
                drop(permit);
            });
        }

        // 等待在途请求收尾，同时保持对取消/挂起的响应
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    return Err(UploadError::TaskCancelled);
                }
                _ = self.suspend_token.cancelled() => {
                    self.hand_off_in_flight(record, chunks_cancel, join_set).await?;
                    return Ok(FanOutExit::Suspended);
                }
                joined = join_set.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        Ok(FanOutExit::Drained)
    }

    /// 必要时暂存分片字节并计算哈希
    ///
    /// 暂存前校验源文件身份，指纹不匹配立即中止，
    /// 绝不把已变化文件的字节提交给旧会话
    async fn stage_chunk_if_needed(
        &self,
        record: &Arc<Mutex<UploadRecord>>,
        chunk_number: i64,
    ) -> UploadResult<()> {
        // 读出暂存所需信息
        let (needs_staging, token, file_path, range) = {
            let rec = record.lock().await;
            let session = rec.session.as_ref().ok_or(UploadError::SessionTaskMissing)?;

            if !session.file_identity_has_not_changed() {
                return Err(UploadError::FileIdentityChanged(
                    session.file_identity.as_str().to_string(),
                ));
            }
            if session.is_expired() {
                return Err(UploadError::SessionExpired);
            }

            let chunk = session
                .chunk_tasks
                .iter()
                .find(|c| c.chunk_number == chunk_number)
                .ok_or(UploadError::UnableToMatchChunk(chunk_number))?;
            (
                chunk.needs_staging(),
                session.token.clone(),
                session.file_path.clone(),
                chunk.range,
            )
        };

        if !needs_staging {
            return Ok(());
        }

        let data = fsx::read_range(&file_path, range.lower, range.upper).await?;
        let (path, hash) = self
            .ctx
            .staging
            .stage_chunk(&self.file_id, &token, chunk_number, &data)
            .await?;

        let mut rec = record.lock().await;
        let session = rec.session.as_mut().ok_or(UploadError::SessionTaskMissing)?;
        if let Some(chunk) = session.chunk_by_number_mut(chunk_number) {
            chunk.path = Some(path);
            chunk.sha256 = Some(hash);
        }
        self.ctx.store.save(&rec).await?;
        Ok(())
    }

    /// 进程挂起：把在途分片请求移交后台传输器
    ///
    /// 移交成功的分片记录后台任务标识（持久化），恢复时跳过重新提交；
    /// 移交失败的分片清空在途标识，恢复时正常重传
    async fn hand_off_in_flight(
        &self,
        record: &Arc<Mutex<UploadRecord>>,
        chunks_cancel: &CancellationToken,
        join_set: &mut JoinSet<()>,
    ) -> UploadResult<()> {
        info!("进程即将挂起，处理在途分片: file_id={}", self.file_id);

        // 收集在途分片请求描述
        let in_flight: Vec<InFlightChunkRequest> = {
            let rec = record.lock().await;
            let session = rec.session.as_ref().ok_or(UploadError::SessionTaskMissing)?;
            session
                .chunk_tasks
                .iter()
                .filter(|c| c.task_identifier.is_some())
                .map(|c| InFlightChunkRequest {
                    file_id: self.file_id.clone(),
                    session_token: session.token.clone(),
                    chunk_number: c.chunk_number,
                    chunk_path: c.path.clone().unwrap_or_default(),
                    chunk_hash: c.sha256.clone().unwrap_or_default(),
                })
                .collect()
        };

        // 并发尝试移交（挂起前的收尾时间有限）
        let adopted: Vec<(i64, Option<String>)> =
            futures::future::join_all(in_flight.into_iter().map(|request| {
                let background = self.ctx.background.clone();
                async move {
                    let chunk_number = request.chunk_number;
                    (chunk_number, background.adopt(request).await)
                }
            }))
            .await;

        for (chunk_number, background_id) in &adopted {
            match background_id {
                Some(background_id) => info!(
                    "分片已移交后台: file_id={}, number={}, background_id={}",
                    self.file_id, chunk_number, background_id
                ),
                None => warn!(
                    "分片移交失败，恢复后将重传: file_id={}, number={}",
                    self.file_id, chunk_number
                ),
            }
        }

        // 撤销进程内请求并等待 worker 退出
        chunks_cancel.cancel();
        while join_set.join_next().await.is_some() {}

        // 持久化移交结果
        let mut rec = record.lock().await;
        if let Some(session) = rec.session.as_mut() {
            for (chunk_number, background_id) in adopted {
                if let Some(chunk) = session.chunk_by_number_mut(chunk_number) {
                    chunk.task_identifier = None;
                    chunk.background_task_id = background_id;
                }
            }
        }
        self.ctx.store.save(&rec).await?;

        Ok(())
    }

    /// 关闭会话并清理本地痕迹
    async fn finalize(&self, record: &Arc<Mutex<UploadRecord>>) -> UploadResult<RemoteFile> {
        self.check_cancellation()?;
        self.set_state(OperationState::Finalizing);

        let (drive_id, token) = {
            let rec = record.lock().await;
            let session = rec.session.as_ref().ok_or(UploadError::SessionTaskMissing)?;
            (rec.file.drive_id, session.token.clone())
        };

        info!("所有分片成功，关闭会话: file_id={}", self.file_id);
        match self.ctx.remote.close_session(drive_id, &token).await {
            Ok(remote_file) => {
                let mut rec = record.lock().await;
                self.ctx.staging.remove_session(&self.file_id, &token).await;
                rec.session = None;
                rec.file.mark_uploaded(remote_file.id);
                self.ctx.store.save(&rec).await?;
                Ok(remote_file)
            }
            Err(e @ (UploadError::RemoteRejected(_) | UploadError::UnknownToken(_))) => {
                // 远端拒绝说明分片回执不可信，本地会话一并废弃，
                // 手动重试时从头再来
                error!(
                    "远端拒绝关闭会话: file_id={}, 错误: {}",
                    self.file_id, e
                );
                let mut rec = record.lock().await;
                self.ctx.staging.remove_session(&self.file_id, &token).await;
                rec.session = None;
                self.ctx.store.save(&rec).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 取消后的清理：通知远端释放会话并清空本地会话记录
    async fn cleanup_after_cancel(&self) {
        let Ok(Some(mut record)) = self.ctx.store.load(&self.file_id).await else {
            return;
        };

        if let Some(session) = record.session.take() {
            self.ctx
                .staging
                .remove_session(&self.file_id, &session.token)
                .await;

            // 尽力而为的远端释放，结果不影响取消
            if let Err(e) = self
                .ctx
                .remote
                .cancel_session(record.file.drive_id, &session.token)
                .await
            {
                debug!(
                    "取消时释放远端会话失败（忽略）: file_id={}, 错误: {}",
                    self.file_id, e
                );
            }
        }

        record.file.error = Some(UploadError::TaskCancelled);
        let _ = self.ctx.store.save(&record).await;
    }

    /// 把终态错误写回记录
    async fn persist_error(&self, error: UploadError) {
        if let Ok(Some(mut record)) = self.ctx.store.load(&self.file_id).await {
            record.file.error = Some(error);
            let _ = self.ctx.store.save(&record).await;
        }
    }

    /// 发布进度事件（节流）
    async fn publish_progress(&self, record: &Arc<Mutex<UploadRecord>>, force: bool) {
        let (uploaded, total) = {
            let rec = record.lock().await;
            match rec.session.as_ref() {
                Some(session) => (session.uploaded_bytes(), session.total_bytes()),
                None => return,
            }
        };

        let should_emit = if force {
            self.progress_throttler.force_emit()
        } else {
            self.progress_throttler.should_emit()
        };
        if !should_emit {
            return;
        }

        let fraction = if total > 0 {
            uploaded as f64 / total as f64
        } else {
            0.0
        };
        self.ctx.events.publish(UploadEvent::Progress {
            file_id: self.file_id.clone(),
            uploaded_bytes: uploaded,
            total_bytes: total,
            fraction,
        });
    }
}

// =====================================================
// 分片上传 worker
// =====================================================

/// 单个分片的上传执行体
struct ChunkWorker {
    file_id: String,
    chunk_number: i64,
    drive_id: u64,
    token: String,
    chunk_path: PathBuf,
    chunk_hash: String,
    ctx: Arc<UploadContext>,
    record: Arc<Mutex<UploadRecord>>,
    cancel: CancellationToken,
    throttler: Arc<ProgressThrottler>,
}

impl ChunkWorker {
    async fn run(self) {
        let result = self.upload().await;

        // 把结果写回分片任务并落盘
        let mut rec = self.record.lock().await;
        let Some(session) = rec.session.as_mut() else {
            return;
        };
        let Some(chunk) = session.chunk_by_number_mut(self.chunk_number) else {
            return;
        };
        chunk.task_identifier = None;

        match result {
            Ok(receipt) => {
                debug!(
                    "分片上传成功: file_id={}, number={}",
                    self.file_id, self.chunk_number
                );
                chunk.chunk = Some(receipt);
                chunk.error = None;
                // 暂存文件用完即清
                if let Some(path) = chunk.path.clone() {
                    self.ctx.staging.remove_chunk(&path).await;
                }
            }
            Err(UploadError::TaskCancelled) => {
                // 取消/挂起由操作主体统一处理，这里只归还调度状态
                debug!(
                    "分片请求被撤销: file_id={}, number={}",
                    self.file_id, self.chunk_number
                );
            }
            Err(e) => {
                warn!(
                    "分片上传失败: file_id={}, number={}, 错误: {}",
                    self.file_id, self.chunk_number, e
                );
                chunk.error = Some(e);
            }
        }

        if let Err(e) = self.ctx.store.save(&rec).await {
            error!(
                "分片状态落盘失败: file_id={}, number={}, 错误: {}",
                self.file_id, self.chunk_number, e
            );
        }

        // 节流的进度事件
        let uploaded = rec.session.as_ref().map(|s| s.uploaded_bytes()).unwrap_or(0);
        let total = rec.session.as_ref().map(|s| s.total_bytes()).unwrap_or(0);
        drop(rec);
        if total > 0 && self.throttler.should_emit() {
            self.ctx.events.publish(UploadEvent::Progress {
                file_id: self.file_id.clone(),
                uploaded_bytes: uploaded,
                total_bytes: total,
                fraction: uploaded as f64 / total as f64,
            });
        }
    }

    /// 读取暂存分片并发起上传请求
    async fn upload(&self) -> UploadResult<UploadedChunk> {
        let data = tokio::fs::read(&self.chunk_path).await?;

        let receipt = self
            .ctx
            .remote
            .upload_chunk(
                self.drive_id,
                &self.token,
                self.chunk_number,
                &self.chunk_hash,
                data,
                self.cancel.clone(),
            )
            .await?;

        // 回执必须能匹配到本分片且状态有效
        if receipt.number != self.chunk_number {
            return Err(UploadError::UnableToMatchChunk(receipt.number));
        }
        if !receipt.is_valid_upload() {
            return Err(UploadError::Network(format!(
                "分片回执状态异常: {}",
                receipt.status
            )));
        }

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LiveSession, StartedSession};
    use crate::background::NoBackgroundTransport;
    use crate::store::{MemoryStore, UploadStore};
    use crate::uploader::file::UploadFile;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_calculate_backoff_delay() {
        assert_eq!(calculate_backoff_delay(0), 100);
        assert_eq!(calculate_backoff_delay(1), 200);
        assert_eq!(calculate_backoff_delay(2), 400);
        assert_eq!(calculate_backoff_delay(10), 5000);
    }

    /// 可编排行为的远端桩
    #[derive(Default)]
    struct MockRemote {
        /// 每个分片号剩余的失败次数
        chunk_failures: SyncMutex<HashMap<i64, u32>>,
        /// 关闭会话时拒绝
        reject_close: AtomicBool,
        /// 调用计数
        open_calls: AtomicUsize,
        close_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        /// 每个分片号累计收到的上传请求次数
        chunk_attempts: SyncMutex<HashMap<i64, u32>>,
        /// 当前会话收到的成功分片
        received: SyncMutex<Vec<i64>>,
        /// get_session 返回的远端分片明细（对账用）
        live_chunks: SyncMutex<Vec<UploadedChunk>>,
        /// 会话令牌流水号
        token_seq: AtomicUsize,
    }

    impl MockRemote {
        fn attempts(&self, number: i64) -> u32 {
            *self.chunk_attempts.lock().get(&number).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn open_session(
            &self,
            _drive_id: u64,
            _request: StartSessionRequest,
        ) -> UploadResult<StartedSession> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            // 新会话清空已接收分片
            self.received.lock().clear();
            let seq = self.token_seq.fetch_add(1, Ordering::SeqCst);
            Ok(StartedSession {
                token: format!("mock-token-{}", seq),
            })
        }

        async fn get_session(&self, _drive_id: u64, token: &str) -> UploadResult<LiveSession> {
            let chunks = self.live_chunks.lock().clone();
            Ok(LiveSession {
                token: token.to_string(),
                expected_chunks: 0,
                received_chunks: self.received.lock().len(),
                uploading_chunks: 0,
                failed_chunks: 0,
                chunks,
            })
        }

        async fn upload_chunk(
            &self,
            _drive_id: u64,
            _token: &str,
            chunk_number: i64,
            _chunk_hash: &str,
            data: Vec<u8>,
            _cancel: CancellationToken,
        ) -> UploadResult<UploadedChunk> {
            *self.chunk_attempts.lock().entry(chunk_number).or_insert(0) += 1;

            let should_fail = {
                let mut failures = self.chunk_failures.lock();
                match failures.get_mut(&chunk_number) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(UploadError::Network("连接被重置".to_string()));
            }

            self.received.lock().push(chunk_number);
            Ok(UploadedChunk {
                number: chunk_number,
                status: "ok".to_string(),
                created_at: 0,
                size: data.len() as u64,
                hash: None,
            })
        }

        async fn close_session(&self, _drive_id: u64, _token: &str) -> UploadResult<RemoteFile> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_close.load(Ordering::SeqCst) {
                return Err(UploadError::RemoteRejected(
                    "分片哈希不一致".to_string(),
                ));
            }
            Ok(RemoteFile {
                id: 9001,
                name: "uploaded.bin".to_string(),
                size: 0,
                parent_id: 1,
                created_at: 0,
            })
        }

        async fn cancel_session(&self, _drive_id: u64, _token: &str) -> UploadResult<bool> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// 测试环境：源文件 + 内存存储 + 远端桩
    struct TestEnv {
        _work_dir: tempfile::TempDir,
        source_path: PathBuf,
        store: Arc<MemoryStore>,
        remote: Arc<MockRemote>,
        ctx: Arc<UploadContext>,
        events: Arc<EventBus>,
    }

    async fn build_env(source_size: u64) -> TestEnv {
        let work_dir = tempfile::tempdir().unwrap();
        let source_path = work_dir.path().join("source.bin");
        let mut f = std::fs::File::create(&source_path).unwrap();
        f.write_all(&vec![0xabu8; source_size as usize]).unwrap();
        drop(f);

        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::default());
        let events = Arc::new(EventBus::new());
        let ctx = Arc::new(UploadContext {
            store: store.clone(),
            remote: remote.clone(),
            resolver: None,
            background: Arc::new(NoBackgroundTransport),
            staging: ChunkStaging::new(work_dir.path().join("chunks")),
            events: events.clone(),
            parallelism: Arc::new(ParallelismController::new()),
            gate: Arc::new(SuspensionGate::new()),
            config: UploadConfig::default(),
        });

        TestEnv {
            _work_dir: work_dir,
            source_path,
            store,
            remote,
            ctx,
            events,
        }
    }

    async fn enqueue_record(env: &TestEnv) -> String {
        let file = UploadFile::new(
            FileSource::LocalFile(env.source_path.clone()),
            "source.bin".to_string(),
            1,
            100,
            7,
        );
        let id = file.id.clone();
        env.store.save(&UploadRecord::new(file)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_happy_path_three_chunks() {
        let env = build_env(3 * MIB).await;
        let file_id = enqueue_record(&env).await;

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;

        let OperationOutcome::Completed(remote_file) = outcome else {
            panic!("期望上传成功");
        };
        assert_eq!(remote_file.id, 9001);
        assert_eq!(op.state(), OperationState::Completed);

        // 关闭会话只调用一次，且在所有分片成功之后
        assert_eq!(env.remote.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.remote.attempts(1), 1);
        assert_eq!(env.remote.attempts(2), 1);
        assert_eq!(env.remote.attempts(3), 1);

        // 会话与分片已清理，文件带上成功标记
        let record = env.store.load(&file_id).await.unwrap().unwrap();
        assert!(record.session.is_none());
        assert!(record.file.is_uploaded());
        assert_eq!(record.file.remote_file_id, Some(9001));
    }

    #[tokio::test]
    async fn test_chunk_fails_twice_then_succeeds_within_budget() {
        let env = build_env(3 * MIB).await;
        let file_id = enqueue_record(&env).await;

        // 分片 2 前两次失败，第三次成功；预算 3 足够
        env.remote.chunk_failures.lock().insert(2, 2);

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;

        assert!(matches!(outcome, OperationOutcome::Completed(_)));
        assert_eq!(env.remote.attempts(2), 3);
        // 成功分片不会被重复提交
        assert_eq!(env.remote.attempts(1), 1);
        assert_eq!(env.remote.attempts(3), 1);
        assert_eq!(env.remote.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted_surfaces_chunk_error() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        // 分片 1 永远失败
        env.remote.chunk_failures.lock().insert(1, u32::MAX);

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;

        let OperationOutcome::Failed(error) = outcome else {
            panic!("期望终态失败");
        };
        assert!(matches!(error, UploadError::Network(_)));

        // 关闭会话从未被调用
        assert_eq!(env.remote.close_calls.load(Ordering::SeqCst), 0);

        // 错误附着在文件上，预算耗尽后不再自动重试
        let record = env.store.load(&file_id).await.unwrap().unwrap();
        assert!(record.file.error.is_some());
        assert!(!record.file.can_retry());
    }

    #[tokio::test]
    async fn test_resume_skips_done_chunks() {
        let env = build_env(3 * MIB).await;
        let file_id = enqueue_record(&env).await;

        // 第一次运行完整跑通，借此拿到会话形态
        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Completed(_)));

        // 构造"崩溃恢复"现场：会话存在、分片 1 已有成功回执
        let mut record = env.store.load(&file_id).await.unwrap().unwrap();
        record.file = UploadFile::new(
            FileSource::LocalFile(env.source_path.clone()),
            "source.bin".to_string(),
            1,
            100,
            7,
        );
        let file_id = record.file.id.clone();
        let identity = FileIdentity::of_path(&env.source_path).unwrap();
        let ranges = build_ranges(3 * MIB).unwrap();
        let mut session = SessionTask::new(
            "restored-token".to_string(),
            env.source_path.clone(),
            identity,
            &ranges,
        );
        session.chunk_tasks[0].chunk = Some(UploadedChunk {
            number: 1,
            status: "ok".to_string(),
            created_at: 0,
            size: MIB,
            hash: None,
        });
        record.session = Some(session);
        env.store.save(&record).await.unwrap();

        let before_attempt_1 = env.remote.attempts(1);

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;
        assert!(matches!(outcome, OperationOutcome::Completed(_)));

        // 已完成的分片 1 没有被重新提交
        assert_eq!(env.remote.attempts(1), before_attempt_1);
        // 会话被复用，没有新开会话
        let record = env.store.load(&file_id).await.unwrap().unwrap();
        assert!(record.session.is_none());
        assert!(record.file.is_uploaded());
    }

    #[tokio::test]
    async fn test_resume_reconciles_with_remote_state() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        // 本地会话里分片 1 没有回执（成功回调在崩溃中丢失），
        // 但远端对账显示它已被接收
        let mut record = env.store.load(&file_id).await.unwrap().unwrap();
        let identity = FileIdentity::of_path(&env.source_path).unwrap();
        let ranges = build_ranges(2 * MIB).unwrap();
        record.session = Some(SessionTask::new(
            "reconcile-token".to_string(),
            env.source_path.clone(),
            identity,
            &ranges,
        ));
        env.store.save(&record).await.unwrap();

        env.remote.live_chunks.lock().push(UploadedChunk {
            number: 1,
            status: "ok".to_string(),
            created_at: 0,
            size: MIB,
            hash: None,
        });

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;
        assert!(matches!(outcome, OperationOutcome::Completed(_)));

        // 分片 1 由对账补记，从未重新上传；分片 2 正常上传
        assert_eq!(env.remote.attempts(1), 0);
        assert_eq!(env.remote.attempts(2), 1);
        assert_eq!(env.remote.open_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_discards_session() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        // 持久化一个指纹不匹配的会话（模拟源文件在会话建立后被修改）
        let mut record = env.store.load(&file_id).await.unwrap().unwrap();
        let stale_identity = FileIdentity::from_times(&crate::fsx::FileTimes {
            created_secs: 1,
            modified_secs: 1,
        });
        let ranges = build_ranges(2 * MIB).unwrap();
        let mut session = SessionTask::new(
            "stale-token".to_string(),
            env.source_path.clone(),
            stale_identity,
            &ranges,
        );
        // 旧会话声称分片 1 已完成——它的字节不可信，必须一并废弃
        session.chunk_tasks[0].chunk = Some(UploadedChunk {
            number: 1,
            status: "ok".to_string(),
            created_at: 0,
            size: MIB,
            hash: None,
        });
        record.session = Some(session);
        env.store.save(&record).await.unwrap();

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;
        assert!(matches!(outcome, OperationOutcome::Completed(_)));

        // 废弃会话后新开了会话，所有分片在新会话下重新上传
        assert_eq!(env.remote.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.remote.attempts(1), 1);
        assert_eq!(env.remote.attempts(2), 1);
        // 旧会话的服务端资源被尽力释放
        assert!(env.remote.cancel_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_expired_session_discarded_and_recreated() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        let mut record = env.store.load(&file_id).await.unwrap().unwrap();
        let identity = FileIdentity::of_path(&env.source_path).unwrap();
        let ranges = build_ranges(2 * MIB).unwrap();
        let mut session = SessionTask::new(
            "expired-token".to_string(),
            env.source_path.clone(),
            identity,
            &ranges,
        );
        session.session_expiration = chrono::Utc::now().timestamp() - 60;
        record.session = Some(session);
        env.store.save(&record).await.unwrap();

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;

        assert!(matches!(outcome, OperationOutcome::Completed(_)));
        // 过期会话不复用：重新开启了会话
        assert_eq!(env.remote.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_rejection_at_close_is_fatal() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;
        env.remote.reject_close.store(true, Ordering::SeqCst);

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        let outcome = op.run().await;

        let OperationOutcome::Failed(error) = outcome else {
            panic!("期望终态失败");
        };
        assert!(matches!(error, UploadError::RemoteRejected(_)));
        // 不自动重试关闭
        assert_eq!(env.remote.close_calls.load(Ordering::SeqCst), 1);

        // 本地会话已废弃，手动重试会从头开始
        let record = env.store.load(&file_id).await.unwrap().unwrap();
        assert!(record.session.is_none());
        assert!(!record.file.is_uploaded());
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_fast() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        op.cancel();
        let outcome = op.run().await;

        assert!(matches!(outcome, OperationOutcome::Cancelled));
        assert_eq!(op.state(), OperationState::Cancelled);
        // 从未接触网络
        assert_eq!(env.remote.open_calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.remote.close_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspension_before_fan_out_reschedules() {
        let env = build_env(2 * MIB).await;
        let file_id = enqueue_record(&env).await;

        let suspend = CancellationToken::new();
        suspend.cancel();

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), suspend);
        let outcome = op.run().await;

        assert!(matches!(outcome, OperationOutcome::Rescheduled));

        // 会话与分片记录保持原样，错误标记为改派
        let record = env.store.load(&file_id).await.unwrap().unwrap();
        assert!(record.session.is_some());
        assert_eq!(record.file.error, Some(UploadError::TaskRescheduled));
        // 远端会话未被释放（等待恢复）
        assert_eq!(env.remote.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let env = build_env(3 * MIB).await;
        let file_id = enqueue_record(&env).await;
        let mut rx = env.events.subscribe();

        let op = UploadOperation::new(file_id.clone(), env.ctx.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Completed(_)));

        // 至少收到一条进度事件，最后一条达到 100%
        let mut last_fraction = 0.0;
        let mut saw_progress = false;
        while let Ok(event) = rx.try_recv() {
            if let UploadEvent::Progress { fraction, .. } = event {
                saw_progress = true;
                last_fraction = fraction;
            }
        }
        assert!(saw_progress);
        assert!((last_fraction - 1.0).abs() < f64::EPSILON);
    }
}
