// 上传队列
//
// 上传工作的唯一入口和出口：
// - 入队去重：同一文件 ID 同时只存在一个活跃操作
// - 有界调度：并发操作数受并行度控制器约束
// - 挂起策略：手动挂起与网络派生挂起取逻辑或；
//   断网、或"仅 Wi-Fi"开启时处于蜂窝网络，队列挂起，
//   不再派发新操作、不再发起新的分片请求
// - 终态发布：每个文件恰好广播一次终态事件；
//   取消与改派后台属于静默结果，只清理状态不广播

use crate::api::RemoteStore;
use crate::errors::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::store::{self, UploadRecord, UploadStore};
use crate::uploader::file::{UploadFile, UploadPriority};
use crate::uploader::operation::{
    OperationOutcome, OperationState, UploadContext, UploadOperation,
};
use crate::uploader::registry::OperationRegistry;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 调度循环空转间隔
const DISPATCH_IDLE_INTERVAL: Duration = Duration::from_millis(50);

// =====================================================
// 挂起闸门
// =====================================================

/// 挂起闸门
///
/// 队列根据挂起策略拨动；操作在发起每个新分片请求前等待闸门放行，
/// 保证挂起状态下不会产生新的网络活动
#[derive(Debug)]
pub struct SuspensionGate {
    sender: watch::Sender<bool>,
}

impl SuspensionGate {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// 设置挂起状态，返回状态是否发生变化
    pub fn set(&self, suspended: bool) -> bool {
        let changed = *self.sender.borrow() != suspended;
        if changed {
            let _ = self.sender.send(suspended);
        }
        changed
    }

    /// 当前是否挂起
    pub fn is_suspended(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待直到解除挂起
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.sender.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for SuspensionGate {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================
// 等待队列
// =====================================================

/// 等待派发的条目
#[derive(Debug, Clone)]
struct WaitingEntry {
    file_id: String,
    priority: UploadPriority,
    task_creation_date: i64,
}

/// 取出优先级最高的等待条目（同优先级按创建时间先进先出）
fn pop_next_entry(waiting: &mut Vec<WaitingEntry>) -> Option<WaitingEntry> {
    if waiting.is_empty() {
        return None;
    }
    let mut best = 0;
    for (index, entry) in waiting.iter().enumerate().skip(1) {
        let current = &waiting[best];
        let higher = entry.priority > current.priority
            || (entry.priority == current.priority
                && entry.task_creation_date < current.task_creation_date);
        if higher {
            best = index;
        }
    }
    Some(waiting.remove(best))
}

// =====================================================
// 上传队列
// =====================================================

/// 上传队列
pub struct UploadQueue {
    /// 共享协作者
    ctx: Arc<UploadContext>,
    /// 操作注册表
    registry: Arc<OperationRegistry>,
    /// 挂起信号源（进程挂起时产生每操作子令牌）
    suspend_root: CancellationToken,
    /// 等待派发的文件
    waiting: Arc<SyncMutex<Vec<WaitingEntry>>>,
    /// 正在执行的操作数
    running: Arc<AtomicUsize>,
    /// 手动挂起标志
    force_suspended: Arc<AtomicBool>,
    /// 仅 Wi-Fi 上传
    wifi_only: Arc<AtomicBool>,
    /// 网络状态快照
    network_status: Arc<SyncMutex<NetworkStatus>>,
}

impl UploadQueue {
    /// 创建队列并启动调度循环
    ///
    /// # 参数
    /// * `ctx` - 共享协作者（其中的挂起闸门由队列接管拨动）
    /// * `monitor` - 网络状态监视器
    /// * `wifi_only` - 是否仅在 Wi-Fi 下上传
    pub fn new(ctx: Arc<UploadContext>, monitor: &NetworkMonitor, wifi_only: bool) -> Arc<Self> {
        let queue = Arc::new(Self {
            ctx,
            registry: Arc::new(OperationRegistry::new()),
            suspend_root: CancellationToken::new(),
            waiting: Arc::new(SyncMutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            force_suspended: Arc::new(AtomicBool::new(false)),
            wifi_only: Arc::new(AtomicBool::new(wifi_only)),
            network_status: Arc::new(SyncMutex::new(monitor.current())),
        });

        queue.reevaluate_suspension();
        queue.spawn_network_watcher(monitor.subscribe());
        queue.spawn_dispatcher();

        info!(
            "上传队列已启动: wifi_only={}, 并行度={}",
            wifi_only,
            queue.ctx.parallelism.current()
        );
        queue
    }

    /// 订阅上传事件流
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<UploadEvent> {
        self.ctx.events.subscribe()
    }

    /// 入队一个上传文件
    ///
    /// 同一文件 ID 已有未终态操作时为空操作。
    /// 存储中已有记录（崩溃前的会话）时保留记录原样，实现断点续传
    pub async fn enqueue(&self, file: UploadFile) -> UploadResult<()> {
        let file_id = file.id.clone();

        if self.registry.get(&file_id).is_some() {
            debug!("文件已在队列中，跳过入队: file_id={}", file_id);
            return Ok(());
        }

        // 已有持久化记录（含会话与分片）则保留，否则落盘新记录
        let record = match self.ctx.store.load(&file_id).await? {
            Some(mut existing) => {
                existing.file.error = None;
                self.ctx.store.save(&existing).await?;
                existing
            }
            None => {
                let record = UploadRecord::new(file);
                self.ctx.store.save(&record).await?;
                record
            }
        };

        self.enqueue_record(&record)?;

        self.ctx.events.publish(UploadEvent::Enqueued {
            file_id: file_id.clone(),
        });
        self.publish_pending_count(record.file.parent_directory_id, record.file.drive_id)
            .await;

        Ok(())
    }

    /// 把一条已持久化的记录注册进调度（内部入口，enqueue 与重建共用）
    fn enqueue_record(&self, record: &UploadRecord) -> UploadResult<()> {
        let file_id = record.file.id.clone();

        let operation = Arc::new(UploadOperation::new(
            file_id.clone(),
            self.ctx.clone(),
            self.suspend_root.child_token(),
        ));
        if !self.registry.insert_if_vacant(operation) {
            debug!("注册表已有活跃操作: file_id={}", file_id);
            return Ok(());
        }

        self.waiting.lock().push(WaitingEntry {
            file_id: file_id.clone(),
            priority: record.file.priority,
            task_creation_date: record.file.task_creation_date,
        });
        debug!("文件已进入等待队列: file_id={}", file_id);
        Ok(())
    }

    /// 取消一个文件的上传
    ///
    /// 先请求操作释放服务端会话资源（尽力而为），
    /// 无论结果如何都将其移出注册表并删除本地记录。
    /// 取消属于静默终态，不广播完成事件
    pub async fn cancel(&self, file_id: &str) -> UploadResult<()> {
        info!("取消上传: file_id={}", file_id);

        // 移出等待队列
        self.waiting.lock().retain(|e| e.file_id != file_id);

        if let Some(operation) = self.registry.get(file_id) {
            // 执行中的操作：由操作自身完成远端释放与本地清理，
            // 记录删除在终态处理中进行
            operation.cancel();
            self.registry.remove(file_id);

            // 尚未派发的操作不会走终态清理，这里直接清理存储
            if operation.state() == OperationState::Queued {
                self.cleanup_cancelled_record(file_id).await?;
            }
            return Ok(());
        }

        // 无活跃操作：直接清理存储与远端会话
        self.cleanup_cancelled_record(file_id).await
    }

    /// 取消时的存储与远端会话清理
    async fn cleanup_cancelled_record(&self, file_id: &str) -> UploadResult<()> {
        if let Some(mut record) = self.ctx.store.load(file_id).await? {
            if let Some(session) = record.session.take() {
                self.ctx.staging.remove_session(file_id, &session.token).await;
                if let Err(e) = self
                    .ctx
                    .remote
                    .cancel_session(record.file.drive_id, &session.token)
                    .await
                {
                    debug!("释放远端会话失败（忽略）: file_id={}, 错误: {}", file_id, e);
                }
            }
            self.ctx.store.delete(file_id).await?;
            self.publish_pending_count(record.file.parent_directory_id, record.file.drive_id)
                .await;
        }
        Ok(())
    }

    /// 取消某目录/云盘维度下的全部待上传文件
    pub async fn cancel_all_in_parent(
        &self,
        parent_directory_id: u64,
        drive_id: u64,
    ) -> UploadResult<usize> {
        let targets: Vec<String> = self
            .ctx
            .store
            .load_all()
            .await?
            .into_iter()
            .filter(|r| {
                r.is_pending()
                    && r.file.parent_directory_id == parent_directory_id
                    && r.file.drive_id == drive_id
            })
            .map(|r| r.file.id)
            .collect();

        info!(
            "批量取消: parent={}, drive={}, 数量={}",
            parent_directory_id,
            drive_id,
            targets.len()
        );
        let count = targets.len();
        for file_id in targets {
            self.cancel(&file_id).await?;
        }
        Ok(count)
    }

    /// 手动重试一个终态失败的文件：清理错误、重置预算、重新入队
    pub async fn retry(&self, file_id: &str) -> UploadResult<()> {
        let Some(mut record) = self.ctx.store.load(file_id).await? else {
            return Err(UploadError::Local(format!("上传记录缺失: {}", file_id)));
        };

        record.file.clear_errors_for_retry();
        self.ctx.store.save(&record).await?;
        self.enqueue_record(&record)?;
        info!("文件已重新入队: file_id={}", file_id);
        Ok(())
    }

    /// 从存储重建队列
    ///
    /// 启动时调用：所有未上传成功且仍有重试预算的记录
    /// 按任务创建顺序重新入队。改派后台的文件也在其中，
    /// 其已完成/后台分片在恢复时被跳过
    pub async fn rebuild_from_store(&self) -> UploadResult<usize> {
        let mut records: Vec<UploadRecord> = self
            .ctx
            .store
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.is_pending())
            .collect();
        records.sort_by_key(|r| r.file.task_creation_date);

        let count = records.len();
        info!("从存储重建上传队列: 待恢复={}", count);

        for record in &records {
            self.enqueue_record(record)?;
        }
        Ok(count)
    }

    /// 手动挂起所有操作
    pub fn suspend_all(&self) {
        info!("手动挂起上传队列");
        self.force_suspended.store(true, Ordering::SeqCst);
        self.reevaluate_suspension();
    }

    /// 解除手动挂起（网络派生的挂起不受影响）
    pub fn resume_all(&self) {
        info!("解除上传队列手动挂起");
        self.force_suspended.store(false, Ordering::SeqCst);
        self.reevaluate_suspension();
    }

    /// 运行时切换"仅 Wi-Fi"限制
    pub fn set_wifi_only(&self, wifi_only: bool) {
        info!("仅 Wi-Fi 上传: {}", wifi_only);
        self.wifi_only.store(wifi_only, Ordering::SeqCst);
        self.reevaluate_suspension();
    }

    /// 当前是否处于挂起状态
    pub fn is_suspended(&self) -> bool {
        self.ctx.gate.is_suspended()
    }

    /// 进程即将挂起：通知所有活跃操作移交在途请求
    pub fn reschedule_running_operations(&self) {
        warn!("进程即将挂起，通知所有活跃操作改派后台");
        self.suspend_root.cancel();
    }

    /// 某目录/云盘维度的待上传数量
    pub async fn pending_count(&self, parent_directory_id: u64, drive_id: u64) -> UploadResult<usize> {
        store::pending_count(self.ctx.store.as_ref(), parent_directory_id, drive_id).await
    }

    /// 等待队列中与执行中的任务全部结束
    pub async fn wait_for_completion(&self) {
        loop {
            let idle = self.waiting.lock().is_empty()
                && self.running.load(Ordering::SeqCst) == 0;
            if idle {
                return;
            }
            tokio::time::sleep(DISPATCH_IDLE_INTERVAL).await;
        }
    }

    /// 重新计算有效挂起状态（手动 OR 网络派生）
    fn reevaluate_suspension(&self) {
        let force = self.force_suspended.load(Ordering::SeqCst);
        let wifi_only = self.wifi_only.load(Ordering::SeqCst);
        let status = *self.network_status.lock();
        let suspended = force || !status.allows_upload(wifi_only);

        if self.ctx.gate.set(suspended) {
            info!(
                "队列挂起状态变化: suspended={} (force={}, network={:?}, wifi_only={})",
                suspended, force, status, wifi_only
            );
            self.ctx
                .events
                .publish(UploadEvent::SuspensionChanged { suspended });
        }
    }

    /// 发布目录/云盘维度的待上传数量事件
    async fn publish_pending_count(&self, parent_directory_id: u64, drive_id: u64) {
        if let Ok(count) =
            store::pending_count(self.ctx.store.as_ref(), parent_directory_id, drive_id).await
        {
            self.ctx.events.publish(UploadEvent::PendingCount {
                parent_directory_id,
                drive_id,
                count,
            });
        }
    }

    /// 网络状态监听任务：每次连通性变化都重新评估挂起策略
    fn spawn_network_watcher(self: &Arc<Self>, mut rx: watch::Receiver<NetworkStatus>) {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow();
                let Some(queue) = queue.upgrade() else {
                    return;
                };
                *queue.network_status.lock() = status;
                queue.reevaluate_suspension();
            }
        });
    }

    /// 调度循环：挂起时不派发；并发操作数受并行度控制器约束
    fn spawn_dispatcher(self: &Arc<Self>) {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(queue) = queue.upgrade() else {
                    return;
                };

                // 挂起期间不派发新操作
                if queue.ctx.gate.is_suspended() {
                    drop(queue);
                    tokio::time::sleep(DISPATCH_IDLE_INTERVAL).await;
                    continue;
                }

                // 并发上限
                let limit = queue
                    .ctx
                    .parallelism
                    .operation_limit(queue.ctx.config.max_concurrent_operations);
                if queue.running.load(Ordering::SeqCst) >= limit {
                    drop(queue);
                    tokio::time::sleep(DISPATCH_IDLE_INTERVAL).await;
                    continue;
                }

                let entry = pop_next_entry(&mut queue.waiting.lock());
                let Some(entry) = entry else {
                    drop(queue);
                    tokio::time::sleep(DISPATCH_IDLE_INTERVAL).await;
                    continue;
                };

                queue.dispatch_entry(entry).await;
            }
        });
    }

    /// 派发一个等待条目
    async fn dispatch_entry(self: &Arc<Self>, entry: WaitingEntry) {
        let file_id = entry.file_id;
        // 先计入执行数，wait_for_completion 不会在派发间隙误判空闲
        self.running.fetch_add(1, Ordering::SeqCst);

        let Some(operation) = self.registry.get(&file_id) else {
            debug!("等待条目已无对应操作，跳过: file_id={}", file_id);
            self.running.fetch_sub(1, Ordering::SeqCst);
            return;
        };

        // 终态发布需要目录/云盘维度信息，派发前取快照
        let (parent_id, drive_id) = match self.ctx.store.load(&file_id).await {
            Ok(Some(record)) => (
                record.file.parent_directory_id,
                record.file.drive_id,
            ),
            _ => {
                warn!("派发时记录缺失: file_id={}", file_id);
                self.registry.remove(&file_id);
                self.running.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        let queue = self.clone();
        tokio::spawn(async move {
            debug!("操作开始执行: file_id={}", file_id);
            let outcome = operation.run().await;
            queue
                .on_operation_finished(&file_id, parent_id, drive_id, outcome)
                .await;
            queue.running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// 终态处理：恰好一次的事件发布与状态清理
    async fn on_operation_finished(
        &self,
        file_id: &str,
        parent_id: u64,
        drive_id: u64,
        outcome: OperationOutcome,
    ) {
        self.registry.remove(file_id);

        match outcome {
            OperationOutcome::Completed(remote_file) => {
                self.ctx.events.publish(UploadEvent::Completed {
                    file_id: file_id.to_string(),
                    remote_file,
                });
            }
            OperationOutcome::Failed(error) => {
                // 静默错误不进入完成广播
                if !error.is_silent() {
                    self.ctx.events.publish(UploadEvent::Failed {
                        file_id: file_id.to_string(),
                        error,
                    });
                }
            }
            OperationOutcome::Cancelled => {
                // 用户取消：删除记录，不广播
                if let Err(e) = self.ctx.store.delete(file_id).await {
                    warn!("删除已取消记录失败: file_id={}, 错误: {}", file_id, e);
                }
            }
            OperationOutcome::Rescheduled => {
                // 改派后台：记录保留，等待恢复，不广播
                debug!("操作已改派后台: file_id={}", file_id);
            }
        }

        self.publish_pending_count(parent_id, drive_id).await;
    }
}
