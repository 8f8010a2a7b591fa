// 上传文件定义
//
// 一次上传意图的持久化记录：来源、目的地、冲突策略、
// 重试预算与终态错误。记录在终态解决或被取消后删除

use crate::api::ConflictPolicy;
use crate::errors::UploadError;
use crate::fsx::FileSource;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 默认重试预算
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// 上传优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPriority {
    /// 低（后台批量任务）
    Low,
    /// 普通
    Normal,
    /// 高（用户主动发起）
    High,
}

impl Default for UploadPriority {
    fn default() -> Self {
        UploadPriority::Normal
    }
}

/// 上传文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    /// 文件 ID（资产标识派生或随机 UUID）
    pub id: String,
    /// 文件名
    pub name: String,
    /// 上传来源
    pub source: FileSource,
    /// 目标目录 ID
    pub parent_directory_id: u64,
    /// 所属云盘 ID
    pub drive_id: u64,
    /// 所属账号 ID
    pub user_id: u64,
    /// 冲突解决方式
    pub conflict: ConflictPolicy,
    /// 优先级
    #[serde(default)]
    pub priority: UploadPriority,
    /// 源文件创建时间（Unix 秒）
    pub creation_date: Option<i64>,
    /// 源文件修改时间（Unix 秒）
    pub modification_date: Option<i64>,
    /// 任务创建时间（Unix 秒）
    pub task_creation_date: i64,
    /// 上传成功时间（Unix 秒，成功前为 None）
    pub upload_date: Option<i64>,
    /// 上传成功后的远端文件 ID
    pub remote_file_id: Option<u64>,
    /// 剩余重试预算
    pub max_retry_count: u32,
    /// 最近一次错误
    pub error: Option<UploadError>,
}

impl UploadFile {
    /// 创建新的上传文件
    pub fn new(
        source: FileSource,
        name: String,
        parent_directory_id: u64,
        drive_id: u64,
        user_id: u64,
    ) -> Self {
        let id = match &source {
            // 资产来源用资产标识派生，保证同一资产重复入队能被去重
            FileSource::PlatformAsset(asset_id) => format!("asset-{}", asset_id),
            FileSource::LocalFile(_) => Uuid::new_v4().to_string(),
        };

        Self {
            id,
            name,
            source,
            parent_directory_id,
            drive_id,
            user_id,
            conflict: ConflictPolicy::default(),
            priority: UploadPriority::default(),
            creation_date: None,
            modification_date: None,
            task_creation_date: Utc::now().timestamp(),
            upload_date: None,
            remote_file_id: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            error: None,
        }
    }

    /// 设置冲突策略
    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: UploadPriority) -> Self {
        self.priority = priority;
        self
    }

    /// 是否已上传成功
    pub fn is_uploaded(&self) -> bool {
        self.upload_date.is_some()
    }

    /// 是否还有重试预算
    pub fn can_retry(&self) -> bool {
        self.max_retry_count > 0
    }

    /// 消耗一次重试预算
    pub fn consume_retry(&mut self) {
        self.max_retry_count = self.max_retry_count.saturating_sub(1);
    }

    /// 标记上传成功
    pub fn mark_uploaded(&mut self, remote_file_id: u64) {
        self.upload_date = Some(Utc::now().timestamp());
        self.remote_file_id = Some(remote_file_id);
        self.error = None;
    }

    /// 清理错误并重置预算，供手动重试
    pub fn clear_errors_for_retry(&mut self) {
        self.error = None;
        self.max_retry_count = DEFAULT_MAX_RETRY_COUNT;
    }
}
