//! 上传记录持久化
//!
//! 上传文件、会话与分片作为一个文档整体读写：
//! 一次保存覆盖文件 + 会话 + 全部分片，天然满足
//! "会话与分片必须原子落盘"的要求，崩溃后不会出现
//! 分片同时声称"已完成"和"可调度"的中间状态。
//!
//! 引擎只依赖 `UploadStore` trait；内置两个实现：
//! - `MemoryStore`：内存实现，测试用
//! - `FileStore`：JSON 文件实现，每条记录一个 .meta 文件，临时文件+重命名保证原子性

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::errors::UploadResult;
use crate::uploader::file::UploadFile;
use crate::uploader::session::SessionTask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 上传记录（持久化单元）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// 上传文件
    pub file: UploadFile,
    /// 当前会话（未开启或已清理时为 None）
    pub session: Option<SessionTask>,
}

impl UploadRecord {
    pub fn new(file: UploadFile) -> Self {
        Self {
            file,
            session: None,
        }
    }

    /// 记录是否仍待上传（未成功且还有重试预算）
    pub fn is_pending(&self) -> bool {
        !self.file.is_uploaded() && self.file.can_retry()
    }
}

/// 上传记录存储
///
/// `save` 为事务性整体写入；实现方必须保证单条记录的写入原子性
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// 原子保存一条记录（文件 + 会话 + 分片）
    async fn save(&self, record: &UploadRecord) -> UploadResult<()>;

    /// 按文件 ID 读取
    async fn load(&self, file_id: &str) -> UploadResult<Option<UploadRecord>>;

    /// 删除一条记录
    async fn delete(&self, file_id: &str) -> UploadResult<()>;

    /// 读取全部记录（启动恢复扫描用）
    async fn load_all(&self) -> UploadResult<Vec<UploadRecord>>;
}

/// 统计某目录/云盘维度下待上传的记录数
pub async fn pending_count(
    store: &dyn UploadStore,
    parent_directory_id: u64,
    drive_id: u64,
) -> UploadResult<usize> {
    let records = store.load_all().await?;
    Ok(records
        .iter()
        .filter(|r| {
            r.is_pending()
                && r.file.parent_directory_id == parent_directory_id
                && r.file.drive_id == drive_id
        })
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsx::FileSource;
    use std::path::PathBuf;

    fn sample_record(parent: u64, drive: u64) -> UploadRecord {
        UploadRecord::new(UploadFile::new(
            FileSource::LocalFile(PathBuf::from("/tmp/a.bin")),
            "a.bin".to_string(),
            parent,
            drive,
            1,
        ))
    }

    #[test]
    fn test_record_pending_state() {
        let mut record = sample_record(1, 1);
        assert!(record.is_pending());

        record.file.mark_uploaded(99);
        assert!(!record.is_pending());

        let mut exhausted = sample_record(1, 1);
        exhausted.file.max_retry_count = 0;
        assert!(!exhausted.is_pending());
    }

    #[tokio::test]
    async fn test_pending_count_filters_by_parent_and_drive() {
        let store = MemoryStore::new();
        store.save(&sample_record(1, 100)).await.unwrap();
        store.save(&sample_record(1, 100)).await.unwrap();
        store.save(&sample_record(2, 100)).await.unwrap();

        let mut uploaded = sample_record(1, 100);
        uploaded.file.mark_uploaded(7);
        store.save(&uploaded).await.unwrap();

        assert_eq!(pending_count(&store, 1, 100).await.unwrap(), 2);
        assert_eq!(pending_count(&store, 2, 100).await.unwrap(), 1);
        assert_eq!(pending_count(&store, 3, 100).await.unwrap(), 0);
    }
}
