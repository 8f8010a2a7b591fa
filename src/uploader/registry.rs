// 操作注册表
//
// 文件 ID 到活跃上传操作的并发映射，队列去重的唯一依据。
// 所有读写经过 DashMap 的分段锁，外部永远观察不到半更新状态。
// 已终态（完成/失败/取消）的条目视为不存在，不阻塞同一文件再次入队

use crate::uploader::operation::UploadOperation;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// 操作注册表
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: DashMap<String, Arc<UploadOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取活跃操作（终态条目视为不存在）
    pub fn get(&self, file_id: &str) -> Option<Arc<UploadOperation>> {
        let entry = self.operations.get(file_id)?;
        if entry.is_terminal() {
            return None;
        }
        Some(entry.clone())
    }

    /// 注册操作；该文件已有活跃操作时返回 false
    ///
    /// 通过 entry API 原子完成"检查 + 插入"，
    /// 并发的重复入队只会有一个成功
    pub fn insert_if_vacant(&self, operation: Arc<UploadOperation>) -> bool {
        let file_id = operation.file_id().to_string();
        let mut inserted = false;

        self.operations
            .entry(file_id.clone())
            .and_modify(|existing| {
                if existing.is_terminal() {
                    // 终态残留条目允许被替换
                    *existing = operation.clone();
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                operation.clone()
            });

        if inserted {
            debug!("操作已注册: file_id={}", file_id);
        } else {
            debug!("操作已存在，跳过注册: file_id={}", file_id);
        }
        inserted
    }

    /// 移除操作
    pub fn remove(&self, file_id: &str) -> Option<Arc<UploadOperation>> {
        self.operations.remove(file_id).map(|(_, op)| op)
    }

    /// 活跃操作数
    pub fn active_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .count()
    }

    /// 是否没有活跃操作
    pub fn is_idle(&self) -> bool {
        self.active_count() == 0
    }

    /// 全部活跃操作的快照
    pub fn active_operations(&self) -> Vec<Arc<UploadOperation>> {
        self.operations
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }
}
