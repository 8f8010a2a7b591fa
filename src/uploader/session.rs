// 上传会话与分片任务定义
//
// SessionTask 对应一次远端上传会话：令牌、过期时间、源文件身份指纹
// 与全部分片任务。会话由单个上传操作独占，完成、过期废弃或取消时销毁。
// ChunkTask 记录单个分片的字节区间、暂存状态与上传结果，
// 从"未完成"到"完成"只允许迁移一次，重试必须先显式清理终态字段

use crate::api::UploadedChunk;
use crate::errors::{UploadError, UploadResult};
use crate::fsx::{self, FileTimes};
use crate::uploader::range::ChunkRange;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 会话本地有效期（秒）
///
/// 服务端令牌有效 12 小时，本地记 11 小时，保证客户端先于服务端判定过期
pub const SESSION_LIFETIME_SECS: i64 = 11 * 60 * 60;

/// 源文件身份指纹
///
/// 只由创建时间和修改时间构成的廉价代理。
/// 已知弱点：无法察觉时间戳不变的原地修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity(String);

impl FileIdentity {
    /// 由文件时间元数据计算指纹
    pub fn from_times(times: &FileTimes) -> Self {
        Self(format!("{}-{}", times.created_secs, times.modified_secs))
    }

    /// 读取路径当前的指纹
    pub fn of_path(path: &Path) -> UploadResult<Self> {
        let times = fsx::file_times(path)?;
        Ok(Self::from_times(&times))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 分片任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTask {
    /// 分片号（1 起始，连续）
    pub chunk_number: i64,
    /// 字节闭区间
    pub range: ChunkRange,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 暂存分片文件路径
    pub path: Option<PathBuf>,
    /// 分片 SHA-256
    pub sha256: Option<String>,
    /// 在途请求标识（进程内）
    pub task_identifier: Option<String>,
    /// 后台传输任务标识（进程挂起时移交产生）
    pub background_task_id: Option<String>,
    /// 成功回执
    pub chunk: Option<UploadedChunk>,
    /// 分片级错误
    pub error: Option<UploadError>,
}

impl ChunkTask {
    pub fn new(chunk_number: i64, range: ChunkRange) -> Self {
        Self {
            chunk_number,
            range,
            chunk_size: range.size(),
            path: None,
            sha256: None,
            task_identifier: None,
            background_task_id: None,
            chunk: None,
            error: None,
        }
    }

    /// 分片已暂存在本地：路径存在可读，且已计算出非空哈希
    pub fn has_local_chunk(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let Some(sha256) = &self.sha256 else {
            return false;
        };
        !sha256.is_empty() && fsx::is_readable_file(path)
    }

    /// 已有终态（成功回执或错误）
    pub fn done_uploading(&self) -> bool {
        self.chunk.is_some() || self.error.is_some()
    }

    /// 已成功上传
    pub fn done_uploading_success(&self) -> bool {
        self.chunk.is_some()
    }

    /// 已调度（存在在途请求或后台传输任务）
    pub fn is_scheduled(&self) -> bool {
        self.task_identifier.is_some() || self.background_task_id.is_some()
    }

    /// 可以发起上传：未完成、未调度、本地分片就绪
    pub fn can_start_uploading(&self) -> bool {
        !self.done_uploading() && !self.is_scheduled() && self.has_local_chunk()
    }

    /// 需要暂存：未完成、未调度、本地分片未就绪
    pub fn needs_staging(&self) -> bool {
        !self.done_uploading() && !self.is_scheduled() && !self.has_local_chunk()
    }

    /// 清理状态供重试/复用
    ///
    /// 清空终态错误、在途标识与暂存信息；已成功的回执与
    /// 后台传输标识不受影响
    pub fn clear_for_retry(&mut self) {
        self.error = None;
        self.task_identifier = None;
        self.path = None;
        self.sha256 = None;
    }
}

/// 上传会话任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTask {
    /// 会话令牌（远端签发）
    pub token: String,
    /// 会话过期时间（Unix 秒）
    pub session_expiration: i64,
    /// 开启会话时的源文件身份指纹
    pub file_identity: FileIdentity,
    /// 源文件路径（资产解析后的本地路径）
    pub file_path: PathBuf,
    /// 全部分片任务（按分片号有序）
    pub chunk_tasks: Vec<ChunkTask>,
}

impl SessionTask {
    /// 创建新会话，按区间建立分片任务（分片号 1 起始）
    pub fn new(
        token: String,
        file_path: PathBuf,
        file_identity: FileIdentity,
        ranges: &[ChunkRange],
    ) -> Self {
        let chunk_tasks = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| ChunkTask::new(index as i64 + 1, *range))
            .collect();

        Self {
            token,
            session_expiration: Utc::now().timestamp() + SESSION_LIFETIME_SECS,
            file_identity,
            file_path,
            chunk_tasks,
        }
    }

    /// 会话是否已过期
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.session_expiration
    }

    /// 源文件身份是否未发生变化
    ///
    /// 指纹不匹配（或文件不可读）时必须废弃会话重建，
    /// 继续向过期状态的会话提交字节是不安全的
    pub fn file_identity_has_not_changed(&self) -> bool {
        match FileIdentity::of_path(&self.file_path) {
            Ok(current) => current == self.file_identity,
            Err(_) => false,
        }
    }

    /// 待上传分片数（未完成）
    pub fn chunks_to_upload_count(&self) -> usize {
        self.chunk_tasks
            .iter()
            .filter(|c| !c.done_uploading())
            .count()
    }

    /// 已成功分片数
    pub fn chunks_success_count(&self) -> usize {
        self.chunk_tasks
            .iter()
            .filter(|c| c.done_uploading_success())
            .count()
    }

    /// 出错分片数
    pub fn chunks_in_error_count(&self) -> usize {
        self.chunk_tasks.iter().filter(|c| c.error.is_some()).count()
    }

    /// 所有分片全部成功
    pub fn all_chunks_success(&self) -> bool {
        self.chunk_tasks.iter().all(|c| c.done_uploading_success())
    }

    /// 已成功上传的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunk_tasks
            .iter()
            .filter(|c| c.done_uploading_success())
            .map(|c| c.chunk_size)
            .sum()
    }

    /// 文件总字节数
    pub fn total_bytes(&self) -> u64 {
        self.chunk_tasks.iter().map(|c| c.chunk_size).sum()
    }

    /// 上传进度 [0, 1]
    pub fn progress_fraction(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        self.uploaded_bytes() as f64 / total as f64
    }

    /// 按分片号取可变引用
    pub fn chunk_by_number_mut(&mut self, chunk_number: i64) -> Option<&mut ChunkTask> {
        self.chunk_tasks
            .iter_mut()
            .find(|c| c.chunk_number == chunk_number)
    }

    /// 复用会话前的清理
    ///
    /// 未完成且未移交后台的分片：清空在途标识与暂存信息，等待重新暂存调度；
    /// 出错分片一并清空错误进入重试。已成功分片和后台分片保持不变
    pub fn clean_chunks_for_reuse(&mut self) {
        for chunk in &mut self.chunk_tasks {
            if chunk.done_uploading_success() || chunk.background_task_id.is_some() {
                continue;
            }
            chunk.clear_for_retry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::range::build_ranges_with_chunk_size;
    use std::io::Write;

    const MIB: u64 = 1024 * 1024;

    fn sample_session(chunks: usize) -> SessionTask {
        let ranges = build_ranges_with_chunk_size(chunks as u64 * MIB, MIB).unwrap();
        SessionTask::new(
            "token-1".to_string(),
            PathBuf::from("/tmp/source.bin"),
            FileIdentity::from_times(&FileTimes {
                created_secs: 100,
                modified_secs: 200,
            }),
            &ranges,
        )
    }

    fn ok_receipt(number: i64, size: u64) -> UploadedChunk {
        UploadedChunk {
            number,
            status: "ok".to_string(),
            created_at: 0,
            size,
            hash: None,
        }
    }

    #[test]
    fn test_new_session_chunk_numbering() {
        let session = sample_session(3);
        assert_eq!(session.chunk_tasks.len(), 3);
        assert_eq!(session.chunk_tasks[0].chunk_number, 1);
        assert_eq!(session.chunk_tasks[2].chunk_number, 3);
        assert!(!session.is_expired());
        assert_eq!(session.chunks_to_upload_count(), 3);
        assert_eq!(session.total_bytes(), 3 * MIB);
    }

    #[test]
    fn test_expiration() {
        let mut session = sample_session(1);
        assert!(!session.is_expired());

        session.session_expiration = Utc::now().timestamp() - 1;
        assert!(session.is_expired());
    }

    #[test]
    fn test_identity_mismatch_on_missing_file() {
        // 源文件不存在时视为身份已变化
        let session = sample_session(1);
        assert!(!session.file_identity_has_not_changed());
    }

    #[test]
    fn test_identity_matches_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"data").unwrap();
        drop(f);

        let identity = FileIdentity::of_path(&path).unwrap();
        let session = SessionTask::new(
            "t".to_string(),
            path,
            identity,
            &build_ranges_with_chunk_size(4, MIB).unwrap(),
        );
        assert!(session.file_identity_has_not_changed());
    }

    #[test]
    fn test_chunk_predicates() {
        let mut chunk = ChunkTask::new(1, ChunkRange::new(0, MIB - 1));

        // 初始：未完成、未调度、本地未就绪
        assert!(!chunk.done_uploading());
        assert!(!chunk.is_scheduled());
        assert!(!chunk.has_local_chunk());
        assert!(chunk.needs_staging());
        assert!(!chunk.can_start_uploading());

        // 暂存后（路径指向真实文件）
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("c1.part");
        std::fs::write(&staged, b"x").unwrap();
        chunk.path = Some(staged);
        chunk.sha256 = Some("abc".to_string());
        assert!(chunk.has_local_chunk());
        assert!(chunk.can_start_uploading());
        assert!(!chunk.needs_staging());

        // 调度中
        chunk.task_identifier = Some("req-1".to_string());
        assert!(chunk.is_scheduled());
        assert!(!chunk.can_start_uploading());

        // 成功终态
        chunk.task_identifier = None;
        chunk.chunk = Some(ok_receipt(1, MIB));
        assert!(chunk.done_uploading());
        assert!(chunk.done_uploading_success());
        assert!(!chunk.can_start_uploading());
    }

    #[test]
    fn test_chunk_clear_for_retry() {
        let mut chunk = ChunkTask::new(1, ChunkRange::new(0, 9));
        chunk.error = Some(UploadError::Network("x".to_string()));
        chunk.task_identifier = Some("req".to_string());
        chunk.path = Some(PathBuf::from("/tmp/p"));
        chunk.sha256 = Some("h".to_string());

        assert!(chunk.done_uploading());
        chunk.clear_for_retry();

        assert!(!chunk.done_uploading());
        assert!(chunk.error.is_none());
        assert!(chunk.task_identifier.is_none());
        assert!(chunk.path.is_none());
        assert!(chunk.sha256.is_none());
    }

    #[test]
    fn test_session_counters_and_progress() {
        let mut session = sample_session(4);

        session.chunk_tasks[0].chunk = Some(ok_receipt(1, MIB));
        session.chunk_tasks[1].error = Some(UploadError::Network("x".to_string()));

        assert_eq!(session.chunks_success_count(), 1);
        assert_eq!(session.chunks_in_error_count(), 1);
        // 出错分片也算"已完成"（有终态）
        assert_eq!(session.chunks_to_upload_count(), 2);
        assert!(!session.all_chunks_success());
        assert_eq!(session.uploaded_bytes(), MIB);
        assert!((session.progress_fraction() - 0.25).abs() < f64::EPSILON);

        for number in 2..=4 {
            let chunk = session.chunk_by_number_mut(number).unwrap();
            chunk.error = None;
            chunk.chunk = Some(ok_receipt(number, MIB));
        }
        assert!(session.all_chunks_success());
        assert!((session.progress_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clean_chunks_for_reuse() {
        let mut session = sample_session(4);

        // 1: 已成功，2: 出错，3: 在途，4: 已移交后台
        session.chunk_tasks[0].chunk = Some(ok_receipt(1, MIB));
        session.chunk_tasks[1].error = Some(UploadError::Network("x".to_string()));
        session.chunk_tasks[2].task_identifier = Some("req".to_string());
        session.chunk_tasks[3].background_task_id = Some("bg-1".to_string());

        session.clean_chunks_for_reuse();

        // 成功分片不动
        assert!(session.chunk_tasks[0].done_uploading_success());
        // 出错分片被清理进入重试
        assert!(!session.chunk_tasks[1].done_uploading());
        assert!(session.chunk_tasks[1].error.is_none());
        // 在途标识被清空
        assert!(session.chunk_tasks[2].task_identifier.is_none());
        // 后台分片保持调度状态，恢复时跳过重新提交
        assert_eq!(
            session.chunk_tasks[3].background_task_id.as_deref(),
            Some("bg-1")
        );
        assert!(session.chunk_tasks[3].is_scheduled());
    }
}
