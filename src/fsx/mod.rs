//! 本地文件系统访问
//!
//! 上传引擎只通过本模块接触文件系统：
//! - 可读性检查与元数据查询（大小、创建/修改时间）
//! - 按字节区间读取文件内容（分片切割）
//! - 分片暂存：把分片字节写入暂存目录并计算 SHA-256
//!
//! 来源文件有两种形态：本地路径，或平台相册资产。
//! 资产在切片前必须先通过 `SourceResolver` 解析为可读的本地路径。

use crate::errors::{UploadError, UploadResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// 上传来源
///
/// 本地文件直接给出路径；平台资产（如系统相册）只持有不透明标识，
/// 切片前需要解析为具体路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FileSource {
    /// 本地文件路径
    LocalFile(PathBuf),
    /// 平台资产标识（不透明字符串）
    PlatformAsset(String),
}

/// 平台资产解析器
///
/// 由宿主平台实现，把资产标识解析为可读取的本地文件路径
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// 解析资产标识，返回本地路径
    async fn resolve(&self, asset_id: &str) -> UploadResult<PathBuf>;
}

/// 文件时间元数据（Unix 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    /// 创建时间（平台不支持时为 0）
    pub created_secs: i64,
    /// 修改时间
    pub modified_secs: i64,
}

/// 检查文件存在且可读
pub fn is_readable_file(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}

/// 查询文件大小（字节）
pub fn file_size(path: &Path) -> UploadResult<u64> {
    let metadata = std::fs::metadata(path)?;
    Ok(metadata.len())
}

/// 查询文件创建/修改时间
pub fn file_times(path: &Path) -> UploadResult<FileTimes> {
    let metadata = std::fs::metadata(path)?;

    let modified_secs = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    // created() 在部分文件系统上不可用，回退为 0
    let created_secs = metadata
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(FileTimes {
        created_secs,
        modified_secs,
    })
}

/// 按闭区间 [lower, upper] 读取文件字节
///
/// 区间为字节下标，两端都包含
pub async fn read_range(path: &Path, lower: u64, upper: u64) -> UploadResult<Vec<u8>> {
    let path = path.to_path_buf();
    let size = (upper - lower + 1) as usize;

    let buffer = tokio::task::spawn_blocking(move || -> UploadResult<Vec<u8>> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(lower))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    })
    .await
    .map_err(|e| UploadError::Local(format!("读取任务异常: {}", e)))??;

    Ok(buffer)
}

/// 计算字节内容的 SHA-256（十六进制小写）
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 分片暂存器
///
/// 每个会话使用独立的暂存目录，目录名由文件 ID 和会话令牌哈希而来，
/// 避免特殊字符破坏路径
#[derive(Debug, Clone)]
pub struct ChunkStaging {
    /// 暂存根目录
    base_dir: PathBuf,
}

impl ChunkStaging {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// 会话暂存目录
    pub fn session_dir(&self, file_id: &str, session_token: &str) -> PathBuf {
        let dir_name = format!(
            "{}_{}",
            sha256_hex(file_id.as_bytes()),
            sha256_hex(session_token.as_bytes())
        );
        self.base_dir.join(dir_name)
    }

    /// 暂存一个分片，返回 (分片文件路径, SHA-256)
    pub async fn stage_chunk(
        &self,
        file_id: &str,
        session_token: &str,
        chunk_number: i64,
        data: &[u8],
    ) -> UploadResult<(PathBuf, String)> {
        let dir = self.session_dir(file_id, session_token);
        tokio::fs::create_dir_all(&dir).await?;

        let hash = sha256_hex(data);
        // 文件名同样哈希化，保持简短且路径安全
        let name = sha256_hex(format!("upload_{}_{}_{}", file_id, hash, chunk_number).as_bytes());
        let path = dir.join(format!("{}.part", name));

        tokio::fs::write(&path, data).await?;
        debug!(
            "分片已暂存: number={}, size={}, path={:?}",
            chunk_number,
            data.len(),
            path
        );

        Ok((path, hash))
    }

    /// 删除单个暂存分片
    pub async fn remove_chunk(&self, path: &Path) {
        let _ = tokio::fs::remove_file(path).await;
    }

    /// 删除整个会话的暂存目录
    pub async fn remove_session(&self, file_id: &str, session_token: &str) {
        let dir = self.session_dir(file_id, session_token);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
