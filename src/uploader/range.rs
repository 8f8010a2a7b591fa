// 文件分片区间计算
//
// 分片规则：
// - 首选分片大小 = 文件大小 / 目标分片数，夹在 [1MB, 50MB] 区间内
// - 区间为闭区间 [lower, upper]，连续、不重叠、完整覆盖文件
// - 单文件分片数上限 10000，超出可上传上限的文件直接拒绝

use crate::errors::{UploadError, UploadResult};
use serde::{Deserialize, Serialize};

/// 最小分片大小: 1MB
pub const CHUNK_MIN_SIZE: u64 = 1024 * 1024;

/// 最大分片大小: 50MB（客户端侧上限）
pub const CHUNK_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// 目标分片数量（用于计算首选分片大小）
pub const OPTIMAL_CHUNK_COUNT: u64 = 200;

/// 单文件分片数量上限
pub const MAX_TOTAL_CHUNKS: u64 = 10_000;

/// 单文件大小上限
pub const FILE_MAX_SIZE: u64 = MAX_TOTAL_CHUNKS * CHUNK_MAX_SIZE;

/// 分片字节区间（闭区间，两端包含）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// 起始字节下标
    pub lower: u64,
    /// 结束字节下标（包含）
    pub upper: u64,
}

impl ChunkRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// 区间字节数
    pub fn size(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

/// 计算首选分片大小
///
/// 以 200 个分片为目标，夹在允许范围内
pub fn preferred_chunk_size(file_size: u64) -> u64 {
    (file_size / OPTIMAL_CHUNK_COUNT).clamp(CHUNK_MIN_SIZE, CHUNK_MAX_SIZE)
}

/// 计算文件的全部分片区间
///
/// # 错误
/// - 空文件无法分片
/// - 超出单文件大小上限的文件被拒绝
pub fn build_ranges(file_size: u64) -> UploadResult<Vec<ChunkRange>> {
    build_ranges_with_chunk_size(file_size, preferred_chunk_size(file_size))
}

/// 用指定分片大小计算分片区间
pub fn build_ranges_with_chunk_size(
    file_size: u64,
    chunk_size: u64,
) -> UploadResult<Vec<ChunkRange>> {
    if file_size == 0 {
        return Err(UploadError::Local("空文件无法分片上传".to_string()));
    }
    if file_size > FILE_MAX_SIZE {
        return Err(UploadError::FileTooLarge {
            size: file_size,
            limit: FILE_MAX_SIZE,
        });
    }

    let chunk_size = chunk_size.clamp(CHUNK_MIN_SIZE, CHUNK_MAX_SIZE);

    let mut ranges = Vec::new();
    let mut offset = 0u64;
    while offset < file_size {
        let end = std::cmp::min(offset + chunk_size, file_size);
        ranges.push(ChunkRange::new(offset, end - 1));
        offset = end;
    }

    Ok(ranges)
}
