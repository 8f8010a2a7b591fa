// 上传引擎模块
//
// 可断点续传的分片上传核心：
// - 队列协调与去重（UploadQueue / OperationRegistry）
// - 单文件状态机（UploadOperation）
// - 会话与分片的持久化模型（SessionTask / ChunkTask）
// - 设备感知的并行度控制（ParallelismController）

pub mod file;
pub mod operation;
pub mod parallelism;
pub mod queue;
pub mod range;
pub mod registry;
pub mod session;

pub use file::{UploadFile, UploadPriority, DEFAULT_MAX_RETRY_COUNT};
pub use operation::{
    OperationOutcome, OperationState, UploadContext, UploadOperation,
};
pub use parallelism::{ParallelismController, OPERATION_CHUNK_PARALLELISM, REDUCED_PARALLELISM};
pub use queue::{SuspensionGate, UploadQueue};
pub use range::{
    build_ranges, build_ranges_with_chunk_size, preferred_chunk_size, ChunkRange, CHUNK_MAX_SIZE,
    CHUNK_MIN_SIZE, FILE_MAX_SIZE, MAX_TOTAL_CHUNKS, OPTIMAL_CHUNK_COUNT,
};
pub use registry::OperationRegistry;
pub use session::{ChunkTask, FileIdentity, SessionTask, SESSION_LIFETIME_SECS};
