// Drive Upload Rust Library
// 移动端云盘客户端的可断点续传分片上传引擎核心库

// 远端对象存储接口模块
pub mod api;

// 进程挂起与后台传输改派模块
pub mod background;

// 配置管理模块
pub mod config;

// 错误类型模块
pub mod errors;

// 事件发布模块
pub mod events;

// 本地文件系统访问模块
pub mod fsx;

// 日志模块
pub mod logging;

// 网络状态监听模块
pub mod network;

// 持久化存储模块
pub mod store;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use api::{ConflictPolicy, DriveApiClient, RemoteFile, RemoteStore, TokenProvider};
pub use background::{BackgroundTransport, ExpiringActivity};
pub use config::AppConfig;
pub use errors::{UploadError, UploadResult};
pub use events::{EventBus, UploadEvent};
pub use fsx::{FileSource, SourceResolver};
pub use network::{NetworkMonitor, NetworkStatus};
pub use store::{FileStore, MemoryStore, UploadRecord, UploadStore};
pub use uploader::{
    OperationState, ParallelismController, SuspensionGate, UploadContext, UploadFile,
    UploadOperation, UploadPriority, UploadQueue,
};
