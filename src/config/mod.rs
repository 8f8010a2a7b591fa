// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 网络策略配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 持久化配置
    #[serde(default)]
    pub store: StoreConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数（0 表示由并行度控制器决定）
    #[serde(default)]
    pub max_concurrent_operations: usize,
    /// 单文件最大并发分片请求数
    #[serde(default = "default_chunk_parallelism")]
    pub chunk_parallelism: usize,
    /// 单文件重试预算
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 分片上传请求超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// 分片暂存目录（默认在持久化目录下的 chunks/）
    #[serde(default)]
    pub chunk_dir: Option<PathBuf>,
}

fn default_chunk_parallelism() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_timeout_secs() -> u64 {
    120
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 0,
            chunk_parallelism: default_chunk_parallelism(),
            max_retries: default_max_retries(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            chunk_dir: None,
        }
    }
}

/// 网络策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 仅在 Wi-Fi 下上传（蜂窝网络时挂起队列）
    #[serde(default)]
    pub wifi_only: bool,
    /// 远端 API 基础地址
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_api_base_url() -> String {
    "https://api.drive.example.com/3".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_only: false,
            api_base_url: default_api_base_url(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 上传记录保存目录
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("uploads")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置
    ///
    /// 文件不存在时返回默认配置
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}
