// JSON 文件存储实现
//
// 每条上传记录对应一个 .meta 文件（JSON 格式），
// 文件名取记录 ID 的 SHA-256，避免资产标识中的特殊字符破坏路径。
// 写入先落临时文件再重命名，单条记录的更新是原子的

use crate::errors::{UploadError, UploadResult};
use crate::fsx::sha256_hex;
use crate::store::{UploadRecord, UploadStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// 记录文件扩展名
const META_EXTENSION: &str = "meta";

/// JSON 文件上传记录存储
#[derive(Debug, Clone)]
pub struct FileStore {
    /// 记录保存目录
    base_dir: PathBuf,
}

impl FileStore {
    /// 创建存储，确保目录存在
    pub async fn new(base_dir: PathBuf) -> UploadResult<Self> {
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// 记录文件路径
    fn record_path(&self, file_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", sha256_hex(file_id.as_bytes()), META_EXTENSION))
    }

    /// 读取并解析一个记录文件
    async fn read_record(path: &Path) -> UploadResult<UploadRecord> {
        let content = fs::read_to_string(path).await?;
        let record: UploadRecord = serde_json::from_str(&content)?;
        Ok(record)
    }
}

#[async_trait]
impl UploadStore for FileStore {
    async fn save(&self, record: &UploadRecord) -> UploadResult<()> {
        let path = self.record_path(&record.file.id);
        let tmp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("记录已保存: file_id={}, path={:?}", record.file.id, path);
        Ok(())
    }

    async fn load(&self, file_id: &str) -> UploadResult<Option<UploadRecord>> {
        let path = self.record_path(file_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_record(&path).await?))
    }

    async fn delete(&self, file_id: &str) -> UploadResult<()> {
        let path = self.record_path(file_id);
        match fs::remove_file(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::from(e)),
        }
    }

    async fn load_all(&self) -> UploadResult<Vec<UploadRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_meta = path
                .extension()
                .map(|ext| ext == META_EXTENSION)
                .unwrap_or(false);
            if !is_meta {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    // 单个损坏的记录不阻断整体恢复扫描
                    warn!("跳过损坏的记录文件: {:?}, 错误: {}", path, e);
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsx::FileSource;
    use crate::uploader::file::UploadFile;
    use crate::uploader::range::build_ranges_with_chunk_size;
    use crate::uploader::session::{FileIdentity, SessionTask};
    use crate::fsx::FileTimes;

    fn sample_record(name: &str) -> UploadRecord {
        UploadRecord::new(UploadFile::new(
            FileSource::LocalFile(PathBuf::from(format!("/tmp/{}", name))),
            name.to_string(),
            1,
            100,
            1,
        ))
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_with_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).await.unwrap();

        let mut record = sample_record("a.bin");
        let ranges = build_ranges_with_chunk_size(3 * 1024 * 1024, 1024 * 1024).unwrap();
        record.session = Some(SessionTask::new(
            "token-xyz".to_string(),
            PathBuf::from("/tmp/a.bin"),
            FileIdentity::from_times(&FileTimes {
                created_secs: 1,
                modified_secs: 2,
            }),
            &ranges,
        ));
        store.save(&record).await.unwrap();

        let loaded = store.load(&record.file.id).await.unwrap().unwrap();
        let session = loaded.session.unwrap();
        assert_eq!(session.token, "token-xyz");
        assert_eq!(session.chunk_tasks.len(), 3);
        assert_eq!(session.chunk_tasks[0].chunk_number, 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).await.unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).await.unwrap();

        let record = sample_record("a.bin");
        store.save(&record).await.unwrap();
        store.delete(&record.file.id).await.unwrap();
        assert!(store.load(&record.file.id).await.unwrap().is_none());

        // 再次删除不报错
        store.delete(&record.file.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).await.unwrap();

        store.save(&sample_record("a.bin")).await.unwrap();
        store.save(&sample_record("b.bin")).await.unwrap();

        // 写入一个损坏的记录文件和一个无关文件
        std::fs::write(dir.path().join("broken.meta"), b"not json").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"x").unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_unusual_file_id_is_path_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).await.unwrap();

        // 资产标识可能携带路径分隔符
        let mut record = sample_record("a.bin");
        record.file.id = "asset-AB12/L0/001".to_string();
        store.save(&record).await.unwrap();

        let loaded = store.load("asset-AB12/L0/001").await.unwrap().unwrap();
        assert_eq!(loaded.file.name, "a.bin");
    }
}
