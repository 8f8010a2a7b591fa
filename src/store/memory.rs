// 内存存储实现（测试用）

use crate::errors::UploadResult;
use crate::store::{UploadRecord, UploadStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// 内存上传记录存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, UploadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录数
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn save(&self, record: &UploadRecord) -> UploadResult<()> {
        self.records
            .write()
            .insert(record.file.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, file_id: &str) -> UploadResult<Option<UploadRecord>> {
        Ok(self.records.read().get(file_id).cloned())
    }

    async fn delete(&self, file_id: &str) -> UploadResult<()> {
        self.records.write().remove(file_id);
        Ok(())
    }

    async fn load_all(&self) -> UploadResult<Vec<UploadRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsx::FileSource;
    use crate::uploader::file::UploadFile;
    use std::path::PathBuf;

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
    async fn test_save_load_delete() {
        let store = MemoryStore::new();
        let record = sample_record("a.bin");
        let id = record.file.id.clone();

        assert!(store.load(&id).await.unwrap().is_none());

        store.save(&record).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.file.name, "a.bin");

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryStore::new();
        let mut record = sample_record("a.bin");
        store.save(&record).await.unwrap();

        record.file.mark_uploaded(42);
        store.save(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(&record.file.id).await.unwrap().unwrap();
        assert_eq!(loaded.file.remote_file_id, Some(42));
    }

    #[tokio::test]
    async fn test_load_all() {
        let store = MemoryStore::new();
        store.save(&sample_record("a")).await.unwrap();
        store.save(&sample_record("b")).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
