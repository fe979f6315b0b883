//! 检查点持久化后端
//!
//! 统一的键值接口（值为 JSON 文本），三种实现：内存、每键一个 JSON 文件、SQLite 表。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;

use super::CheckpointError;
use crate::config::{CheckpointBackend, CheckpointSection};

/// 持久化键值存储（跨重启的权威来源）
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError>;
    async fn set(&self, key: &str, value: String) -> Result<(), CheckpointError>;
    async fn delete(&self, key: &str) -> Result<(), CheckpointError>;
}

/// 按配置打开持久化后端
pub fn open_durable_store(section: &CheckpointSection) -> Result<Arc<dyn DurableStore>, CheckpointError> {
    let store: Arc<dyn DurableStore> = match section.backend {
        CheckpointBackend::Memory => Arc::new(MemoryDurableStore::new()),
        CheckpointBackend::File => Arc::new(FileDurableStore::new(&section.path)),
        CheckpointBackend::Sqlite => Arc::new(SqliteDurableStore::open(&section.path)?),
    };
    tracing::info!(backend = ?section.backend, path = ?section.path, "Checkpoint store opened");
    Ok(store)
}

/// 内存实现（测试 / 单进程）
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CheckpointError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// 文件实现：目录下每个键一个 `<key>.json`；先写临时文件再 rename。
/// 文件名中字母数字与 `-` 原样保留，其余字节编码为 `_xx`，不同的键不会落到同一文件
#[derive(Debug)]
pub struct FileDurableStore {
    dir: PathBuf,
}

impl FileDurableStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(byte as char);
            } else {
                file_name.push_str(&format!("_{byte:02x}"));
            }
        }
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// SQLite 实现：单表键值；同步连接放在 spawn_blocking 中使用
pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDurableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoint_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| CheckpointError::Poisoned)?;
            f(&guard).map_err(CheckpointError::from)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))?
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM checkpoint_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CheckpointError> {
        let key = key.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoint_kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM checkpoint_kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise(store: &dyn DurableStore) {
        assert_eq!(store.get("pipeline_checkpoint:a").await.unwrap(), None);
        store.set("pipeline_checkpoint:a", r#"{"v":1}"#.to_string()).await.unwrap();
        store.set("pipeline_checkpoint:a", r#"{"v":2}"#.to_string()).await.unwrap();
        assert_eq!(
            store.get("pipeline_checkpoint:a").await.unwrap().as_deref(),
            Some(r#"{"v":2}"#)
        );
        store.delete("pipeline_checkpoint:a").await.unwrap();
        assert_eq!(store.get("pipeline_checkpoint:a").await.unwrap(), None);
        // 删除不存在的键不是错误
        store.delete("pipeline_checkpoint:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryDurableStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileDurableStore::new(dir.path().join("checkpoints"));
        exercise(&store).await;
        assert!(store
            .path_for("pipeline_checkpoint:x/../y")
            .starts_with(dir.path().join("checkpoints")));
    }

    #[tokio::test]
    async fn test_file_store_keeps_similar_keys_apart() {
        let dir = TempDir::new().unwrap();
        let store = FileDurableStore::new(dir.path());
        assert_ne!(store.path_for("pipeline_checkpoint:a:b"), store.path_for("pipeline_checkpoint:a_b"));

        store.set("pipeline_checkpoint:a:b", "colon".to_string()).await.unwrap();
        store.set("pipeline_checkpoint:a_b", "underscore".to_string()).await.unwrap();
        assert_eq!(
            store.get("pipeline_checkpoint:a:b").await.unwrap().as_deref(),
            Some("colon")
        );
        assert_eq!(
            store.get("pipeline_checkpoint:a_b").await.unwrap().as_deref(),
            Some("underscore")
        );
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        exercise(&SqliteDurableStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.db");
        {
            let store = SqliteDurableStore::open(&path).unwrap();
            store.set("k", "v".to_string()).await.unwrap();
        }
        let store = SqliteDurableStore::open(&path).unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
