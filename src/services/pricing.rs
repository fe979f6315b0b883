//! 模型价格表
//!
//! 带 TTL 的整表缓存。数据源失败时依次回退到离线磁盘副本、内置价格表；
//! 成功拉取后在后台刷新磁盘副本（失败只记日志）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::ServiceError;
use crate::config::CacheSection;
use crate::orchestration::ExecutionType;

/// 轻量执行未指明模型时的计价模型
pub const DEFAULT_LIGHT_MODEL: &str = "claude-3-5-haiku";
/// 重量执行未指明模型时的计价模型
pub const DEFAULT_HEAVY_MODEL: &str = "claude-sonnet-4";

/// 每百万 token 价格（美元）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    pub input_price_per_m_tok: f64,
    pub output_price_per_m_tok: f64,
}

impl ModelPrice {
    pub const fn new(input: f64, output: f64) -> Self {
        Self {
            input_price_per_m_tok: input,
            output_price_per_m_tok: output,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_price_per_m_tok
            + output_tokens as f64 * self.output_price_per_m_tok)
            / 1_000_000.0
    }
}

/// modelId -> 价格
pub type PricingTable = HashMap<String, ModelPrice>;

/// 内置价格表
pub fn fallback_table() -> PricingTable {
    HashMap::from([
        (DEFAULT_LIGHT_MODEL.to_string(), ModelPrice::new(0.8, 4.0)),
        (DEFAULT_HEAVY_MODEL.to_string(), ModelPrice::new(3.0, 15.0)),
        ("claude-opus-4".to_string(), ModelPrice::new(15.0, 75.0)),
    ])
}

/// 价格数据源
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn fetch(&self) -> Result<PricingTable, ServiceError>;
}

/// 从 HTTP 端点拉取 JSON 价格表
pub struct HttpPricingSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPricingSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PricingSource for HttpPricingSource {
    async fn fetch(&self) -> Result<PricingTable, ServiceError> {
        let table = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<PricingTable>()
            .await?;
        if table.is_empty() {
            return Err(ServiceError::Unavailable("empty pricing table".to_string()));
        }
        Ok(table)
    }
}

struct Snapshot {
    table: Arc<PricingTable>,
    fetched_at: Instant,
}

/// 价格缓存
pub struct PricingCache {
    source: Option<Arc<dyn PricingSource>>,
    ttl: Duration,
    disk_path: Option<PathBuf>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl PricingCache {
    pub fn new(source: Option<Arc<dyn PricingSource>>, ttl: Duration, disk_path: Option<PathBuf>) -> Self {
        Self {
            source,
            ttl,
            disk_path,
            snapshot: RwLock::new(None),
        }
    }

    /// 只用内置价格表
    pub fn fallback_only() -> Self {
        Self::new(None, Duration::from_secs(3600), None)
    }

    /// 按 [cache] 配置构建；配置了 pricing_url 时使用 HTTP 数据源
    pub fn from_config(section: &CacheSection) -> Result<Self, ServiceError> {
        let source: Option<Arc<dyn PricingSource>> = match &section.pricing_url {
            Some(url) => Some(Arc::new(HttpPricingSource::new(url.clone(), Duration::from_secs(10))?)),
            None => None,
        };
        Ok(Self::new(
            source,
            Duration::from_secs(section.pricing_ttl_secs),
            section.pricing_disk_path.clone(),
        ))
    }

    /// 当前价格表（过期时刷新）
    pub async fn table(&self) -> Arc<PricingTable> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Arc::clone(&snapshot.table);
            }
        }

        let table = Arc::new(self.refresh().await);
        *self.snapshot.write().await = Some(Snapshot {
            table: Arc::clone(&table),
            fetched_at: Instant::now(),
        });
        table
    }

    async fn refresh(&self) -> PricingTable {
        if let Some(source) = &self.source {
            match source.fetch().await {
                Ok(table) => {
                    self.spawn_disk_write(&table);
                    return table;
                }
                Err(e) => tracing::warn!("Pricing fetch failed, trying offline copy: {}", e),
            }
        }

        if let Some(path) = &self.disk_path {
            match tokio::fs::read_to_string(path).await {
                Ok(data) => match serde_json::from_str::<PricingTable>(&data) {
                    Ok(table) if !table.is_empty() => return table,
                    Ok(_) => tracing::warn!(path = ?path, "Offline pricing copy is empty"),
                    Err(e) => tracing::warn!(path = ?path, "Offline pricing copy unreadable: {}", e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?path, "Offline pricing copy unreadable: {}", e),
            }
        }

        fallback_table()
    }

    fn spawn_disk_write(&self, table: &PricingTable) {
        let Some(path) = self.disk_path.clone() else {
            return;
        };
        let json = match serde_json::to_string_pretty(table) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize pricing table: {}", e);
                return;
            }
        };
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let tmp = path.with_extension("json.tmp");
            let result = match tokio::fs::write(&tmp, json).await {
                Ok(()) => tokio::fs::rename(&tmp, &path).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(path = ?path, "Failed to write offline pricing copy: {}", e);
            }
        });
    }

    /// 计算一次调用的成本；未知模型按执行类型的默认模型计价
    pub async fn cost_for(
        &self,
        model: Option<&str>,
        execution_type: ExecutionType,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let table = self.table().await;
        let default_model = match execution_type {
            ExecutionType::Light => DEFAULT_LIGHT_MODEL,
            ExecutionType::Heavy => DEFAULT_HEAVY_MODEL,
        };
        let price = model
            .and_then(|m| table.get(m))
            .or_else(|| table.get(default_model))
            .copied()
            .or_else(|| fallback_table().get(default_model).copied())
            .unwrap_or(ModelPrice::new(3.0, 15.0));
        price.cost(input_tokens, output_tokens)
    }

    pub async fn reset(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakySource {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PricingSource for FlakySource {
        async fn fetch(&self) -> Result<PricingTable, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ServiceError::Unavailable("pricing api down".to_string()));
            }
            Ok(HashMap::from([("m1".to_string(), ModelPrice::new(1.0, 2.0))]))
        }
    }

    #[test]
    fn test_price_cost() {
        let price = ModelPrice::new(3.0, 15.0);
        assert!((price.cost(1_000_000, 0) - 3.0).abs() < 1e-9);
        assert!((price.cost(1000, 1000) - 0.018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_only() {
        let cache = PricingCache::fallback_only();
        let cost = cache.cost_for(None, ExecutionType::Heavy, 1_000_000, 0).await;
        assert!((cost - 3.0).abs() < 1e-9);
        let light = cache.cost_for(Some("unknown"), ExecutionType::Light, 1_000_000, 0).await;
        assert!((light - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cached_and_offline_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let disk = dir.path().join("pricing.json");
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let cache = PricingCache::new(Some(source.clone()), Duration::from_secs(60), Some(disk.clone()));

        let cost = cache.cost_for(Some("m1"), ExecutionType::Heavy, 1_000_000, 1_000_000).await;
        assert!((cost - 3.0).abs() < 1e-9);
        cache.table().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // 等待后台写盘
        for _ in 0..200 {
            if disk.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disk.exists());

        source.fail.store(true, Ordering::SeqCst);
        cache.reset().await;
        let table = cache.table().await;
        assert!(table.contains_key("m1"), "offline copy should be used");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
