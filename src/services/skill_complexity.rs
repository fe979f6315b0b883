//! 技能复杂度查询（轻量 / 重量执行）
//!
//! 带 TTL 的整表缓存；查询本身失败或技能未知时一律按 heavy 处理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::ServiceError;
use crate::config::CacheSection;
use crate::orchestration::ExecutionType;

/// 技能复杂度数据源：返回 技能名 -> 执行类型 的完整表
#[async_trait]
pub trait SkillComplexitySource: Send + Sync {
    async fn fetch_all(&self) -> Result<HashMap<String, ExecutionType>, ServiceError>;
}

/// 固定表（配置 / 测试）
#[derive(Debug, Clone, Default)]
pub struct StaticSkillComplexity {
    table: HashMap<String, ExecutionType>,
}

impl StaticSkillComplexity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, skill: impl Into<String>, execution_type: ExecutionType) -> Self {
        self.table.insert(skill.into(), execution_type);
        self
    }
}

#[async_trait]
impl SkillComplexitySource for StaticSkillComplexity {
    async fn fetch_all(&self) -> Result<HashMap<String, ExecutionType>, ServiceError> {
        Ok(self.table.clone())
    }
}

struct Snapshot {
    table: HashMap<String, ExecutionType>,
    fetched_at: Instant,
}

/// 技能复杂度缓存
pub struct SkillComplexityCache {
    source: Option<Arc<dyn SkillComplexitySource>>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SkillComplexityCache {
    pub fn new(source: Arc<dyn SkillComplexitySource>, ttl: Duration) -> Self {
        Self {
            source: Some(source),
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// TTL 取自 [cache] skill_complexity_ttl_secs
    pub fn from_config(source: Arc<dyn SkillComplexitySource>, section: &CacheSection) -> Self {
        Self::new(source, Duration::from_secs(section.skill_complexity_ttl_secs))
    }

    /// 无数据源：所有技能都按 heavy 执行
    pub fn disabled() -> Self {
        Self {
            source: None,
            ttl: Duration::ZERO,
            snapshot: RwLock::new(None),
        }
    }

    /// 查询技能的执行类型；无技能名、未知技能或查询失败时返回 Heavy
    pub async fn execution_type(&self, skill_name: Option<&str>) -> ExecutionType {
        let Some(skill) = skill_name else {
            return ExecutionType::Heavy;
        };
        match self.current().await {
            Some(snapshot) => snapshot.table.get(skill).copied().unwrap_or(ExecutionType::Heavy),
            None => ExecutionType::Heavy,
        }
    }

    async fn current(&self) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Some(Arc::clone(snapshot));
            }
        }

        let source = self.source.as_ref()?;
        match source.fetch_all().await {
            Ok(table) => {
                let snapshot = Arc::new(Snapshot {
                    table,
                    fetched_at: Instant::now(),
                });
                *self.snapshot.write().await = Some(Arc::clone(&snapshot));
                Some(snapshot)
            }
            Err(e) => {
                tracing::warn!("Skill complexity lookup failed, defaulting to heavy: {}", e);
                None
            }
        }
    }

    pub async fn reset(&self) {
        *self.snapshot.write().await = None;
    }
}
