//! 外部协作者：只读配置服务（技能复杂度、模型价格）、执行计划存储、提示词构建与输出清洗
//!
//! 缓存以整体替换快照的方式刷新，并发读无需细粒度锁；测试可用 `reset()` 清空。

pub mod cleaner;
pub mod plan_store;
pub mod pricing;
pub mod prompt;
pub mod skill_complexity;

use thiserror::Error;

pub use cleaner::{OutputCleaner, TagStripper};
pub use plan_store::{ExecutionPlanStore, InMemoryPlanStore, PlanStatus, StoredPlan};
pub use pricing::{HttpPricingSource, ModelPrice, PricingCache, PricingSource, PricingTable};
pub use prompt::{DefaultPromptBuilder, PromptBuilder};
pub use skill_complexity::{SkillComplexityCache, SkillComplexitySource, StaticSkillComplexity};

/// 外部服务错误
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}
