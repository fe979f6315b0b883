//! 执行计划存储（尽力而为）
//!
//! 引擎在执行前 `create`、执行后 `complete`；任何一步失败都只记日志，不影响执行结果。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use super::ServiceError;
use crate::orchestration::{ArtifactStore, Plan, PlanId};

/// 计划最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Completed,
    Failed,
}

#[async_trait]
pub trait ExecutionPlanStore: Send + Sync {
    /// 登记计划；存储不分配 ID 时返回 None
    async fn create(&self, plan: &Plan) -> Result<Option<PlanId>, ServiceError>;

    async fn complete(
        &self,
        plan_id: &str,
        artifacts: &ArtifactStore,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<(), ServiceError>;
}

/// 已登记的计划
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPlan {
    pub plan: Plan,
    pub status: Option<PlanStatus>,
    pub total_cost_usd: f64,
    pub error: Option<String>,
}

/// 内存实现
#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<HashMap<PlanId, StoredPlan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, plan_id: &str) -> Option<StoredPlan> {
        self.plans.read().await.get(plan_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }
}

#[async_trait]
impl ExecutionPlanStore for InMemoryPlanStore {
    async fn create(&self, plan: &Plan) -> Result<Option<PlanId>, ServiceError> {
        self.plans.write().await.insert(
            plan.id.clone(),
            StoredPlan {
                plan: plan.clone(),
                status: None,
                total_cost_usd: 0.0,
                error: None,
            },
        );
        Ok(Some(plan.id.clone()))
    }

    async fn complete(
        &self,
        plan_id: &str,
        artifacts: &ArtifactStore,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut plans = self.plans.write().await;
        let stored = plans
            .get_mut(plan_id)
            .ok_or_else(|| ServiceError::Unavailable(format!("unknown plan {plan_id}")))?;
        stored.status = Some(status);
        stored.total_cost_usd = artifacts.total_cost_usd;
        stored.error = error.map(str::to_string);
        Ok(())
    }
}
