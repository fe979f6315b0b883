//! 编排引擎
//!
//! 入口：校验并截断计划、登记执行计划、按执行模式一次性分派到对应 Runner，
//! 最后回写计划状态。计划存储、账本、检查点写入的失败都不影响执行结果。

use std::sync::Arc;

use super::critic_loop::CriticLoopRunner;
use super::executor::{ExecutionServices, RetryingStepExecutor, StepExecutor};
use super::fan_out::FanOutRunner;
use super::pipeline::PipelineRunner;
use super::types::{ArtifactStore, ExecutionLimits, ExecutionMode, ExecutionResult, Plan, PlanId, MAX_PIPELINE_DEPTH};
use crate::checkpoint::{CheckpointStore, ResumeStatus};
use crate::config::AppConfig;
use crate::core::OrchestrationError;
use crate::ledger::{Ledger, TracingLedger};
use crate::retry::{RetryOptions, RetryPolicy};
use crate::services::{
    ExecutionPlanStore, OutputCleaner, PlanStatus, PricingCache, PromptBuilder, SkillComplexityCache,
};

/// 编排引擎
pub struct OrchestrationEngine {
    services: ExecutionServices,
    plan_store: Option<Arc<dyn ExecutionPlanStore>>,
}

impl OrchestrationEngine {
    /// 以默认协作者创建（内置价格表、全部按 heavy、无检查点）
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            services: ExecutionServices::new(executor),
            plan_store: None,
        }
    }

    /// 按配置创建：执行器外包一层分类重试，账本写入 tracing，检查点与价格缓存按配置打开
    pub fn from_config(executor: Arc<dyn StepExecutor>, config: &AppConfig) -> Result<Self, OrchestrationError> {
        let ledger: Arc<dyn Ledger> = Arc::new(TracingLedger);
        let retrying = RetryingStepExecutor::new(
            executor,
            RetryOptions::new("step_executor")
                .with_policy(RetryPolicy::from(&config.retry))
                .with_ledger(Arc::clone(&ledger)),
        );
        let checkpoints = CheckpointStore::from_config(&config.checkpoint)?;
        let pricing = PricingCache::from_config(&config.cache)?;

        Ok(Self::new(Arc::new(retrying))
            .with_limits(ExecutionLimits::from(&config.orchestration))
            .with_pricing(Arc::new(pricing))
            .with_checkpoints(Arc::new(checkpoints))
            .with_ledger(ledger))
    }

    /// 深度与评审轮数超出硬上限时被截到上限
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.services.limits = limits.clamped();
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.services.checkpoints = Some(store);
        self
    }

    pub fn with_plan_store(mut self, store: Arc<dyn ExecutionPlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.services.ledger = Some(ledger);
        self
    }

    /// 心跳：参数为（已完成步骤数，总步骤数）
    pub fn with_heartbeat<F>(mut self, heartbeat: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.services.heartbeat = Some(Arc::new(heartbeat));
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn OutputCleaner>) -> Self {
        self.services.cleaner = cleaner;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.services.prompts = prompts;
        self
    }

    pub fn with_skill_complexity(mut self, skills: Arc<SkillComplexityCache>) -> Self {
        self.services.skills = skills;
        self
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingCache>) -> Self {
        self.services.pricing = pricing;
        self
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.services.limits
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointStore>> {
        self.services.checkpoints.as_ref()
    }

    /// 执行计划
    pub async fn execute(&self, mut plan: Plan) -> Result<ExecutionResult, OrchestrationError> {
        if plan.steps.is_empty() {
            return Err(OrchestrationError::EmptyPlan);
        }

        let max_depth = self.services.limits.max_pipeline_depth.clamp(1, MAX_PIPELINE_DEPTH);
        if plan.steps.len() > max_depth {
            tracing::warn!(
                plan_id = %plan.id,
                requested = plan.steps.len(),
                max_depth,
                "Plan exceeds max depth, truncating"
            );
            plan.steps.truncate(max_depth);
        }

        tracing::info!(
            plan_id = %plan.id,
            mode = %plan.mode,
            steps = plan.steps.len(),
            channel = %plan.channel,
            "Executing plan"
        );

        let plan_id = self.create_plan_record(&plan).await;

        let outcome = match plan.mode {
            ExecutionMode::Pipeline => PipelineRunner::new(&self.services)
                .run(&plan)
                .await
                .map_err(OrchestrationError::from),
            ExecutionMode::FanOut => FanOutRunner::new(&self.services).run(&plan).await,
            ExecutionMode::CriticLoop => CriticLoopRunner::new(&self.services)
                .run(&plan)
                .await
                .map_err(OrchestrationError::from),
        };

        match outcome {
            Ok(mut result) => {
                tracing::info!(
                    plan_id = %plan.id,
                    mode = %plan.mode,
                    steps = result.step_results.len(),
                    total_cost_usd = result.artifacts.total_cost_usd,
                    total_duration_ms = result.artifacts.total_duration_ms,
                    cost_truncated = result.cost_truncated,
                    "Plan completed"
                );
                self.complete_plan_record(plan_id.clone(), result.artifacts.clone(), PlanStatus::Completed, None);
                result.plan_id = plan_id;
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(plan_id = %plan.id, mode = %plan.mode, "Plan failed: {}", err);
                self.complete_plan_record(
                    plan_id,
                    ArtifactStore::new(plan.original_message.clone()),
                    PlanStatus::Failed,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// 从检查点续跑流水线
    pub async fn resume(&self, pipeline_id: &str) -> Result<ExecutionResult, OrchestrationError> {
        let status = self.can_resume(pipeline_id).await?;
        let checkpoint = match status {
            ResumeStatus {
                resumable: true,
                checkpoint: Some(checkpoint),
                ..
            } => checkpoint,
            _ => return Err(OrchestrationError::NotResumable(pipeline_id.to_string())),
        };

        let mut result = PipelineRunner::new(&self.services).resume(checkpoint).await?;
        result.plan_id = Some(pipeline_id.to_string());
        Ok(result)
    }

    pub async fn can_resume(&self, pipeline_id: &str) -> Result<ResumeStatus, OrchestrationError> {
        let Some(store) = &self.services.checkpoints else {
            return Err(OrchestrationError::NotResumable(pipeline_id.to_string()));
        };
        Ok(store.can_resume(pipeline_id).await?)
    }

    /// 放弃续跑：删除检查点
    pub async fn abandon(&self, pipeline_id: &str) -> Result<(), OrchestrationError> {
        if let Some(store) = &self.services.checkpoints {
            store.delete_checkpoint(pipeline_id).await?;
            tracing::info!(pipeline_id = %pipeline_id, "Checkpoint abandoned");
        }
        Ok(())
    }

    async fn create_plan_record(&self, plan: &Plan) -> Option<PlanId> {
        let store = self.plan_store.as_ref()?;
        match store.create(plan).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(plan_id = %plan.id, "Failed to record execution plan: {}", e);
                None
            }
        }
    }

    fn complete_plan_record(
        &self,
        plan_id: Option<PlanId>,
        artifacts: ArtifactStore,
        status: PlanStatus,
        error: Option<String>,
    ) {
        let (Some(store), Some(plan_id)) = (self.plan_store.clone(), plan_id) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = store.complete(&plan_id, &artifacts, status, error.as_deref()).await {
                tracing::warn!(plan_id = %plan_id, "Failed to complete execution plan: {}", e);
            }
        });
    }
}
