//! 串行流水线 Runner
//!
//! 每一步拿到上一步清洗后的输出作为上下文。超时在步骤之间检查（协作式），
//! 成本在每步完成后检查。挂了检查点存储时，每步成功后更新检查点，完成后删除。

use tokio::time::Instant;

use super::executor::{ExecutionServices, SharedContext, StepContext};
use super::types::{ArtifactStore, ExecutionMode, ExecutionResult, Plan};
use crate::checkpoint::PipelineCheckpoint;
use crate::core::PipelineStepError;

pub struct PipelineRunner<'a> {
    services: &'a ExecutionServices,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(services: &'a ExecutionServices) -> Self {
        Self { services }
    }

    pub async fn run(&self, plan: &Plan) -> Result<ExecutionResult, PipelineStepError> {
        let checkpoint = PipelineCheckpoint::new(
            plan.id.clone(),
            plan.original_message.clone(),
            plan.steps.clone(),
            plan.channel.clone(),
            plan.run_id.clone(),
        );
        self.run_from(plan, ArtifactStore::new(plan.original_message.clone()), checkpoint)
            .await
    }

    /// 从检查点继续：恢复已完成的步骤与累计值，从 next_step_index 开始
    pub async fn resume(&self, checkpoint: PipelineCheckpoint) -> Result<ExecutionResult, PipelineStepError> {
        let plan = Plan {
            id: checkpoint.pipeline_id.clone(),
            mode: ExecutionMode::Pipeline,
            steps: checkpoint.steps.clone(),
            original_message: checkpoint.original_message.clone(),
            channel: checkpoint.channel.clone(),
            run_id: checkpoint.run_id.clone(),
        };
        let artifacts = ArtifactStore::restore(
            checkpoint.original_message.clone(),
            checkpoint.completed_steps.clone(),
            checkpoint.artifact_totals,
        );
        tracing::info!(
            pipeline_id = %plan.id,
            next_step = checkpoint.next_step_index,
            total_steps = plan.steps.len(),
            "Resuming pipeline from checkpoint"
        );
        self.run_from(&plan, artifacts, checkpoint).await
    }

    async fn run_from(
        &self,
        plan: &Plan,
        mut artifacts: ArtifactStore,
        mut checkpoint: PipelineCheckpoint,
    ) -> Result<ExecutionResult, PipelineStepError> {
        let services = self.services;
        let limits = services.limits;
        let total = plan.steps.len();
        let started = Instant::now();
        let shared = SharedContext {
            channel: plan.channel.clone(),
            run_id: plan.run_id.clone(),
        };

        self.save(&checkpoint).await;

        let mut last_output: Option<String> = checkpoint.last_output.clone();
        for index in checkpoint.next_step_index..total {
            let step = &plan.steps[index];

            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms >= limits.max_pipeline_timeout_ms {
                tracing::warn!(
                    pipeline_id = %plan.id,
                    step = index,
                    elapsed_ms,
                    "Pipeline timeout before step"
                );
                let err = PipelineStepError::timeout(index, step, last_output.clone(), elapsed_ms);
                return Err(self.fail(&mut checkpoint, err).await);
            }

            let previous = if index > 0 {
                last_output.as_deref().map(|o| services.clean(o))
            } else {
                None
            };
            let ctx = StepContext::new(index, total, plan.original_message.clone(), shared.clone())
                .with_previous_output(previous);

            let result = match services.run_step(step, ctx, last_output.as_deref()).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(pipeline_id = %plan.id, step = index, "Pipeline step failed: {}", err);
                    return Err(self.fail(&mut checkpoint, err).await);
                }
            };

            tracing::info!(
                pipeline_id = %plan.id,
                step = index,
                agent = %result.agent_name,
                duration_ms = result.duration_ms,
                cost_usd = result.cost_usd,
                "Pipeline step completed"
            );

            last_output = Some(result.output.clone());
            artifacts.record(result.clone());
            checkpoint.record_step(result, artifacts.totals());
            self.save(&checkpoint).await;

            if artifacts.total_cost_usd > limits.max_cost_per_execution {
                tracing::warn!(
                    pipeline_id = %plan.id,
                    step = index,
                    total_cost_usd = artifacts.total_cost_usd,
                    limit = limits.max_cost_per_execution,
                    "Pipeline cost limit exceeded"
                );
                let err = PipelineStepError::cost_exceeded(
                    index,
                    step,
                    last_output.clone(),
                    artifacts.total_cost_usd,
                    limits.max_cost_per_execution,
                );
                return Err(self.fail(&mut checkpoint, err).await);
            }

            if index + 1 < total {
                services.beat(index + 1, total);
            }
        }

        if let Some(store) = &services.checkpoints {
            if let Err(e) = store.delete_checkpoint(&plan.id).await {
                tracing::warn!(pipeline_id = %plan.id, "Failed to delete completed checkpoint: {}", e);
            }
        }

        let final_response = last_output.unwrap_or_default();
        Ok(ExecutionResult::new(final_response, artifacts, ExecutionMode::Pipeline))
    }

    async fn save(&self, checkpoint: &PipelineCheckpoint) {
        if let Some(store) = &self.services.checkpoints {
            // 后台写入，不等待
            let _ = store.save_checkpoint(checkpoint.clone()).await;
        }
    }

    async fn fail(&self, checkpoint: &mut PipelineCheckpoint, err: PipelineStepError) -> PipelineStepError {
        checkpoint.record_failure(err.step_index, err.to_string());
        self.save(checkpoint).await;
        self.services.emit(
            "pipeline_step_failed",
            &err.step.agent_name,
            checkpoint.run_id.as_deref(),
            serde_json::json!({
                "pipelineId": checkpoint.pipeline_id,
                "stepIndex": err.step_index,
                "kind": err.kind.to_string(),
                "error": err.message,
            }),
        );
        err
    }
}
