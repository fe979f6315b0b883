//! 扇出 Runner：所有步骤并发执行，等全部结束（不因单个失败提前返回），
//! 成功分支合并后再做一次轻量合成调用。

use futures_util::future::join_all;

use super::executor::{ExecutionServices, SharedContext, StepContext};
use super::types::{ArtifactStore, ExecutionMode, ExecutionResult, ExecutionType, Plan, Step, StepResult};
use crate::core::{OrchestrationError, PipelineStepError};

const SYNTHESIS_AGENT: &str = "synthesizer";

pub struct FanOutRunner<'a> {
    services: &'a ExecutionServices,
}

impl<'a> FanOutRunner<'a> {
    pub fn new(services: &'a ExecutionServices) -> Self {
        Self { services }
    }

    pub async fn run(&self, plan: &Plan) -> Result<ExecutionResult, OrchestrationError> {
        let services = self.services;
        let total = plan.steps.len();
        let shared = SharedContext {
            channel: plan.channel.clone(),
            run_id: plan.run_id.clone(),
        };

        let branches = plan.steps.iter().enumerate().map(|(index, step)| {
            let ctx = StepContext::new(index, total, plan.original_message.clone(), shared.clone());
            services.run_step(step, ctx, None)
        });
        let settled = join_all(branches).await;

        let mut successes: Vec<StepResult> = Vec::new();
        let mut failures: Vec<PipelineStepError> = Vec::new();
        for outcome in settled {
            match outcome {
                Ok(result) => successes.push(result),
                Err(err) => {
                    tracing::warn!(plan_id = %plan.id, step = err.step_index, "Fan-out branch failed: {}", err);
                    services.emit(
                        "fan_out_branch_failed",
                        &err.step.agent_name,
                        plan.run_id.as_deref(),
                        serde_json::json!({
                            "planId": plan.id,
                            "stepIndex": err.step_index,
                            "kind": err.kind.to_string(),
                            "error": err.message,
                        }),
                    );
                    failures.push(err);
                }
            }
        }

        if successes.is_empty() {
            return Err(OrchestrationError::AllBranchesFailed { failures });
        }

        successes.sort_by_key(|r| r.step_index);
        let mut artifacts = ArtifactStore::new(plan.original_message.clone());
        artifacts.record_parallel(successes.clone());

        tracing::info!(
            plan_id = %plan.id,
            succeeded = successes.len(),
            failed = failures.len(),
            wall_clock_ms = artifacts.total_duration_ms,
            "Fan-out branches settled"
        );

        let final_response = self.synthesize(plan, &successes, failures.len(), &shared, &mut artifacts).await;
        Ok(ExecutionResult::new(final_response, artifacts, ExecutionMode::FanOut))
    }

    /// 合成调用；失败时退化为拼接各分支输出
    async fn synthesize(
        &self,
        plan: &Plan,
        successes: &[StepResult],
        failed: usize,
        shared: &SharedContext,
        artifacts: &mut ArtifactStore,
    ) -> String {
        let services = self.services;
        let total = plan.steps.len();
        let step = Step::new(SYNTHESIS_AGENT, synthesis_instruction(services, plan, successes, failed));
        let ctx = StepContext::new(total, total + 1, plan.original_message.clone(), shared.clone())
            .with_execution_hint(ExecutionType::Light);

        match services.run_step(&step, ctx, None).await {
            Ok(result) => {
                artifacts.add_overhead(
                    result.duration_ms,
                    result.input_tokens,
                    result.output_tokens,
                    result.cost_usd,
                );
                result.output
            }
            Err(err) => {
                tracing::warn!(plan_id = %plan.id, "Synthesis failed, concatenating branch outputs: {}", err);
                successes
                    .iter()
                    .map(|r| services.clean(&r.output))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
        }
    }
}

fn synthesis_instruction(
    services: &ExecutionServices,
    plan: &Plan,
    successes: &[StepResult],
    failed: usize,
) -> String {
    let mut instruction = format!(
        "Combine the results of {} parallel work streams into one coherent answer to the original request. \
         Do not mention the work streams themselves.\n\nOriginal request:\n{}\n",
        successes.len(),
        plan.original_message.trim()
    );
    for result in successes {
        instruction.push_str(&format!(
            "\n### Result {} ({})\n{}\n",
            result.step_index + 1,
            result.agent_name,
            services.clean(&result.output)
        ));
    }
    if failed > 0 {
        instruction.push_str(&format!(
            "\nNote: {failed} of {} work streams failed and are not included. \
             Acknowledge any gaps this leaves.\n",
            plan.steps.len()
        ));
    }
    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutorError;
    use crate::orchestration::mock::{ScriptedResponse, ScriptedStepExecutor};
    use crate::orchestration::PlanBuilder;
    use std::sync::Arc;

    fn plan(agents: &[&str]) -> Plan {
        let mut builder = PlanBuilder::new("compare options").mode(ExecutionMode::FanOut);
        for agent in agents {
            builder = builder.step(Step::new(*agent, format!("research {agent}")));
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_partial_failure_mentioned_in_synthesis() {
        let mock = Arc::new(
            ScriptedStepExecutor::new()
                .reply("a", ScriptedResponse::text("alpha"))
                .reply("b", ScriptedResponse::fail(ExecutorError::DispatchFailed("no agent".into())))
                .reply("c", ScriptedResponse::text("gamma"))
                .reply(SYNTHESIS_AGENT, ScriptedResponse::text("combined")),
        );
        let services = ExecutionServices::new(mock.clone());
        let result = FanOutRunner::new(&services).run(&plan(&["a", "b", "c"])).await.unwrap();

        assert_eq!(result.final_response, "combined");
        let indices: Vec<usize> = result.step_results.iter().map(|r| r.step_index).collect();
        assert_eq!(indices, vec![0, 2]);

        let synthesis = mock.calls_for(SYNTHESIS_AGENT);
        assert_eq!(synthesis.len(), 1);
        assert_eq!(synthesis[0].execution_type, ExecutionType::Light);
        assert!(synthesis[0].instruction.contains("1 of 3 work streams failed"));
        assert!(synthesis[0].instruction.contains("alpha"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_falls_back_to_concatenation() {
        let mock = Arc::new(
            ScriptedStepExecutor::new()
                .reply("a", ScriptedResponse::text("alpha"))
                .reply("b", ScriptedResponse::text("beta"))
                .reply(
                    SYNTHESIS_AGENT,
                    ScriptedResponse::fail(ExecutorError::ExecutionError("model error".into())),
                ),
        );
        let services = ExecutionServices::new(mock);
        let result = FanOutRunner::new(&services).run(&plan(&["a", "b"])).await.unwrap();
        assert_eq!(result.final_response, "alpha\n\nbeta");
        assert_eq!(result.step_results.len(), 2);
    }
}
