//! 计划构建器
//!
//! 提供流畅的 API 来构建计划

use super::types::{ExecutionMode, Plan, PlanId, Step};
use crate::core::OrchestrationError;

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    mode: ExecutionMode,
    steps: Vec<Step>,
    original_message: String,
    channel: String,
    run_id: Option<String>,
}

impl PlanBuilder {
    /// 创建新的计划构建器（默认串行）
    pub fn new(original_message: impl Into<String>) -> Self {
        Self {
            id: Plan::generate_id(),
            mode: ExecutionMode::Pipeline,
            steps: Vec::new(),
            original_message: original_message.into(),
            channel: Plan::default_channel(),
            run_id: None,
        }
    }

    /// 指定 ID（续跑或外部已分配时）
    pub fn id(mut self, id: impl Into<PlanId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// 添加步骤
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// 设置来源渠道
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// 构建计划
    pub fn build(self) -> Result<Plan, OrchestrationError> {
        if self.steps.is_empty() {
            return Err(OrchestrationError::EmptyPlan);
        }

        Ok(Plan {
            id: self.id,
            mode: self.mode,
            steps: self.steps,
            original_message: self.original_message,
            channel: self.channel,
            run_id: self.run_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("Plan a trip")
            .mode(ExecutionMode::FanOut)
            .step(Step::new("flights", "Find flights"))
            .step(Step::new("hotels", "Find hotels"))
            .channel("slack")
            .run_id("run-9")
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.mode, ExecutionMode::FanOut);
        assert_eq!(plan.channel, "slack");
        assert_eq!(plan.run_id.as_deref(), Some("run-9"));
        assert!(plan.id.starts_with("plan_"));
    }

    #[test]
    fn test_build_without_steps_fails() {
        let result = PlanBuilder::new("Test").build();

        assert!(matches!(result, Err(OrchestrationError::EmptyPlan)));
    }

    #[test]
    fn test_explicit_id() {
        let plan = PlanBuilder::new("x").id("fixed").step(Step::new("a", "b")).build().unwrap();
        assert_eq!(plan.id, "fixed");
    }
}
