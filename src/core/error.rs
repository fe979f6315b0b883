//! 编排错误类型
//!
//! Step Executor 只会以 DispatchFailed / ExecutionError 失败；Runner 在此基础上补充
//! Timeout（流水线超时）与 CostExceeded（成本上限），并附带步骤下标、步骤与已有的部分输出。

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::orchestration::Step;
use crate::services::ServiceError;

/// Step Executor 返回的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// 拿不到可用的 Agent / 会话
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// 底层调用出错或返回了显式错误标记
    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl ExecutorError {
    pub fn message(&self) -> &str {
        match self {
            ExecutorError::DispatchFailed(m) | ExecutorError::ExecutionError(m) => m,
        }
    }
}

/// 步骤级错误种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    DispatchFailed,
    ExecutionError,
    /// 流水线总耗时超限
    Timeout,
    /// 累计成本超过上限
    CostExceeded,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepErrorKind::DispatchFailed => "dispatch_failed",
            StepErrorKind::ExecutionError => "execution_error",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::CostExceeded => "cost_exceeded",
        };
        f.write_str(s)
    }
}

/// 某一步失败：足以让调用方构造降级回复
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Step {step_index} ({}) failed [{kind}]: {message}", .step.agent_name)]
pub struct PipelineStepError {
    pub kind: StepErrorKind,
    pub step_index: usize,
    pub step: Step,
    /// 失败前最后一次成功步骤的输出
    pub partial_output: Option<String>,
    pub message: String,
}

impl PipelineStepError {
    pub fn from_executor(
        err: ExecutorError,
        step_index: usize,
        step: &Step,
        partial_output: Option<String>,
    ) -> Self {
        let kind = match err {
            ExecutorError::DispatchFailed(_) => StepErrorKind::DispatchFailed,
            ExecutorError::ExecutionError(_) => StepErrorKind::ExecutionError,
        };
        Self {
            kind,
            step_index,
            step: step.clone(),
            partial_output,
            message: err.message().to_string(),
        }
    }

    pub fn timeout(step_index: usize, step: &Step, partial_output: Option<String>, elapsed_ms: u64) -> Self {
        Self {
            kind: StepErrorKind::Timeout,
            step_index,
            step: step.clone(),
            partial_output,
            message: format!("pipeline budget exhausted after {elapsed_ms}ms"),
        }
    }

    pub fn cost_exceeded(
        step_index: usize,
        step: &Step,
        partial_output: Option<String>,
        total_cost: f64,
        limit: f64,
    ) -> Self {
        Self {
            kind: StepErrorKind::CostExceeded,
            step_index,
            step: step.clone(),
            partial_output,
            message: format!("cost ${total_cost:.4} exceeds limit ${limit:.2}"),
        }
    }
}

/// 引擎对调用方暴露的错误
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error(transparent)]
    Step(#[from] PipelineStepError),

    /// 扇出模式下全部分支失败
    #[error("All {} fan-out branches failed", .failures.len())]
    AllBranchesFailed { failures: Vec<PipelineStepError> },

    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("No resumable checkpoint: {0}")]
    NotResumable(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// 构建引擎时外部服务初始化失败
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

impl OrchestrationError {
    /// 失败前已产生的部分输出（若有）
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            OrchestrationError::Step(e) => e.partial_output.as_deref(),
            _ => None,
        }
    }

    pub fn step_error(&self) -> Option<&PipelineStepError> {
        match self {
            OrchestrationError::Step(e) => Some(e),
            _ => None,
        }
    }
}
