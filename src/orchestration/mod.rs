//! 多步计划编排
//!
//! - **types**: 步骤、结果、产物累加器、执行模式、计划
//! - **executor**: Step Executor 契约、重试装饰器、Runner 共用服务
//! - **pipeline / fan_out / critic_loop**: 三种执行模式各自的 Runner
//! - **engine**: 入口，按模式分派并处理计划存储与续跑
//! - **builder**: 计划构建器
//! - **mock**: 脚本化执行器

pub mod builder;
pub mod critic_loop;
pub mod engine;
pub mod executor;
pub mod fan_out;
pub mod mock;
pub mod pipeline;
pub mod types;

pub use builder::PlanBuilder;
pub use critic_loop::{parse_verdict, CriticLoopRunner, CriticVerdict, VerdictParseError};
pub use engine::OrchestrationEngine;
pub use executor::{
    ExecutionServices, Heartbeat, RetryingStepExecutor, SharedContext, StepContext, StepExecutor, StepOutput,
};
pub use fan_out::FanOutRunner;
pub use mock::{RecordedCall, ScriptedResponse, ScriptedStepExecutor};
pub use pipeline::PipelineRunner;
pub use types::{
    ArtifactStore, ArtifactTotals, ExecutionLimits, ExecutionMode, ExecutionResult, ExecutionType, Plan, PlanId,
    Step, StepResult, MAX_CRITIC_ROUNDS, MAX_PIPELINE_DEPTH,
};
