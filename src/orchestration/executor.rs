//! Step Executor 契约与 Runner 共用的执行服务
//!
//! 真正的模型 / 工具调用由外部实现 [`StepExecutor`]；Runner 只负责拼上下文、
//! 选择轻重执行路径、计价并把执行器错误映射为带步骤信息的 [`PipelineStepError`]。

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{ExecutionLimits, ExecutionType, Step, StepResult};
use crate::checkpoint::CheckpointStore;
use crate::core::{ExecutorError, PipelineStepError};
use crate::ledger::{emit_best_effort, Ledger, LedgerEvent};
use crate::retry::{with_retry, RetryOptions};
use crate::services::{
    DefaultPromptBuilder, OutputCleaner, PricingCache, PromptBuilder, SkillComplexityCache, TagStripper,
};

/// 跨步骤共享的执行上下文：来源渠道与运行 ID（重试账本事件按 run_id 归档）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedContext {
    pub channel: String,
    pub run_id: Option<String>,
}

/// 单步执行上下文
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    pub step_index: usize,
    pub total_steps: usize,
    pub original_message: String,
    pub previous_output: Option<String>,
    /// 轻 / 重执行路径；None 时由技能复杂度查询决定
    pub execution_hint: Option<ExecutionType>,
    pub shared: SharedContext,
    /// PromptBuilder 的产物，执行前由 Runner 填充
    pub prompt: String,
}

impl StepContext {
    pub fn new(
        step_index: usize,
        total_steps: usize,
        original_message: impl Into<String>,
        shared: SharedContext,
    ) -> Self {
        Self {
            step_index,
            total_steps,
            original_message: original_message.into(),
            previous_output: None,
            execution_hint: None,
            shared,
            prompt: String::new(),
        }
    }

    pub fn with_previous_output(mut self, previous_output: Option<String>) -> Self {
        self.previous_output = previous_output;
        self
    }

    pub fn with_execution_hint(mut self, hint: ExecutionType) -> Self {
        self.execution_hint = Some(hint);
        self
    }
}

/// 执行器返回值
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub output: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub execution_type: ExecutionType,
    pub session_id: String,
    /// 实际使用的模型；None 时按执行类型的默认模型计价
    pub model: Option<String>,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput, ExecutorError>;
}

/// 给任意执行器加上分类重试
pub struct RetryingStepExecutor {
    inner: Arc<dyn StepExecutor>,
    options: RetryOptions,
}

impl RetryingStepExecutor {
    pub fn new(inner: Arc<dyn StepExecutor>, options: RetryOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl StepExecutor for RetryingStepExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput, ExecutorError> {
        let mut options = self.options.clone();
        options.agent_type = step.agent_name.clone();
        if options.run_id.is_none() {
            options.run_id = ctx.shared.run_id.clone();
        }

        let inner = &self.inner;
        let result = with_retry(&options, move |attempt| {
            if attempt > 0 {
                tracing::debug!(agent = %step.agent_name, step = ctx.step_index, attempt, "retrying step");
            }
            inner.execute(step, ctx)
        })
        .await;
        result.into_result()
    }
}

/// 心跳回调：参数为（已完成步骤数，总步骤数）
pub type Heartbeat = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// 一次执行中 Runner 共用的协作者与上限
#[derive(Clone)]
pub struct ExecutionServices {
    pub executor: Arc<dyn StepExecutor>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub cleaner: Arc<dyn OutputCleaner>,
    pub skills: Arc<SkillComplexityCache>,
    pub pricing: Arc<PricingCache>,
    pub limits: ExecutionLimits,
    pub heartbeat: Option<Heartbeat>,
    pub checkpoints: Option<Arc<CheckpointStore>>,
    pub ledger: Option<Arc<dyn Ledger>>,
}

impl ExecutionServices {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            prompts: Arc::new(DefaultPromptBuilder),
            cleaner: Arc::new(TagStripper),
            skills: Arc::new(SkillComplexityCache::disabled()),
            pricing: Arc::new(PricingCache::fallback_only()),
            limits: ExecutionLimits::default(),
            heartbeat: None,
            checkpoints: None,
            ledger: None,
        }
    }

    /// 执行一步并计价；`partial_output` 会被带入失败时的错误
    pub async fn run_step(
        &self,
        step: &Step,
        mut ctx: StepContext,
        partial_output: Option<&str>,
    ) -> Result<StepResult, PipelineStepError> {
        let execution_type = match ctx.execution_hint {
            Some(hint) => hint,
            None => self.skills.execution_type(step.skill_name.as_deref()).await,
        };
        ctx.execution_hint = Some(execution_type);
        ctx.prompt = self.prompts.build(step, &ctx);

        tracing::debug!(
            agent = %step.agent_name,
            step = ctx.step_index,
            total = ctx.total_steps,
            channel = %ctx.shared.channel,
            execution_type = %execution_type,
            "executing step"
        );

        let output = self.executor.execute(step, &ctx).await.map_err(|e| {
            PipelineStepError::from_executor(e, ctx.step_index, step, partial_output.map(str::to_string))
        })?;

        let cost_usd = self
            .pricing
            .cost_for(
                output.model.as_deref(),
                output.execution_type,
                output.input_tokens,
                output.output_tokens,
            )
            .await;

        Ok(StepResult {
            step_index: ctx.step_index,
            agent_name: step.agent_name.clone(),
            skill_name: step.skill_name.clone(),
            output: output.output,
            duration_ms: output.duration_ms,
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            cost_usd,
            execution_type: output.execution_type,
            session_id: output.session_id,
        })
    }

    pub fn clean(&self, output: &str) -> String {
        self.cleaner.clean(output)
    }

    pub fn beat(&self, completed: usize, total: usize) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat(completed, total);
        }
    }

    /// 写一条账本事件（未配置账本时忽略）
    pub fn emit(&self, kind: &str, agent_type: &str, run_id: Option<&str>, payload: serde_json::Value) {
        if let Some(ledger) = &self.ledger {
            let event = LedgerEvent::new(kind, agent_type, payload).with_run(run_id.map(str::to_string), None);
            emit_best_effort(ledger.as_ref(), event);
        }
    }
}
