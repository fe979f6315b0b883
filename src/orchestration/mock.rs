//! 脚本化执行器：测试与 dry-run 使用
//!
//! 按 Agent 名称排队预设回复；队列只剩一条时该条会被重复使用。
//! 没有预设的 Agent 回显其指令首行。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::executor::{StepContext, StepExecutor, StepOutput};
use super::types::{ExecutionType, Step};
use crate::core::ExecutorError;

/// 一条预设回复
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    outcome: Result<String, ExecutorError>,
    input_tokens: u64,
    output_tokens: u64,
    delay: Option<Duration>,
    model: Option<String>,
}

impl ScriptedResponse {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            outcome: Ok(output.into()),
            input_tokens: 100,
            output_tokens: 50,
            delay: None,
            model: None,
        }
    }

    pub fn fail(error: ExecutorError) -> Self {
        Self {
            outcome: Err(error),
            input_tokens: 0,
            output_tokens: 0,
            delay: None,
            model: None,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// 一次被记录的调用
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub agent_name: String,
    pub instruction: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub previous_output: Option<String>,
    pub execution_type: ExecutionType,
    pub prompt: String,
}

#[derive(Default)]
pub struct ScriptedStepExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
    default_delay: Duration,
}

impl ScriptedStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 给 Agent 追加一条回复
    pub fn reply(self, agent_name: impl Into<String>, response: ScriptedResponse) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent_name.into())
            .or_default()
            .push_back(response);
        self
    }

    /// 所有调用的默认延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, agent_name: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.agent_name == agent_name)
            .collect()
    }

    fn next_response(&self, step: &Step) -> ScriptedResponse {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let scripted = match scripts.get_mut(&step.agent_name) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        scripted.unwrap_or_else(|| {
            let first_line = step.instruction.lines().next().unwrap_or_default();
            ScriptedResponse::text(format!("[{}] {}", step.agent_name, first_line))
        })
    }
}

#[async_trait]
impl StepExecutor for ScriptedStepExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput, ExecutorError> {
        let execution_type = ctx.execution_hint.unwrap_or_default();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                agent_name: step.agent_name.clone(),
                instruction: step.instruction.clone(),
                step_index: ctx.step_index,
                total_steps: ctx.total_steps,
                previous_output: ctx.previous_output.clone(),
                execution_type,
                prompt: ctx.prompt.clone(),
            });

        let response = self.next_response(step);
        let started = Instant::now();
        let delay = response.delay.unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let output = response.outcome?;
        Ok(StepOutput {
            output,
            duration_ms: started.elapsed().as_millis() as u64,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            execution_type,
            session_id: format!("mock-{}-{}", step.agent_name, ctx.step_index),
            model: response.model,
        })
    }
}
