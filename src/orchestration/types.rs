//! 编排类型定义
//!
//! 定义步骤、步骤结果、产物累加器、执行模式与执行结果等核心数据类型

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 计划 ID
pub type PlanId = String;

/// 单个工作步骤（不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 执行该步骤的 Agent 名称
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_description: Option<String>,
    /// 给 Agent 的指令
    pub instruction: String,
}

impl Step {
    pub fn new(agent_name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            skill_name: None,
            skill_description: None,
            instruction: instruction.into(),
        }
    }

    pub fn with_skill(mut self, name: impl Into<String>, description: Option<String>) -> Self {
        self.skill_name = Some(name.into());
        self.skill_description = description;
        self
    }

    /// 复制步骤并替换指令（评审循环中用于注入反馈）
    pub fn with_instruction(&self, instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..self.clone()
        }
    }
}

/// 轻量（直接模型调用）/ 重量（带工具的完整 Agent 调用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Light,
    #[default]
    Heavy,
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionType::Light => write!(f, "light"),
            ExecutionType::Heavy => write!(f, "heavy"),
        }
    }
}

/// 单步执行结果（写入后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// 0 起始，在一次执行内稳定
    pub step_index: usize,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_name: Option<String>,
    pub output: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub execution_type: ExecutionType,
    pub session_id: String,
}

/// 产物累计值（也用于检查点）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactTotals {
    pub total_duration_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
}

/// 单次执行的产物累加器，由当前 Runner 独占
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStore {
    pub original_message: String,
    pub steps: Vec<StepResult>,
    pub total_duration_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
}

impl ArtifactStore {
    pub fn new(original_message: impl Into<String>) -> Self {
        Self {
            original_message: original_message.into(),
            ..Default::default()
        }
    }

    /// 从检查点恢复
    pub fn restore(
        original_message: impl Into<String>,
        steps: Vec<StepResult>,
        totals: ArtifactTotals,
    ) -> Self {
        Self {
            original_message: original_message.into(),
            steps,
            total_duration_ms: totals.total_duration_ms,
            total_input_tokens: totals.total_input_tokens,
            total_output_tokens: totals.total_output_tokens,
            total_cost_usd: totals.total_cost_usd,
        }
    }

    /// 追加串行步骤：耗时累加
    pub fn record(&mut self, result: StepResult) {
        self.total_duration_ms += result.duration_ms;
        self.add_usage(result.input_tokens, result.output_tokens, result.cost_usd);
        self.steps.push(result);
    }

    /// 合并并行分支：token 与成本累加，耗时取最大值（真实墙钟）
    pub fn record_parallel(&mut self, results: Vec<StepResult>) {
        let wall_clock = results.iter().map(|r| r.duration_ms).max().unwrap_or(0);
        self.total_duration_ms += wall_clock;
        for result in results {
            self.add_usage(result.input_tokens, result.output_tokens, result.cost_usd);
            self.steps.push(result);
        }
    }

    /// 计入不产生 StepResult 的调用（如扇出合成）
    pub fn add_overhead(&mut self, duration_ms: u64, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.total_duration_ms += duration_ms;
        self.add_usage(input_tokens, output_tokens, cost_usd);
    }

    fn add_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.total_input_tokens += input_tokens;
        self.total_output_tokens += output_tokens;
        self.total_cost_usd += cost_usd.max(0.0);
    }

    pub fn totals(&self) -> ArtifactTotals {
        ArtifactTotals {
            total_duration_ms: self.total_duration_ms,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            total_cost_usd: self.total_cost_usd,
        }
    }

    pub fn last_output(&self) -> Option<&str> {
        self.steps.last().map(|s| s.output.as_str())
    }
}

/// 执行模式（封闭枚举，每个变体对应一个 Runner）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 严格串行，输出向后传递
    Pipeline,
    /// 全部并行，合成汇总
    FanOut,
    /// 生产者 / 评审者交替迭代
    CriticLoop,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Pipeline => write!(f, "pipeline"),
            ExecutionMode::FanOut => write!(f, "fan_out"),
            ExecutionMode::CriticLoop => write!(f, "critic_loop"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pipeline" | "sequential" => Ok(ExecutionMode::Pipeline),
            "fan_out" | "fanout" | "parallel" => Ok(ExecutionMode::FanOut),
            "critic_loop" | "critic" => Ok(ExecutionMode::CriticLoop),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

fn new_plan_id() -> PlanId {
    format!("plan_{}", uuid::Uuid::new_v4())
}

fn default_channel() -> String {
    "default".to_string()
}

/// 待执行的计划：执行模式 + 有序步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// 也作为流水线检查点的 pipeline_id
    #[serde(default = "new_plan_id")]
    pub id: PlanId,
    pub mode: ExecutionMode,
    pub steps: Vec<Step>,
    pub original_message: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Plan {
    pub(crate) fn generate_id() -> PlanId {
        new_plan_id()
    }

    pub(crate) fn default_channel() -> String {
        default_channel()
    }
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub final_response: String,
    pub artifacts: ArtifactStore,
    pub step_results: Vec<StepResult>,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    /// 评审循环因成本上限提前结束
    #[serde(default)]
    pub cost_truncated: bool,
}

impl ExecutionResult {
    pub fn new(final_response: String, artifacts: ArtifactStore, mode: ExecutionMode) -> Self {
        let step_results = artifacts.steps.clone();
        Self {
            final_response,
            artifacts,
            step_results,
            mode,
            plan_id: None,
            cost_truncated: false,
        }
    }
}

/// 计划步骤数的硬上限
pub const MAX_PIPELINE_DEPTH: usize = 5;
/// 评审循环轮数的硬上限
pub const MAX_CRITIC_ROUNDS: usize = 3;

/// 执行上限（来自 [orchestration] 配置）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub max_pipeline_depth: usize,
    pub max_pipeline_timeout_ms: u64,
    pub max_cost_per_execution: f64,
    pub max_critic_rounds: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&crate::config::OrchestrationSection::default())
    }
}

impl ExecutionLimits {
    /// 把深度与轮数限制在 1..=硬上限 内；配置值超出时记录警告
    pub fn clamped(self) -> Self {
        let max_pipeline_depth = self.max_pipeline_depth.clamp(1, MAX_PIPELINE_DEPTH);
        if max_pipeline_depth != self.max_pipeline_depth {
            tracing::warn!(
                configured = self.max_pipeline_depth,
                effective = max_pipeline_depth,
                "max_pipeline_depth out of range, clamping"
            );
        }
        let max_critic_rounds = self.max_critic_rounds.clamp(1, MAX_CRITIC_ROUNDS);
        if max_critic_rounds != self.max_critic_rounds {
            tracing::warn!(
                configured = self.max_critic_rounds,
                effective = max_critic_rounds,
                "max_critic_rounds out of range, clamping"
            );
        }
        Self {
            max_pipeline_depth,
            max_critic_rounds,
            ..self
        }
    }
}

impl From<&crate::config::OrchestrationSection> for ExecutionLimits {
    fn from(section: &crate::config::OrchestrationSection) -> Self {
        Self {
            max_pipeline_depth: section.max_pipeline_depth,
            max_pipeline_timeout_ms: section.max_pipeline_timeout_ms,
            max_cost_per_execution: section.max_cost_per_execution,
            max_critic_rounds: section.max_critic_rounds,
        }
        .clamped()
    }
}
