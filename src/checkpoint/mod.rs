//! 流水线检查点：崩溃后从中断处继续
//!
//! - **PipelineCheckpoint**: 可 JSON 序列化的进度快照，带版本号与显式过期时间
//! - **DurableStore**: 权威的持久化后端（内存 / JSON 文件 / SQLite）
//! - **CheckpointStore**: 进程内注册表 + 持久化后端；写入不阻塞调用方，过期检查点视为不存在

pub mod durable;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestration::{ArtifactTotals, Step, StepResult};

pub use durable::{open_durable_store, DurableStore, FileDurableStore, MemoryDurableStore, SqliteDurableStore};
pub use store::{CheckpointStore, ResumeStatus};

/// 当前检查点格式版本；其它版本的记录按不存在处理
pub const CHECKPOINT_VERSION: u32 = 1;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Checkpoint IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Checkpoint background task failed: {0}")]
    Join(String),

    #[error("Checkpoint store lock poisoned")]
    Poisoned,
}

/// 流水线进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCheckpoint {
    pub version: u32,
    pub pipeline_id: String,
    pub original_message: String,
    pub steps: Vec<Step>,
    /// 下一个待执行步骤（0 起始）
    pub next_step_index: usize,
    pub completed_steps: Vec<StepResult>,
    pub last_output: Option<String>,
    pub artifact_totals: ArtifactTotals,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_index: Option<usize>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl PipelineCheckpoint {
    /// 流水线开始时创建；时间戳在保存时由 CheckpointStore 刷新
    pub fn new(
        pipeline_id: impl Into<String>,
        original_message: impl Into<String>,
        steps: Vec<Step>,
        channel: impl Into<String>,
        run_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            pipeline_id: pipeline_id.into(),
            original_message: original_message.into(),
            steps,
            next_step_index: 0,
            completed_steps: Vec::new(),
            last_output: None,
            artifact_totals: ArtifactTotals::default(),
            channel: channel.into(),
            failure_error: None,
            failed_step_index: None,
            updated_at: now,
            expires_at: now,
            run_id,
        }
    }

    /// 记录一个成功步骤，并清除之前的失败信息
    pub fn record_step(&mut self, result: StepResult, totals: ArtifactTotals) {
        self.next_step_index = result.step_index + 1;
        self.last_output = Some(result.output.clone());
        self.completed_steps.push(result);
        self.artifact_totals = totals;
        self.failure_error = None;
        self.failed_step_index = None;
    }

    pub fn record_failure(&mut self, step_index: usize, error: impl Into<String>) {
        self.failed_step_index = Some(step_index);
        self.failure_error = Some(error.into());
    }

    pub fn steps_remaining(&self) -> usize {
        self.steps.len().saturating_sub(self.next_step_index)
    }

    pub fn steps_completed(&self) -> usize {
        self.completed_steps.len()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::ExecutionType;

    fn result(index: usize) -> StepResult {
        StepResult {
            step_index: index,
            agent_name: "writer".to_string(),
            skill_name: None,
            output: format!("out {index}"),
            duration_ms: 10,
            input_tokens: 1,
            output_tokens: 1,
            cost_usd: 0.01,
            execution_type: ExecutionType::Light,
            session_id: "s".to_string(),
        }
    }

    #[test]
    fn test_record_step_advances() {
        let steps = vec![Step::new("a", "1"), Step::new("b", "2"), Step::new("c", "3")];
        let mut cp = PipelineCheckpoint::new("p1", "hello", steps, "cli", None);
        cp.record_failure(0, "boom");
        cp.record_step(result(0), ArtifactTotals::default());
        assert_eq!(cp.next_step_index, 1);
        assert_eq!(cp.steps_remaining(), 2);
        assert_eq!(cp.steps_completed(), 1);
        assert_eq!(cp.last_output.as_deref(), Some("out 0"));
        assert!(cp.failure_error.is_none());
    }

    #[test]
    fn test_json_shape() {
        let cp = PipelineCheckpoint::new("p1", "hello", vec![Step::new("a", "1")], "slack", Some("run-1".into()));
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["pipelineId"], "p1");
        assert_eq!(json["nextStepIndex"], 0);
        assert_eq!(json["runId"], "run-1");
        assert!(json.get("failureError").is_none());
        let back: PipelineCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, cp);
    }
}
