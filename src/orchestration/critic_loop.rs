//! 评审循环 Runner：生产者与评审者交替，直到评审通过或轮数用尽
//!
//! 评审结论按严格 JSON 解码；解码失败时，最后一轮视为通过（保证循环结束），
//! 其余轮次视为驳回并要求澄清。生产者与评审者每一步之后都检查成本，
//! 超限不报错，只截断并返回当前最好的候选。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::executor::{ExecutionServices, SharedContext, StepContext};
use super::types::{ArtifactStore, ExecutionMode, ExecutionResult, Plan, Step, MAX_CRITIC_ROUNDS};
use crate::core::PipelineStepError;

/// 缺省评审步骤使用的技能
pub const DEFAULT_CRITIC_SKILL: &str = "critical_review";

const CLARIFY_FEEDBACK: &str =
    "The review could not be read. Clarify the response and address the original request more directly.";

/// 评审结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub accepted: bool,
    pub feedback: String,
    /// 1..=10
    pub score: u8,
    pub issues: Vec<String>,
}

#[derive(Error, Debug)]
pub enum VerdictParseError {
    #[error("no JSON object in critic output")]
    NoJson,
    #[error("invalid verdict JSON: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("verdict is missing `accepted`")]
    MissingAccepted,
}

#[derive(Deserialize)]
struct RawVerdict {
    accepted: Option<bool>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    issues: Option<Vec<String>>,
}

/// 从评审输出中取出 JSON：优先 ```json 代码块，其次第一个 `{` 到最后一个 `}`
fn extract_json(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if candidate.starts_with('{') {
                return Some(candidate);
            }
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// 解码评审结论
pub fn parse_verdict(raw: &str) -> Result<CriticVerdict, VerdictParseError> {
    let json = extract_json(raw).ok_or(VerdictParseError::NoJson)?;
    let parsed: RawVerdict = serde_json::from_str(json)?;
    let accepted = parsed.accepted.ok_or(VerdictParseError::MissingAccepted)?;
    let score = parsed.score.unwrap_or(5.0).round().clamp(1.0, 10.0) as u8;
    Ok(CriticVerdict {
        accepted,
        feedback: parsed.feedback.unwrap_or_default(),
        score,
        issues: parsed.issues.unwrap_or_default(),
    })
}

/// 解码失败时的处理：最后一轮放行，其余轮次驳回
fn degrade(err: &VerdictParseError, is_final_round: bool) -> CriticVerdict {
    if is_final_round {
        CriticVerdict {
            accepted: true,
            feedback: format!("Critic verdict could not be parsed ({err}); accepting the final candidate."),
            score: 5,
            issues: Vec::new(),
        }
    } else {
        CriticVerdict {
            accepted: false,
            feedback: CLARIFY_FEEDBACK.to_string(),
            score: 3,
            issues: Vec::new(),
        }
    }
}

fn default_critic() -> Step {
    Step::new(
        "critic",
        "Critically review the response for correctness, completeness and clarity.",
    )
    .with_skill(DEFAULT_CRITIC_SKILL, None)
}

fn revision_instruction(producer: &Step, verdict: &CriticVerdict) -> String {
    let mut instruction = format!(
        "{}\n\nA reviewer scored your previous answer {}/10 and asked for changes:\n{}\n",
        producer.instruction.trim(),
        verdict.score,
        verdict.feedback.trim()
    );
    if !verdict.issues.is_empty() {
        instruction.push_str("\nIssues:\n");
        for issue in &verdict.issues {
            instruction.push_str(&format!("- {issue}\n"));
        }
    }
    instruction.push_str("\nRevise your previous answer to address this feedback.");
    instruction
}

fn review_instruction(critic: &Step, original_message: &str, candidate: &str) -> String {
    format!(
        "{}\n\nOriginal request:\n{}\n\nResponse to review:\n{}\n\n\
         Reply with strict JSON only, no prose:\n\
         {{\"accepted\": true|false, \"score\": 1-10, \"feedback\": \"...\", \"issues\": [\"...\"]}}",
        critic.instruction.trim(),
        original_message.trim(),
        candidate
    )
}

pub struct CriticLoopRunner<'a> {
    services: &'a ExecutionServices,
}

impl<'a> CriticLoopRunner<'a> {
    pub fn new(services: &'a ExecutionServices) -> Self {
        Self { services }
    }

    pub async fn run(&self, plan: &Plan) -> Result<ExecutionResult, PipelineStepError> {
        let services = self.services;
        let limits = services.limits;
        let rounds = limits.max_critic_rounds.clamp(1, MAX_CRITIC_ROUNDS);
        let total = rounds * 2;
        let shared = SharedContext {
            channel: plan.channel.clone(),
            run_id: plan.run_id.clone(),
        };

        let Some(producer) = plan.steps.first() else {
            return Ok(ExecutionResult::new(
                String::new(),
                ArtifactStore::new(plan.original_message.clone()),
                ExecutionMode::CriticLoop,
            ));
        };
        let critic = plan.steps.get(1).cloned().unwrap_or_else(default_critic);

        let mut artifacts = ArtifactStore::new(plan.original_message.clone());
        let mut candidate: Option<String> = None;
        let mut last_verdict: Option<CriticVerdict> = None;
        let mut cost_truncated = false;

        for round in 0..rounds {
            let is_final_round = round + 1 == rounds;

            let producer_step = match &last_verdict {
                Some(verdict) => producer.with_instruction(revision_instruction(producer, verdict)),
                None => producer.clone(),
            };
            let ctx = StepContext::new(round * 2, total, plan.original_message.clone(), shared.clone())
                .with_previous_output(candidate.clone());
            let produced = services
                .run_step(&producer_step, ctx, candidate.as_deref())
                .await?;
            let cleaned = services.clean(&produced.output);
            artifacts.record(produced);
            candidate = Some(cleaned.clone());

            if self.over_budget(plan, &producer.agent_name, round, &artifacts) {
                cost_truncated = true;
                break;
            }

            let review_step = critic.with_instruction(review_instruction(&critic, &plan.original_message, &cleaned));
            let ctx = StepContext::new(round * 2 + 1, total, plan.original_message.clone(), shared.clone())
                .with_previous_output(Some(cleaned.clone()));
            let reviewed = services.run_step(&review_step, ctx, Some(cleaned.as_str())).await?;
            let verdict = match parse_verdict(&reviewed.output) {
                Ok(verdict) => verdict,
                Err(err) => {
                    tracing::warn!(plan_id = %plan.id, round, "Unreadable critic verdict: {}", err);
                    degrade(&err, is_final_round)
                }
            };
            artifacts.record(reviewed);

            tracing::info!(
                plan_id = %plan.id,
                round,
                accepted = verdict.accepted,
                score = verdict.score,
                "Critic round finished"
            );

            if verdict.accepted {
                break;
            }
            // 评审本身也可能把成本推过上限，此时不再开启下一轮
            if self.over_budget(plan, &critic.agent_name, round, &artifacts) {
                cost_truncated = true;
                break;
            }
            last_verdict = Some(verdict);
            if round + 1 < rounds {
                services.beat(round * 2 + 2, total);
            }
        }

        let mut result = ExecutionResult::new(candidate.unwrap_or_default(), artifacts, ExecutionMode::CriticLoop);
        result.cost_truncated = cost_truncated;
        Ok(result)
    }

    /// 累计成本超过上限时记录并返回 true
    fn over_budget(&self, plan: &Plan, agent: &str, round: usize, artifacts: &ArtifactStore) -> bool {
        let limit = self.services.limits.max_cost_per_execution;
        if artifacts.total_cost_usd <= limit {
            return false;
        }
        tracing::warn!(
            plan_id = %plan.id,
            agent = %agent,
            round,
            total_cost_usd = artifacts.total_cost_usd,
            limit,
            "Critic loop cost limit reached, returning best candidate"
        );
        self.services.emit(
            "critic_loop_cost_truncated",
            agent,
            plan.run_id.as_deref(),
            serde_json::json!({
                "planId": plan.id,
                "round": round,
                "totalCostUsd": artifacts.total_cost_usd,
            }),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict = parse_verdict(r#"{"accepted": false, "score": 4, "feedback": "too short", "issues": ["depth"]}"#)
            .unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.score, 4);
        assert_eq!(verdict.issues, vec!["depth".to_string()]);
    }

    #[test]
    fn test_parse_fenced_with_prose() {
        let raw = "Here is my review:\n```json\n{\"accepted\": true, \"score\": 14}\n```\nThanks!";
        let verdict = parse_verdict(raw).unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.score, 10);
        assert!(verdict.feedback.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_verdict("looks fine to me"), Err(VerdictParseError::NoJson)));
        assert!(matches!(parse_verdict("{accepted: yes}"), Err(VerdictParseError::Invalid(_))));
        assert!(matches!(parse_verdict(r#"{"score": 7}"#), Err(VerdictParseError::MissingAccepted)));
    }

    #[test]
    fn test_degrade_policy() {
        let err = VerdictParseError::NoJson;
        let last = degrade(&err, true);
        assert!(last.accepted);
        assert_eq!(last.score, 5);
        assert!(last.feedback.contains("could not be parsed"));

        let early = degrade(&err, false);
        assert!(!early.accepted);
        assert_eq!(early.score, 3);
    }

    #[test]
    fn test_revision_instruction_carries_feedback() {
        let verdict = CriticVerdict {
            accepted: false,
            feedback: "add sources".to_string(),
            score: 4,
            issues: vec!["no citations".to_string()],
        };
        let text = revision_instruction(&Step::new("writer", "Write an essay"), &verdict);
        assert!(text.starts_with("Write an essay"));
        assert!(text.contains("4/10"));
        assert!(text.contains("- no citations"));
        assert!(text.ends_with("address this feedback."));
    }
}
