//! 提示词构建
//!
//! 纯函数：由步骤与上下文拼出交给模型的完整提示词，不做任何 IO。

use crate::orchestration::{Step, StepContext};

pub trait PromptBuilder: Send + Sync {
    fn build(&self, step: &Step, ctx: &StepContext) -> String;
}

/// 默认模板：技能说明、步骤位置、原始请求、上一步输出、本步指令
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, step: &Step, ctx: &StepContext) -> String {
        let mut prompt = String::new();

        if let Some(skill) = &step.skill_name {
            prompt.push_str(&format!("Skill: {skill}\n"));
            if let Some(description) = &step.skill_description {
                prompt.push_str(&format!("{}\n", description.trim()));
            }
            prompt.push('\n');
        }

        if ctx.total_steps > 1 {
            prompt.push_str(&format!(
                "You are step {} of {} in a multi-step plan.\n\n",
                ctx.step_index + 1,
                ctx.total_steps
            ));
        }

        prompt.push_str("Original request:\n");
        prompt.push_str(ctx.original_message.trim());
        prompt.push_str("\n\n");

        if let Some(previous) = &ctx.previous_output {
            prompt.push_str("Output from the previous step:\n");
            prompt.push_str(previous.trim());
            prompt.push_str("\n\n");
        }

        prompt.push_str("Your task:\n");
        prompt.push_str(step.instruction.trim());
        prompt
    }
}
