//! Bee Conductor 命令行入口
//!
//! `bee-conductor <plan.json> [config.toml]`：用脚本化执行器 dry-run 一个计划，
//! 将 ExecutionResult 以 JSON 输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_conductor::config::load_config;
use bee_conductor::orchestration::{OrchestrationEngine, Plan, ScriptedStepExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bee_conductor::observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: bee-conductor <plan.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(config_path).context("Failed to load configuration")?;

    let data = tokio::fs::read_to_string(&plan_path)
        .await
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let plan: Plan = serde_json::from_str(&data).context("Invalid plan JSON")?;

    let executor = Arc::new(ScriptedStepExecutor::new());
    let engine = OrchestrationEngine::from_config(executor, &config)
        .context("Failed to build orchestration engine")?
        .with_heartbeat(|done, total| tracing::info!("progress {}/{}", done, total));

    let result = engine.execute(plan).await.context("Plan execution failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
