//! Bee Conductor - 多步计划编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排错误类型
//! - **orchestration**: 计划、三种 Runner（流水线 / 扇出 / 评审循环）与编排引擎
//! - **retry**: 错误分类、指数退避、带账本事件的重试
//! - **checkpoint**: 流水线检查点与持久化后端（内存 / 文件 / SQLite）
//! - **services**: 技能复杂度与价格缓存、执行计划存储、提示词构建、输出清洗
//! - **ledger**: 重试 / 失败事件账本
//! - **observability**: tracing 初始化

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod ledger;
pub mod observability;
pub mod orchestration;
pub mod retry;
pub mod services;

pub use orchestration::{ExecutionMode, ExecutionResult, OrchestrationEngine, Plan, PlanBuilder, Step};
