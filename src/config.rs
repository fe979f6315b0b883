//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__ORCHESTRATION__MAX_COST_PER_EXECUTION=1.5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub cache: CacheSection,
}

/// [orchestration] 段：计划深度、流水线超时、单次执行成本上限、评审轮数
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationSection {
    /// 计划步骤上限，超出部分在执行前截断
    #[serde(default = "default_max_pipeline_depth")]
    pub max_pipeline_depth: usize,
    /// 流水线总耗时上限（毫秒，从流水线开始计）
    #[serde(default = "default_max_pipeline_timeout_ms")]
    pub max_pipeline_timeout_ms: u64,
    /// 单次执行成本上限（美元）
    #[serde(default = "default_max_cost_per_execution")]
    pub max_cost_per_execution: f64,
    #[serde(default = "default_max_critic_rounds")]
    pub max_critic_rounds: usize,
}

fn default_max_pipeline_depth() -> usize {
    5
}

fn default_max_pipeline_timeout_ms() -> u64 {
    120_000
}

fn default_max_cost_per_execution() -> f64 {
    2.0
}

fn default_max_critic_rounds() -> usize {
    3
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            max_pipeline_depth: default_max_pipeline_depth(),
            max_pipeline_timeout_ms: default_max_pipeline_timeout_ms(),
            max_cost_per_execution: default_max_cost_per_execution(),
            max_critic_rounds: default_max_critic_rounds(),
        }
    }
}

/// [retry] 段：重试次数与指数退避参数（delay = base × factor^attempt + jitter）
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> u64 {
    4
}

fn default_max_jitter_ms() -> u64 {
    500
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

/// 检查点持久化后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// 仅进程内（测试 / 单次运行）
    #[default]
    Memory,
    /// 每个检查点一个 JSON 文件
    File,
    /// SQLite 键值表
    Sqlite,
}

/// [checkpoint] 段：有效期、后端与存储路径
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    /// 检查点有效期（秒），过期视为不存在
    #[serde(default = "default_checkpoint_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// file 后端为目录，sqlite 后端为数据库文件
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

fn default_checkpoint_ttl_secs() -> u64 {
    3600
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("workspace/checkpoints")
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_checkpoint_ttl_secs(),
            backend: CheckpointBackend::default(),
            path: default_checkpoint_path(),
        }
    }
}

/// [cache] 段：技能复杂度与模型价格缓存
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_skill_complexity_ttl_secs")]
    pub skill_complexity_ttl_secs: u64,
    #[serde(default = "default_pricing_ttl_secs")]
    pub pricing_ttl_secs: u64,
    /// 价格表离线副本（远端不可用时读取）
    pub pricing_disk_path: Option<PathBuf>,
    /// 价格表远端地址（返回 modelId -> 价格 的 JSON）
    pub pricing_url: Option<String>,
}

fn default_skill_complexity_ttl_secs() -> u64 {
    300
}

fn default_pricing_ttl_secs() -> u64 {
    3600
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            skill_complexity_ttl_secs: default_skill_complexity_ttl_secs(),
            pricing_ttl_secs: default_pricing_ttl_secs(),
            pricing_disk_path: None,
            pricing_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_limits() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestration.max_pipeline_depth, 5);
        assert_eq!(cfg.orchestration.max_pipeline_timeout_ms, 120_000);
        assert!((cfg.orchestration.max_cost_per_execution - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.orchestration.max_critic_rounds, 3);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.backoff_factor, 4);
        assert_eq!(cfg.checkpoint.ttl_secs, 3600);
        assert_eq!(cfg.checkpoint.backend, CheckpointBackend::Memory);
    }

    #[test]
    fn test_load_from_file_overrides_section() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(
            &path,
            "[orchestration]\nmax_cost_per_execution = 0.5\n\n[checkpoint]\nbackend = \"sqlite\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert!((cfg.orchestration.max_cost_per_execution - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.orchestration.max_pipeline_depth, 5);
        assert_eq!(cfg.checkpoint.backend, CheckpointBackend::Sqlite);
    }
}
