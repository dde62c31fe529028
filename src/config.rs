//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__PARALLELISM=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub web: WebSection,
}

/// [orchestrator] 段：并发度、超时、重试与候选数
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单个计划内同时在飞的步骤数上限
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// 单步超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// 整个计划超时（秒）
    #[serde(default = "default_plan_timeout_secs")]
    pub plan_timeout_secs: u64,
    /// 单次查询端到端超时（秒，含分析与合成）
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// 同一会话排队查询上限，超出返回 SessionBusy
    #[serde(default = "default_max_queued_queries")]
    pub max_queued_queries_per_session: usize,
    /// 规划器保留的候选工具数
    #[serde(default = "default_candidate_top_k")]
    pub candidate_top_k: usize,
    /// 单步瞬时错误重试预算
    #[serde(default = "default_retry_budget")]
    pub retry_budget_per_step: u32,
    /// 是否将执行结果写回工具遥测
    #[serde(default = "default_enable_tool_learning")]
    pub enable_tool_learning: bool,
    /// 空计划 / 合成失败时是否走 LLM 兜底叙述
    #[serde(default = "default_llm_fallback_enabled")]
    pub llm_fallback_enabled: bool,
    /// 取消后等待在飞步骤退出的宽限期（秒）
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// 关闭时等待活跃查询结束的宽限期（秒）
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_parallelism() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_plan_timeout_secs() -> u64 {
    120
}

fn default_query_timeout_secs() -> u64 {
    150
}

fn default_max_queued_queries() -> usize {
    4
}

fn default_candidate_top_k() -> usize {
    8
}

fn default_retry_budget() -> u32 {
    2
}

fn default_enable_tool_learning() -> bool {
    true
}

fn default_llm_fallback_enabled() -> bool {
    true
}

fn default_cancel_grace_secs() -> u64 {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            step_timeout_secs: default_step_timeout_secs(),
            plan_timeout_secs: default_plan_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            max_queued_queries_per_session: default_max_queued_queries(),
            candidate_top_k: default_candidate_top_k(),
            retry_budget_per_step: default_retry_budget(),
            enable_tool_learning: default_enable_tool_learning(),
            llm_fallback_enabled: default_llm_fallback_enabled(),
            cancel_grace_secs: default_cancel_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// [session] 段：空闲过期、清扫间隔与快照目录
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 会话空闲多久被逐出（秒）
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// 清扫定时器间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 快照目录，未设置时不落盘
    pub snapshot_dir: Option<PathBuf>,
    /// 历史保留轮数（user+assistant 为一轮）
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_idle_ttl_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    900
}

fn default_max_turns() -> usize {
    20
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            snapshot_dir: None,
            max_turns: default_max_turns(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：openai 兼容端点 / mock；无 API Key 时自动回落 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// analyze 调用超时（秒）
    #[serde(default = "default_analyze_timeout_secs")]
    pub analyze_timeout_secs: u64,
    /// synthesize 调用超时（秒）
    #[serde(default = "default_synthesize_timeout_secs")]
    pub synthesize_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_analyze_timeout_secs() -> u64 {
    15
}

fn default_synthesize_timeout_secs() -> u64 {
    60
}

/// [web] 段：hive-web 服务端口（可被环境变量 HIVE__WEB__PORT 覆盖）
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_web_port() -> u16 {
    8080
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

/// 就近查找默认配置文件：工作目录、上一级、裸文件名，取第一个存在的
fn default_config_file() -> Option<PathBuf> {
    ["config/default.toml", "../config/default.toml", "default.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// 装配配置：默认文件 → 显式传入的文件 → 环境变量 HIVE__*，后者覆盖前者
/// （双下划线表示嵌套键，如 `HIVE__LLM__MODEL`）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let files = default_config_file()
        .into_iter()
        .chain(config_path.into_iter().filter(|p| p.is_file()));

    files
        .fold(config::Config::builder(), |builder, path| {
            builder.add_source(config::File::from(path).required(false))
        })
        .add_source(
            config::Environment::with_prefix("HIVE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.parallelism, 4);
        assert_eq!(cfg.orchestrator.step_timeout_secs, 30);
        assert_eq!(cfg.orchestrator.candidate_top_k, 8);
        assert_eq!(cfg.session.idle_ttl_secs, 1800);
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("HIVE__ORCHESTRATOR__PARALLELISM", "9");
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.orchestrator.parallelism, 9);
        std::env::remove_var("HIVE__ORCHESTRATOR__PARALLELISM");
    }
}
