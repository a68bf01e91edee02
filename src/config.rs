//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__MAX_CONCURRENT=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub subagent: SubAgentSection,
}

/// [session] 段：主循环迭代上限、重规划上限、会话墙钟预算
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 反思后重新执行的最大迭代次数（含首次执行）
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 规划期错误触发的重规划次数上限；无内置默认值，由配置显式给出
    pub max_replans: u32,
    /// 会话墙钟预算（秒），超时后立即从现有终态汇总
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_session_timeout_secs() -> u64 {
    600
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            // 配置文件缺省时的兜底；config/default.toml 显式给出该值
            max_replans: 2,
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// [scheduler] 段：并发上限、重试与退避、单次子任务超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 同时运行的子任务数上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单个子任务的最大重试次数（瞬时故障或校验未通过）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避基础延迟（毫秒）；实际延迟 = base × 2^(retry-1)，封顶
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 退避延迟上限（毫秒）
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// 单次能力调用超时（秒）
    #[serde(default = "default_subtask_timeout_secs")]
    pub subtask_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_subtask_timeout_secs() -> u64 {
    60
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            subtask_timeout_secs: default_subtask_timeout_secs(),
        }
    }
}

/// [registry] 段：同时可见的能力 schema 预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    #[serde(default = "default_capability_budget")]
    pub capability_budget: usize,
}

fn default_capability_budget() -> usize {
    15
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            capability_budget: default_capability_budget(),
        }
    }
}

/// [checkpoint] 段：快照目录与每会话保留条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_checkpoint_retain")]
    pub retain: usize,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_checkpoint_retain() -> usize {
    20
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            retain: default_checkpoint_retain(),
        }
    }
}

/// [memory] 段：跨会话记忆（Semantic / Procedural）的存储目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    #[serde(default = "default_memory_dir")]
    pub dir: PathBuf,
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from("memory")
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
        }
    }
}

/// [subagent] 段：子智能体的时间与迭代预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubAgentSection {
    /// join 的等待上限（秒），超过则取消并返回 SubAgentTimeout
    #[serde(default = "default_subagent_timeout_secs")]
    pub timeout_secs: u64,
    /// 子智能体内部的最大步数
    #[serde(default = "default_subagent_max_iterations")]
    pub max_iterations: usize,
}

fn default_subagent_timeout_secs() -> u64 {
    120
}

fn default_subagent_max_iterations() -> usize {
    8
}

impl Default for SubAgentSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_subagent_timeout_secs(),
            max_iterations: default_subagent_max_iterations(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionSection::default(),
            scheduler: SchedulerSection::default(),
            registry: RegistrySection::default(),
            checkpoint: CheckpointSection::default(),
            memory: MemorySection::default(),
            subagent: SubAgentSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
