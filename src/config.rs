//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STINGER__*` 覆盖（双下划线表示嵌套，
//! 如 `STINGER__ORCHESTRATOR__MAX_CONCURRENCY=8`）。库本身不读文件，配置对象在构造时传入。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agents::CommandAgentConfig;
use crate::core::{OrchestratorConfig, SelectionCriteria};
use crate::findings::CorrelationConfig;
use crate::triage::TriageConfig;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StingerConfig {
    pub orchestrator: OrchestratorConfig,
    /// 默认选择条件
    pub selection: SelectionCriteria,
    pub correlation: CorrelationSection,
    pub triage: TriageConfig,
    /// [[agents]] 命令行工具包装
    pub agents: Vec<CommandAgentConfig>,
}

/// [correlation] 配置段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    pub enabled: bool,
    #[serde(flatten)]
    pub engine: CorrelationConfig,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: CorrelationConfig::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 STINGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（文件必须存在）
/// 3. 最后叠加环境变量 STINGER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<StingerConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STINGER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
