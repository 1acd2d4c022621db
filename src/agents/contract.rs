//! Agent 契约
//!
//! 每个分析工作者（静态分析、模糊测试、符号执行、形式化证明、LLM 分类器）实现 Agent：
//! describe（能力声明）、is_available（廉价无副作用探测）、analyze（阻塞式分析）。
//! analyze 可以从任意任务调用，应自行遵守传入的超时；编排器在外部另加硬性看门狗。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::findings::RawFinding;

/// 能力标签（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    StaticAnalysis,
    DynamicFuzzing,
    SymbolicExecution,
    FormalVerification,
    AiAnalysis,
    Linting,
}

/// 成本等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    Paid,
}

/// 速度等级：Fast < 10s，Medium < 10min，Slow 更久
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
    Fast,
    Medium,
    Slow,
}

impl SpeedClass {
    /// 在给定时间预算内能跑完的最慢等级
    pub fn ceiling_for_budget(budget: Duration) -> SpeedClass {
        if budget < Duration::from_secs(10) {
            SpeedClass::Fast
        } else if budget < Duration::from_secs(600) {
            SpeedClass::Medium
        } else {
            SpeedClass::Slow
        }
    }
}

/// Agent 元数据：发现后不再修改，重新发现时整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub cost: CostClass,
    pub speed: SpeedClass,
    /// 支持的输入语言（小写）；为空表示不限语言
    pub languages: Vec<String>,
    /// 发现阶段探测结果
    pub available: bool,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            cost: CostClass::Free,
            speed: SpeedClass::Medium,
            languages: Vec::new(),
            available: true,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_cost(mut self, cost: CostClass) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_speed(mut self, speed: SpeedClass) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into().to_lowercase());
        self
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// 分析目标：单个输入制品
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisTarget {
    pub path: PathBuf,
    /// 目标语言（如 solidity）；None 表示由 Agent 自行判断
    pub language: Option<String>,
}

impl AnalysisTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into().to_lowercase());
        self
    }

    /// 未显式指定时按扩展名推断
    pub fn infer_language(&self) -> Option<String> {
        if let Some(lang) = &self.language {
            return Some(lang.clone());
        }
        let ext = self.path.extension()?.to_str()?.to_lowercase();
        let lang = match ext.as_str() {
            "sol" => "solidity",
            "vy" => "vyper",
            "rs" => "rust",
            "go" => "go",
            "py" => "python",
            "c" | "h" => "c",
            "cpp" | "cc" | "hpp" => "cpp",
            "js" => "javascript",
            "ts" => "typescript",
            _ => return None,
        };
        Some(lang.to_string())
    }
}

/// Agent trait
#[async_trait]
pub trait Agent: Send + Sync {
    /// 静态元数据（available 字段由注册表在发现阶段覆盖）
    fn describe(&self) -> AgentDescriptor;

    /// 可用性探测：必须廉价且无副作用（例如检查可执行文件是否在 PATH 中）
    fn is_available(&self) -> bool {
        true
    }

    /// 分析目标，返回原始发现；由包装器负责把工具输出转成 RawFinding
    async fn analyze(
        &self,
        target: &AnalysisTarget,
        timeout: Duration,
    ) -> Result<Vec<RawFinding>, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_ceiling_for_budget() {
        assert_eq!(SpeedClass::ceiling_for_budget(Duration::from_secs(5)), SpeedClass::Fast);
        assert_eq!(SpeedClass::ceiling_for_budget(Duration::from_secs(120)), SpeedClass::Medium);
        assert_eq!(SpeedClass::ceiling_for_budget(Duration::from_secs(3600)), SpeedClass::Slow);
    }

    #[test]
    fn test_descriptor_language_support() {
        let any = AgentDescriptor::new("generic");
        assert!(any.supports_language("solidity"));

        let sol = AgentDescriptor::new("slither").with_language("Solidity");
        assert!(sol.supports_language("solidity"));
        assert!(!sol.supports_language("rust"));
    }

    #[test]
    fn test_target_language_inference() {
        assert_eq!(
            AnalysisTarget::new("contracts/Vault.sol").infer_language().as_deref(),
            Some("solidity")
        );
        assert_eq!(
            AnalysisTarget::new("main.rs").with_language("Move").infer_language().as_deref(),
            Some("move")
        );
        assert_eq!(AnalysisTarget::new("README").infer_language(), None);
    }

    #[test]
    fn test_capability_serde_kebab_case() {
        let json = serde_json::to_string(&Capability::SymbolicExecution).unwrap();
        assert_eq!(json, "\"symbolic-execution\"");
    }
}
