//! 外部命令 Agent：按配置运行一个分析工具包装脚本
//!
//! 包装脚本负责把工具原生输出转成 JSON（RawFinding 数组，或 {"findings": [...]}）写到 stdout；
//! 这里不解析任何工具的原生格式。记录逐条解码，单条类型错误只让该条在规范化时被拒绝。子进程以 kill_on_drop 启动，编排器放弃调用时进程随之被杀掉。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::contract::{Agent, AgentDescriptor, AnalysisTarget, Capability, CostClass, SpeedClass};
use super::registry::AgentRegistry;
use crate::core::AgentError;
use crate::findings::RawFinding;

/// 参数中的目标路径占位符
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// [[agents]] 配置段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAgentConfig {
    pub name: String,
    /// 可执行文件名（在 PATH 中查找）或路径
    pub command: String,
    /// 参数；`{target}` 会被替换为目标路径，若没有占位符则目标路径追加在末尾
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_cost")]
    pub cost: CostClass,
    #[serde(default = "default_speed")]
    pub speed: SpeedClass,
    #[serde(default)]
    pub languages: Vec<String>,
}

fn default_cost() -> CostClass {
    CostClass::Free
}

fn default_speed() -> SpeedClass {
    SpeedClass::Medium
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WrapperOutput {
    List(Vec<serde_json::Value>),
    Wrapped { findings: Vec<serde_json::Value> },
}

/// 运行外部命令的 Agent
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: CommandAgentConfig,
}

impl CommandAgent {
    pub fn new(config: CommandAgentConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, target: &Path) -> Vec<String> {
        let target = target.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| {
                if a.contains(TARGET_PLACEHOLDER) {
                    substituted = true;
                    a.replace(TARGET_PLACEHOLDER, &target)
                } else {
                    a.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(target.into_owned());
        }
        args
    }
}

impl AgentRegistry {
    /// 注册配置中的外部命令 Agent（随后由 discover 探测可用性）
    pub fn register_commands(&self, configs: &[CommandAgentConfig]) {
        for config in configs {
            let descriptor = CommandAgent::new(config.clone()).describe();
            let config = config.clone();
            self.register(
                descriptor,
                Arc::new(move || Arc::new(CommandAgent::new(config.clone())) as Arc<dyn Agent>),
            );
        }
    }
}

/// 在 PATH 中查找可执行文件；含路径分隔符的命令直接检查文件是否存在
pub fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

/// 解析包装脚本的 stdout
pub fn parse_wrapper_output(stdout: &str) -> Result<Vec<RawFinding>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<WrapperOutput>(trimmed) {
        Ok(WrapperOutput::List(records)) | Ok(WrapperOutput::Wrapped { findings: records }) => {
            Ok(RawFinding::from_json_records(records))
        }
        Err(e) => Err(format!("invalid wrapper output: {}", e)),
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn describe(&self) -> AgentDescriptor {
        let mut descriptor = AgentDescriptor::new(&self.config.name)
            .with_cost(self.config.cost)
            .with_speed(self.config.speed);
        for capability in &self.config.capabilities {
            descriptor = descriptor.with_capability(*capability);
        }
        for language in &self.config.languages {
            descriptor = descriptor.with_language(language);
        }
        descriptor
    }

    fn is_available(&self) -> bool {
        find_executable(&self.config.command).is_some()
    }

    async fn analyze(
        &self,
        target: &AnalysisTarget,
        timeout: Duration,
    ) -> Result<Vec<RawFinding>, AgentError> {
        let start = Instant::now();
        let child = Command::new(&self.config.command)
            .args(self.build_args(&target.path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Execution(format!("spawn '{}': {}", self.config.command, e)))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AgentError::Execution(e.to_string())),
            Err(_) => {
                return Err(AgentError::Timeout {
                    agent: self.config.name.clone(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_wrapper_output(&stdout) {
            Ok(findings) => {
                tracing::debug!(
                    agent = %self.config.name,
                    exit = ?output.status.code(),
                    findings = findings.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Command agent finished"
                );
                Ok(findings)
            }
            Err(parse_error) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let excerpt: String = stderr.trim().chars().take(300).collect();
                Err(AgentError::Execution(format!(
                    "{} (exit {:?}): {}",
                    parse_error,
                    output.status.code(),
                    excerpt
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, args: &[&str]) -> CommandAgentConfig {
        CommandAgentConfig {
            name: "wrapper".to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            capabilities: vec![Capability::StaticAnalysis],
            cost: CostClass::Free,
            speed: SpeedClass::Fast,
            languages: vec!["Solidity".to_string()],
        }
    }

    #[test]
    fn test_describe_from_config() {
        let agent = CommandAgent::new(config("slither", &[]));
        let d = agent.describe();
        assert_eq!(d.name, "wrapper");
        assert!(d.capabilities.contains(&Capability::StaticAnalysis));
        assert_eq!(d.languages, vec!["solidity"]);
    }

    #[test]
    fn test_target_placeholder_substitution() {
        let agent = CommandAgent::new(config("tool", &["--json", "--input={target}"]));
        assert_eq!(
            agent.build_args(Path::new("a.sol")),
            vec!["--json", "--input=a.sol"]
        );
        let agent = CommandAgent::new(config("tool", &["--json"]));
        assert_eq!(agent.build_args(Path::new("a.sol")), vec!["--json", "a.sol"]);
    }

    #[test]
    fn test_missing_executable_unavailable() {
        let agent = CommandAgent::new(config("definitely-not-a-real-tool-7f3a", &[]));
        assert!(!agent.is_available());
    }

    #[test]
    fn test_register_commands_flags_missing_tools() {
        let registry = AgentRegistry::new();
        let mut missing = config("definitely-not-a-real-tool-7f3a", &[]);
        missing.name = "ghost".to_string();
        registry.register_commands(&[missing]);
        let report = registry.discover();
        assert_eq!(report.unavailable, vec!["ghost"]);
        assert!(!registry.get("ghost").unwrap().available);
    }

    #[test]
    fn test_parse_wrapper_output_shapes() {
        let list = parse_wrapper_output(r#"[{"type": "reentrancy", "file": "a.sol", "line": 4}]"#).unwrap();
        assert_eq!(list.len(), 1);
        let wrapped = parse_wrapper_output(r#"{"findings": []}"#).unwrap();
        assert!(wrapped.is_empty());
        assert!(parse_wrapper_output("").unwrap().is_empty());
        assert!(parse_wrapper_output("Traceback (most recent call last)").is_err());
    }

    #[test]
    fn test_bad_record_keeps_rest_of_batch() {
        let raw = parse_wrapper_output(
            r#"[{"type":"reentrancy","file":"a.sol","line":4},{"type":"overflow","file":"a.sol","line":"12"}]"#,
        )
        .unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].line, Some(4));
        assert!(raw[0].undecodable.is_none());
        assert!(raw[1].undecodable.is_some());

        let wrapped = parse_wrapper_output(r#"{"findings": [{"type":"x","file":"a.sol","line":-1}]}"#).unwrap();
        assert!(wrapped[0].undecodable.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_wrapper_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("wrapper.sh");
        std::fs::write(
            &script,
            "echo '[{\"type\": \"tx-origin\", \"file\": \"'\"$1\"'\", \"line\": 7}]'\n",
        )
        .unwrap();

        let agent = CommandAgent::new(config("sh", &[script.to_str().unwrap(), "{target}"]));
        assert!(agent.is_available());
        let findings = agent
            .analyze(&AnalysisTarget::new("Vault.sol"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(findings[0].file.as_deref(), Some("Vault.sol"));
        assert_eq!(findings[0].line, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wrapper_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "sleep 5\n").unwrap();

        let agent = CommandAgent::new(config("sh", &[script.to_str().unwrap()]));
        let err = agent
            .analyze(&AnalysisTarget::new("Vault.sol"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
    }
}
