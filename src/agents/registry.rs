//! Agent 注册表
//!
//! 按名称索引 (描述符, 工厂)。discover 阶段对每个候选调用 is_available：
//! 不可用的 Agent 保留在索引中并标记 available = false，而不是静默丢弃，
//! 这样下游报告可以写出「工具 X 未安装，已跳过」。
//!
//! 索引是唯一被多个组件并发访问的可变状态：写（注册/发现）很少，读（筛选）很多，用读写锁。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::contract::{Agent, AgentDescriptor, Capability, CostClass, SpeedClass};

/// 构造 Agent 实例的工厂
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

struct Entry {
    descriptor: AgentDescriptor,
    factory: AgentFactory,
    instance: Option<Arc<dyn Agent>>,
}

/// 合取筛选条件；未设置的字段不参与筛选
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentFilter {
    pub language: Option<String>,
    /// Agent 至少声明其中一项能力；为空表示不限
    pub capabilities: Vec<Capability>,
    pub max_cost: Option<CostClass>,
    pub max_speed: Option<SpeedClass>,
    pub available_only: bool,
}

impl AgentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn max_cost(mut self, cost: CostClass) -> Self {
        self.max_cost = Some(cost);
        self
    }

    pub fn max_speed(mut self, speed: SpeedClass) -> Self {
        self.max_speed = Some(speed);
        self
    }

    pub fn available_only(mut self) -> Self {
        self.available_only = true;
        self
    }

    pub fn matches(&self, d: &AgentDescriptor) -> bool {
        if self.available_only && !d.available {
            return false;
        }
        if let Some(lang) = &self.language {
            if !d.supports_language(lang) {
                return false;
            }
        }
        if !self.capabilities.is_empty()
            && !self.capabilities.iter().any(|c| d.capabilities.contains(c))
        {
            return false;
        }
        if self.max_cost.is_some_and(|max| d.cost > max) {
            return false;
        }
        if self.max_speed.is_some_and(|max| d.speed > max) {
            return false;
        }
        true
    }
}

/// 发现结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    pub available: Vec<String>,
    pub unavailable: Vec<String>,
}

/// Agent 注册表（以显式所有权注入编排器，而非全局单例）
#[derive(Default)]
pub struct AgentRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册描述符与工厂；同名注册会替换旧条目
    pub fn register(&self, descriptor: AgentDescriptor, factory: AgentFactory) {
        let name = descriptor.name.clone();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&name) {
            tracing::debug!(agent = %name, "Replacing registered agent");
        }
        entries.insert(
            name,
            Entry {
                descriptor,
                factory,
                instance: None,
            },
        );
    }

    /// 注册已构造的 Agent
    pub fn register_agent(&self, agent: impl Agent + 'static) {
        let agent: Arc<dyn Agent> = Arc::new(agent);
        let descriptor = agent.describe();
        self.register(descriptor, Arc::new(move || Arc::clone(&agent)));
    }

    /// 对每个候选实例化并探测可用性，整体替换其描述符
    pub fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        for (name, entry) in entries.iter_mut() {
            let agent = (entry.factory)();
            let mut descriptor = agent.describe();
            descriptor.name = name.clone();
            descriptor.available = agent.is_available();

            if descriptor.available {
                report.available.push(name.clone());
            } else {
                tracing::warn!(agent = %name, "Agent unavailable, will be reported as skipped");
                report.unavailable.push(name.clone());
            }
            entry.descriptor = descriptor;
            entry.instance = Some(agent);
        }

        report.available.sort();
        report.unavailable.sort();
        tracing::info!(
            available = report.available.len(),
            unavailable = report.unavailable.len(),
            "Agent discovery finished"
        );
        report
    }

    /// 纯筛选：按速度等级（快在前）再按名称排序
    pub fn filter(&self, filter: &AgentFilter) -> Vec<AgentDescriptor> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<AgentDescriptor> = entries
            .values()
            .map(|e| &e.descriptor)
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.speed.cmp(&b.speed).then_with(|| a.name.cmp(&b.name)));
        matched
    }

    pub fn get(&self, name: &str) -> Option<AgentDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|e| e.descriptor.clone())
    }

    /// 取 Agent 实例：优先复用发现阶段创建的实例
    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn Agent>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(name)?;
        Some(
            entry
                .instance
                .clone()
                .unwrap_or_else(|| (entry.factory)()),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
