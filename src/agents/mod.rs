//! Agent 层：契约、注册表与外部命令包装器

pub mod command;
pub mod contract;
pub mod registry;

pub use command::{find_executable, parse_wrapper_output, CommandAgent, CommandAgentConfig};
pub use contract::{Agent, AgentDescriptor, AnalysisTarget, Capability, CostClass, SpeedClass};
pub use registry::{AgentFactory, AgentFilter, AgentRegistry, DiscoveryReport};

