//! Declaration types produced by the `#[mesh::tool]`, `#[mesh::agent]`, and
//! `#[mesh::llm]` attribute macros, plus the resolved counterparts the
//! registry hands back once dependencies are satisfied.
//!
//! These mirror the original decorator metadata one to one: a
//! `ToolDeclaration` is what `@mesh.tool(...)` used to capture, an
//! `AgentDeclaration` is what `@mesh.agent(...)` used to capture, and so on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capability a tool or LLM function depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencySpec {
    /// Capability name to depend on.
    pub capability: String,

    /// Tags for filtering (e.g. `["+fast", "-deprecated"]`).
    pub tags: Vec<String>,

    /// Version constraint (e.g. `">=2.0.0"`).
    pub version: Option<String>,
}

impl DependencySpec {
    pub fn new(capability: String, tags: Option<Vec<String>>, version: Option<String>) -> Self {
        Self {
            capability,
            tags: tags.unwrap_or_default(),
            version,
        }
    }
}

/// Declaration captured by `#[mesh::tool(...)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Stable identifier (`module_path::fn_name`), used as the injector's
    /// lookup key and the registry's `function_name` for this tool.
    pub function_id: String,

    /// Bare function name, as advertised over `tools/list`.
    pub function_name: String,

    /// Capability name for discovery. `None` means this tool is exposed
    /// under its function name only and cannot be depended on by capability.
    pub capability: Option<String>,

    /// Tags for filtering.
    pub tags: Vec<String>,

    /// Capability version.
    pub version: String,

    /// Dependencies this tool needs injected.
    pub dependencies: Vec<DependencySpec>,

    /// Human-readable description, surfaced in `tools/list`.
    pub description: Option<String>,

    /// JSON Schema for input parameters, if derivable from the function
    /// signature. Left `None` when the macro cannot infer one; callers can
    /// fill it in at registration time.
    pub input_schema: Option<serde_json::Value>,

    /// Arbitrary decorator kwargs that don't map to a named field.
    pub kwargs: HashMap<String, serde_json::Value>,
}

/// Raw metadata captured by `#[mesh::agent(...)]` before config resolution.
#[derive(Debug, Clone)]
pub struct AgentDeclarationInput {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub http_host: Option<String>,
    pub http_port: u16,
    pub enable_http: bool,
    pub namespace: String,
    pub health_interval: u64,
    pub auto_run: bool,
    pub auto_run_interval: u64,
}

/// Agent type for registration with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// MCP agent that provides capabilities (tools) to the mesh.
    #[default]
    McpAgent,
    /// API service that only consumes capabilities (e.g. FastAPI, Express).
    Api,
}

impl AgentType {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::McpAgent => "mcp_agent",
            Self::Api => "api",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "api" => Self::Api,
            _ => Self::McpAgent,
        }
    }
}

/// Fully resolved agent declaration: `AgentDeclarationInput` plus every knob
/// resolved through `resolve_config` (ENV > decorator param > default) and
/// an agent id stable for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeclaration {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub registry_url: String,
    pub http_host: String,
    pub http_port: u16,
    pub enable_http: bool,
    pub namespace: String,
    #[serde(default)]
    pub agent_type: AgentType,
    pub tools: Vec<ToolDeclaration>,
    pub llm_agents: Vec<LlmDeclaration>,
    pub health_interval: u64,
    pub auto_run: bool,
    pub auto_run_interval: u64,
}

impl AgentDeclaration {
    /// Capabilities required across every tool and LLM function this agent
    /// declares, deduplicated and sorted for deterministic heartbeat bodies.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .tools
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| d.capability.clone()))
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Declaration captured by `#[mesh::llm(...)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDeclaration {
    /// Stable identifier (`module_path::fn_name`).
    pub function_id: String,

    /// Tool filter expression: a capability name, a `{capability, tags}`
    /// mapping, a list of either, or `"*"`. Kept as a raw `serde_json::Value`
    /// rather than a typed enum since the registry accepts (and must echo
    /// back byte-identical) whatever shape the decorator was given.
    pub filter: Option<serde_json::Value>,

    /// Filter mode: `"all"`, `"best_match"`, or `"*"`.
    pub filter_mode: String,

    /// Provider selector (e.g. `"openai"`, `"anthropic"`).
    pub provider: String,

    /// Model identifier (e.g. `"gpt-4"`).
    pub model: String,

    /// API key override; usually left `None` and resolved from config.
    pub api_key: Option<String>,

    /// Maximum agentic loop iterations before `MaxIterationsError`.
    pub max_iterations: u32,

    /// System prompt override; `None` falls back to a rendered template or
    /// the config-resolved default.
    pub system_prompt: Option<String>,

    /// Jinja-free template path; rendering happens via the `Template` trait
    /// in `llm_agent`, not a templating crate, since the only interpolation
    /// needed is a flat context map.
    pub template_path: Option<String>,

    /// Name of the Rust type the final LLM response is parsed into. Stored
    /// as a string because macros only see syntax, not resolved types; the
    /// injector binds this to a `ResponseParser` instance at wrapper
    /// construction time.
    pub output_type_name: String,

    /// Name of the function parameter that receives the injected
    /// `MeshLlmAgent`.
    pub param_name: String,
}

/// A resolved tool available to an LLM agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTool {
    pub function_name: String,
    pub capability: String,
    pub endpoint: String,
    pub input_schema: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(function_id: &str, capability: &str, deps: Vec<&str>) -> ToolDeclaration {
        ToolDeclaration {
            function_id: function_id.to_string(),
            function_name: function_id.to_string(),
            capability: Some(capability.to_string()),
            tags: vec![],
            version: "1.0.0".to_string(),
            dependencies: deps
                .into_iter()
                .map(|d| DependencySpec::new(d.to_string(), None, None))
                .collect(),
            description: None,
            input_schema: None,
            kwargs: HashMap::new(),
        }
    }

    #[test]
    fn agent_type_round_trips_through_api_string() {
        assert_eq!(AgentType::from_str("api"), AgentType::Api);
        assert_eq!(AgentType::from_str("API"), AgentType::Api);
        assert_eq!(AgentType::from_str("mcp_agent"), AgentType::McpAgent);
        assert_eq!(AgentType::McpAgent.as_api_str(), "mcp_agent");
        assert_eq!(AgentType::Api.as_api_str(), "api");
    }

    #[test]
    fn all_dependencies_dedupes_and_sorts_across_tools() {
        let decl = AgentDeclaration {
            agent_id: "test-agent-aaaaaaaa".to_string(),
            name: "test-agent".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            registry_url: "http://localhost:8000".to_string(),
            http_host: "localhost".to_string(),
            http_port: 0,
            enable_http: true,
            namespace: "default".to_string(),
            agent_type: AgentType::McpAgent,
            tools: vec![
                tool("m::func1", "cap1", vec!["weather-service", "date-service"]),
                tool("m::func2", "cap2", vec!["date-service"]),
            ],
            llm_agents: vec![],
            health_interval: 5,
            auto_run: true,
            auto_run_interval: 10,
        };

        assert_eq!(decl.all_dependencies(), vec!["date-service", "weather-service"]);
    }
}
