//! Client for the MCP Mesh registry.
//!
//! Handles fast heartbeat checks (HEAD requests), full heartbeat/registration
//! (POST requests), and unregistration (DELETE), plus response parsing for
//! topology updates.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::events::HealthStatus;
use crate::spec::AgentDeclaration;

/// Errors that can occur during registry communication.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry returned error: {status} - {message}")]
    RegistryError { status: u16, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result of a fast heartbeat check (HEAD request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastHeartbeatStatus {
    /// 200 OK - No topology changes.
    NoChanges,
    /// 202 Accepted - Topology changed, need full heartbeat.
    TopologyChanged,
    /// 410 Gone - Agent unknown, need to re-register.
    AgentUnknown,
    /// 503 Service Unavailable - Registry error.
    RegistryError,
    /// Network/connection error.
    NetworkError,
}

impl FastHeartbeatStatus {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            200 => Self::NoChanges,
            202 => Self::TopologyChanged,
            410 => Self::AgentUnknown,
            503 => Self::RegistryError,
            _ => Self::NetworkError,
        }
    }

    pub fn requires_full_heartbeat(&self) -> bool {
        matches!(self, Self::TopologyChanged | Self::AgentUnknown)
    }

    pub fn should_skip_for_resilience(&self) -> bool {
        matches!(self, Self::RegistryError | Self::NetworkError)
    }

    pub fn should_skip_for_optimization(&self) -> bool {
        matches!(self, Self::NoChanges)
    }
}

/// Resolved dependency information from a registry response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedDependency {
    pub agent_id: String,
    pub endpoint: String,
    pub function_name: String,
    pub capability: String,
    pub status: String,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Transport knobs (`streaming`, `session_required`, `full_mcp`,
    /// `timeout`, ...) the injector passes straight through to
    /// `proxy::build_proxy` so it picks the right `Proxy` variant for this
    /// dependency instead of always building a `BasicProxy`.
    #[serde(default)]
    pub kwargs: HashMap<String, serde_json::Value>,
}

/// Tool information returned for LLM agent functions.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmToolInfo {
    #[serde(rename = "name")]
    pub function_name: String,
    pub capability: String,
    pub endpoint: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

/// Resolved LLM provider information.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedLlmProvider {
    pub agent_id: String,
    pub endpoint: String,
    #[serde(rename = "name")]
    pub function_name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Full heartbeat response from the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub message: String,
    pub agent_id: String,
    #[serde(default)]
    pub dependencies_resolved: HashMap<String, Vec<ResolvedDependency>>,
    #[serde(default)]
    pub llm_tools: HashMap<String, Vec<LlmToolInfo>>,
    #[serde(default)]
    pub llm_providers: HashMap<String, ResolvedLlmProvider>,
}

/// Dependency registration for a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyRegistration {
    pub capability: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Tool registration for a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRegistration {
    pub function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRegistration>,
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub kwargs: HashMap<String, serde_json::Value>,
}

/// LLM function registration for a heartbeat request - distinct from tools,
/// since these are consumers of capabilities (and an LLM provider) rather
/// than providers of one.
#[derive(Debug, Clone, Serialize)]
pub struct LlmFunctionRegistration {
    pub function_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    pub filter_mode: String,
    pub provider: String,
    pub model: String,
    pub max_iterations: u32,
}

/// Full heartbeat request body.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    pub http_host: String,
    pub http_port: u16,
    pub namespace: String,
    pub status: String,
    pub tools: Vec<ToolRegistration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub llm_functions: Vec<LlmFunctionRegistration>,
}

impl HeartbeatRequest {
    /// Build a heartbeat request from an agent's full declaration.
    pub fn from_declaration(decl: &AgentDeclaration, health_status: HealthStatus) -> Self {
        let tools: Vec<ToolRegistration> = decl
            .tools
            .iter()
            .map(|t| ToolRegistration {
                function_name: t.function_name.clone(),
                capability: t.capability.clone(),
                version: t.version.clone(),
                tags: t.tags.clone(),
                description: t.description.clone(),
                dependencies: t
                    .dependencies
                    .iter()
                    .map(|d| DependencyRegistration {
                        capability: d.capability.clone(),
                        tags: d.tags.clone(),
                        version: d.version.clone(),
                    })
                    .collect(),
                input_schema: t.input_schema.clone(),
                kwargs: t.kwargs.clone(),
            })
            .collect();

        let llm_functions: Vec<LlmFunctionRegistration> = decl
            .llm_agents
            .iter()
            .map(|l| LlmFunctionRegistration {
                function_id: l.function_id.clone(),
                filter: l.filter.clone(),
                filter_mode: l.filter_mode.clone(),
                provider: l.provider.clone(),
                model: l.model.clone(),
                max_iterations: l.max_iterations,
            })
            .collect();

        Self {
            agent_id: decl.agent_id.clone(),
            name: Some(decl.name.clone()),
            version: decl.version.clone(),
            http_host: decl.http_host.clone(),
            http_port: decl.http_port,
            namespace: decl.namespace.clone(),
            status: health_status.as_api_str().to_string(),
            tools,
            llm_functions,
        }
    }
}

/// Client for communicating with the MCP Mesh registry.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(registry_url: &str) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let base_url = registry_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    /// Perform a fast heartbeat check (HEAD request). Returns the status
    /// indicating whether a full heartbeat is needed.
    pub async fn fast_heartbeat_check(&self, agent_id: &str) -> FastHeartbeatStatus {
        let url = format!("{}/heartbeat/{}", self.base_url, agent_id);

        trace!("sending fast heartbeat HEAD request to {}", url);

        match self.client.head(&url).send().await {
            Ok(response) => {
                let status = FastHeartbeatStatus::from_status_code(response.status().as_u16());
                debug!(
                    "fast heartbeat for agent '{}': HTTP {} -> {:?}",
                    agent_id,
                    response.status().as_u16(),
                    status
                );
                status
            }
            Err(e) => {
                warn!("fast heartbeat failed for agent '{}': {}", agent_id, e);
                FastHeartbeatStatus::NetworkError
            }
        }
    }

    /// Send a full heartbeat (POST request). Returns resolved dependencies
    /// and LLM tools/providers.
    pub async fn send_heartbeat(
        &self,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RegistryError> {
        let url = format!("{}/heartbeat", self.base_url);

        debug!("sending full heartbeat for agent '{}'", request.agent_id);
        if let Ok(json_str) = serde_json::to_string_pretty(request) {
            info!("heartbeat request JSON:\n{}", json_str);
        }
        trace!("heartbeat request: {:?}", request);

        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            info!("heartbeat response body:\n{}", body);

            let parsed: HeartbeatResponse = serde_json::from_str(&body)?;

            for (func_id, tools) in &parsed.llm_tools {
                info!(
                    "LLM tools for '{}': {} tools - {:?}",
                    func_id,
                    tools.len(),
                    tools.iter().map(|t| &t.function_name).collect::<Vec<_>>()
                );
            }

            info!(
                "heartbeat successful for agent '{}': {} dependencies, {} LLM tools, {} LLM providers",
                request.agent_id,
                parsed.dependencies_resolved.len(),
                parsed.llm_tools.len(),
                parsed.llm_providers.len()
            );

            Ok(parsed)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RegistryError::RegistryError {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    /// Send initial registration (same request shape as a heartbeat).
    pub async fn register(
        &self,
        decl: &AgentDeclaration,
        health_status: HealthStatus,
    ) -> Result<HeartbeatResponse, RegistryError> {
        let request = HeartbeatRequest::from_declaration(decl, health_status);
        self.send_heartbeat(&request).await
    }

    /// Unregister an agent (DELETE request), called during graceful
    /// shutdown so dependents see the topology change immediately instead
    /// of waiting for the agent's registration to expire.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);

        info!("unregistering agent '{}' from registry", agent_id);

        match self.client.delete(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.as_u16() == 404 {
                    info!("agent '{}' unregistered (HTTP {})", agent_id, status.as_u16());
                    Ok(())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "failed to unregister agent '{}': HTTP {} - {}",
                        agent_id,
                        status.as_u16(),
                        body
                    );
                    Err(RegistryError::RegistryError {
                        status: status.as_u16(),
                        message: body,
                    })
                }
            }
            Err(e) => {
                warn!("network error unregistering agent '{}': {}", agent_id, e);
                Err(RegistryError::Network(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{AgentType, DependencySpec, ToolDeclaration};
    use std::collections::HashMap as Map;

    fn declaration(tools: Vec<ToolDeclaration>) -> AgentDeclaration {
        AgentDeclaration {
            agent_id: "test-agent-aaaaaaaa".to_string(),
            name: "test-agent".to_string(),
            version: "1.0.0".to_string(),
            description: "Test".to_string(),
            registry_url: "http://localhost:8100".to_string(),
            http_host: "localhost".to_string(),
            http_port: 9000,
            enable_http: true,
            namespace: "default".to_string(),
            agent_type: AgentType::McpAgent,
            tools,
            llm_agents: vec![],
            health_interval: 5,
            auto_run: true,
            auto_run_interval: 10,
        }
    }

    #[test]
    fn fast_heartbeat_status_maps_http_codes() {
        assert_eq!(FastHeartbeatStatus::from_status_code(200), FastHeartbeatStatus::NoChanges);
        assert_eq!(
            FastHeartbeatStatus::from_status_code(202),
            FastHeartbeatStatus::TopologyChanged
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(410),
            FastHeartbeatStatus::AgentUnknown
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(503),
            FastHeartbeatStatus::RegistryError
        );
        assert_eq!(FastHeartbeatStatus::from_status_code(500), FastHeartbeatStatus::NetworkError);
    }

    #[test]
    fn fast_heartbeat_status_decisions() {
        assert!(FastHeartbeatStatus::NoChanges.should_skip_for_optimization());
        assert!(!FastHeartbeatStatus::NoChanges.requires_full_heartbeat());

        assert!(FastHeartbeatStatus::TopologyChanged.requires_full_heartbeat());
        assert!(!FastHeartbeatStatus::TopologyChanged.should_skip_for_optimization());

        assert!(FastHeartbeatStatus::NetworkError.should_skip_for_resilience());
        assert!(FastHeartbeatStatus::RegistryError.should_skip_for_resilience());
    }

    #[test]
    fn heartbeat_request_carries_tool_and_dependency_shape() {
        let decl = declaration(vec![ToolDeclaration {
            function_id: "m::greet".to_string(),
            function_name: "greet".to_string(),
            capability: Some("greeting".to_string()),
            tags: vec!["utility".to_string()],
            version: "1.0.0".to_string(),
            dependencies: vec![DependencySpec::new("date-service".to_string(), None, None)],
            description: Some("Greeting tool".to_string()),
            input_schema: None,
            kwargs: Map::new(),
        }]);

        let request = HeartbeatRequest::from_declaration(&decl, HealthStatus::Healthy);

        assert_eq!(request.agent_id, "test-agent-aaaaaaaa");
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].function_name, "greet");
        assert_eq!(request.tools[0].capability, Some("greeting".to_string()));
        assert_eq!(request.tools[0].dependencies[0].capability, "date-service");
    }
}
