//! Events pushed from the agent runtime to anything observing it (the HTTP
//! surface's own logging, the debounce coordinator, integration tests).
//!
//! Consumers drain an `AgentHandle`'s event channel and update their own
//! state from it rather than polling the runtime directly.

use serde::{Deserialize, Serialize};

/// Type of mesh event. Serializes to snake_case strings so logs and any
/// external consumer see stable identifiers across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    RegistrationFailed,
    DependencyAvailable,
    DependencyUnavailable,
    DependencyChanged,
    LlmToolsUpdated,
    HealthCheckDue,
    HealthStatusChanged,
    RegistryConnected,
    RegistryDisconnected,
    #[default]
    Shutdown,
    LlmProviderAvailable,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "agent_registered",
            EventType::RegistrationFailed => "registration_failed",
            EventType::DependencyAvailable => "dependency_available",
            EventType::DependencyUnavailable => "dependency_unavailable",
            EventType::DependencyChanged => "dependency_changed",
            EventType::LlmToolsUpdated => "llm_tools_updated",
            EventType::HealthCheckDue => "health_check_due",
            EventType::HealthStatusChanged => "health_status_changed",
            EventType::RegistryConnected => "registry_connected",
            EventType::RegistryDisconnected => "registry_disconnected",
            EventType::Shutdown => "shutdown",
            EventType::LlmProviderAvailable => "llm_provider_available",
        }
    }
}

/// Health status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Convert to registry API status string.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::Healthy
    }
}

/// Provider info carried by an `llm_provider_available` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderInfo {
    pub function_id: String,
    pub agent_id: String,
    pub endpoint: String,
    pub function_name: String,
    pub model: Option<String>,
}

/// Tool info carried by an `llm_tools_updated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolInfo {
    pub function_name: String,
    pub capability: String,
    pub endpoint: String,
    pub agent_id: String,
    pub input_schema: Option<serde_json::Value>,
}

/// Events emitted by the agent runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshEvent {
    pub event_type: EventType,

    pub capability: Option<String>,
    pub endpoint: Option<String>,
    pub function_name: Option<String>,
    pub agent_id: Option<String>,

    pub function_id: Option<String>,
    pub tools: Option<Vec<LlmToolInfo>>,

    pub provider_info: Option<LlmProviderInfo>,

    pub error: Option<String>,
    pub status: Option<HealthStatus>,
    pub reason: Option<String>,
}

impl MeshEvent {
    pub fn agent_registered(agent_id: String) -> Self {
        Self {
            event_type: EventType::AgentRegistered,
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn registration_failed(error: String) -> Self {
        Self {
            event_type: EventType::RegistrationFailed,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn dependency_available(
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
    ) -> Self {
        Self {
            event_type: EventType::DependencyAvailable,
            capability: Some(capability),
            endpoint: Some(endpoint),
            function_name: Some(function_name),
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn dependency_unavailable(capability: String) -> Self {
        Self {
            event_type: EventType::DependencyUnavailable,
            capability: Some(capability),
            ..Default::default()
        }
    }

    /// Endpoint or target function changed for an already-resolved dependency.
    pub fn dependency_changed(
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
    ) -> Self {
        Self {
            event_type: EventType::DependencyChanged,
            capability: Some(capability),
            endpoint: Some(endpoint),
            function_name: Some(function_name),
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn llm_tools_updated(function_id: String, tools: Vec<LlmToolInfo>) -> Self {
        Self {
            event_type: EventType::LlmToolsUpdated,
            function_id: Some(function_id),
            tools: Some(tools),
            ..Default::default()
        }
    }

    pub fn health_check_due() -> Self {
        Self {
            event_type: EventType::HealthCheckDue,
            ..Default::default()
        }
    }

    pub fn health_status_changed(status: HealthStatus) -> Self {
        Self {
            event_type: EventType::HealthStatusChanged,
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn registry_connected() -> Self {
        Self {
            event_type: EventType::RegistryConnected,
            ..Default::default()
        }
    }

    pub fn registry_disconnected(reason: String) -> Self {
        Self {
            event_type: EventType::RegistryDisconnected,
            reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn shutdown() -> Self {
        Self {
            event_type: EventType::Shutdown,
            ..Default::default()
        }
    }

    pub fn llm_provider_available(provider_info: LlmProviderInfo) -> Self {
        Self {
            event_type: EventType::LlmProviderAvailable,
            provider_info: Some(provider_info),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_available_event_carries_routing_fields() {
        let event = MeshEvent::dependency_available(
            "date-service".to_string(),
            "http://localhost:9001".to_string(),
            "get_date".to_string(),
            "date-service-abc123".to_string(),
        );

        assert_eq!(event.event_type, EventType::DependencyAvailable);
        assert_eq!(event.event_type.as_str(), "dependency_available");
        assert_eq!(event.capability, Some("date-service".to_string()));
        assert_eq!(event.endpoint, Some("http://localhost:9001".to_string()));
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&EventType::DependencyAvailable).unwrap();
        assert_eq!(json, "\"dependency_available\"");

        let json = serde_json::to_string(&EventType::LlmToolsUpdated).unwrap();
        assert_eq!(json, "\"llm_tools_updated\"");

        let event_type: EventType = serde_json::from_str("\"agent_registered\"").unwrap();
        assert_eq!(event_type, EventType::AgentRegistered);
    }

    #[test]
    fn event_type_as_str_covers_all_variants() {
        assert_eq!(EventType::AgentRegistered.as_str(), "agent_registered");
        assert_eq!(EventType::DependencyChanged.as_str(), "dependency_changed");
        assert_eq!(EventType::LlmProviderAvailable.as_str(), "llm_provider_available");
        assert_eq!(EventType::Shutdown.as_str(), "shutdown");
    }

    #[test]
    fn health_status_api_strings() {
        assert_eq!(HealthStatus::Healthy.as_api_str(), "healthy");
        assert_eq!(HealthStatus::Degraded.as_api_str(), "degraded");
        assert_eq!(HealthStatus::Unhealthy.as_api_str(), "unhealthy");
    }
}
