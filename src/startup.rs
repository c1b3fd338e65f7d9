//! One-shot startup pipeline.
//!
//! Runs exactly once per process, after the debounce coordinator decides
//! the import-time burst of `#[mesh::*]` registrations has gone quiet:
//! discover decorators, resolve the agent declaration, send the first
//! heartbeat, bring up the HTTP surface if requested, and spawn the
//! background heartbeat loop if requested. A failure registering with the
//! registry leaves the agent running standalone rather than aborting -
//! only a failed HTTP server bring-up is fatal, since that's a misconfigured
//! bind address the operator needs to see immediately.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::config::{resolve_config, resolve_config_bool, resolve_config_int, ConfigKey};
use crate::decorator::DecoratorRegistry;
use crate::events::HealthStatus;
use crate::handle::{AgentHandle, HandleState};
use crate::registry::RegistryClient;
use crate::runtime::{AgentRuntime, RuntimeConfig};
use crate::signal::ShutdownManager;
use crate::spec::{AgentDeclaration, AgentDeclarationInput, AgentType};

/// Generates the random suffix used to build a fresh agent id each process
/// start (`{name}-{8-hex}`). Exposed as a trait so tests can supply a
/// deterministic id instead of `uuid`'s random one.
pub trait AgentIdSuffix: Send + Sync {
    fn suffix(&self) -> String;
}

pub struct RandomSuffix;

impl AgentIdSuffix for RandomSuffix {
    fn suffix(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

/// Resolve a raw `#[mesh::agent]` capture (or built-in defaults if no
/// `#[mesh::agent]` was ever declared) into a fully resolved
/// `AgentDeclaration`, applying ENV > decorator-param > default precedence
/// to every knob and minting a fresh agent id for this process.
pub fn resolve_agent_declaration(
    input: Option<&AgentDeclarationInput>,
    registry: &DecoratorRegistry,
    suffix_source: &dyn AgentIdSuffix,
) -> AgentDeclaration {
    let default_input = AgentDeclarationInput {
        name: "mcp-mesh-agent".to_string(),
        version: "1.0.0".to_string(),
        description: None,
        http_host: None,
        http_port: 0,
        enable_http: true,
        namespace: "default".to_string(),
        health_interval: 5,
        auto_run: true,
        auto_run_interval: 10,
    };
    let input = input.unwrap_or(&default_input);

    let name = resolve_config(ConfigKey::AgentName, Some(input.name.as_str())).unwrap_or(input.name.clone());
    let registry_url = resolve_config(ConfigKey::RegistryUrl, None).unwrap_or_default();
    let http_host = resolve_config(ConfigKey::HttpHost, input.http_host.as_deref())
        .unwrap_or_else(crate::config::auto_detect_external_ip);
    let http_port = resolve_config_int(ConfigKey::HttpPort, Some(input.http_port as i64))
        .map(|p| p as u16)
        .unwrap_or(input.http_port);
    let enable_http = resolve_config_bool(ConfigKey::EnableHttp, Some(input.enable_http));
    let namespace =
        resolve_config(ConfigKey::Namespace, Some(input.namespace.as_str())).unwrap_or(input.namespace.clone());
    let health_interval = resolve_config_int(ConfigKey::HealthInterval, Some(input.health_interval as i64))
        .map(|v| v as u64)
        .unwrap_or(input.health_interval);
    let auto_run = resolve_config_bool(ConfigKey::AutoRun, Some(input.auto_run));
    let auto_run_interval = resolve_config_int(ConfigKey::AutoRunInterval, Some(input.auto_run_interval as i64))
        .map(|v| v as u64)
        .unwrap_or(input.auto_run_interval);

    let agent_id = format!("{}-{}", name, suffix_source.suffix());

    let mut tools: Vec<_> = registry.tools().cloned().collect();
    tools.sort_by(|a, b| a.function_id.cmp(&b.function_id));
    let mut llm_agents: Vec<_> = registry.llm_agents().cloned().collect();
    llm_agents.sort_by(|a, b| a.function_id.cmp(&b.function_id));

    AgentDeclaration {
        agent_id,
        name,
        version: input.version.clone(),
        description: input.description.clone().unwrap_or_default(),
        registry_url,
        http_host,
        http_port,
        enable_http,
        namespace,
        agent_type: AgentType::McpAgent,
        tools,
        llm_agents,
        health_interval,
        auto_run,
        auto_run_interval,
    }
}

/// Result of running the startup pipeline: the handle embedding
/// applications interact with, plus the shutdown manager so callers can
/// register extra cleanup and the background task handles for a later
/// graceful join.
pub struct StartedAgent {
    pub handle: AgentHandle,
    pub shutdown_manager: Arc<ShutdownManager>,
    pub heartbeat_task: Option<tokio::task::JoinHandle<()>>,
}

/// Run the one-shot startup pipeline for `declaration`. Step 3 (initial
/// heartbeat) failing is logged and does not prevent the rest of the
/// pipeline from running; step 4 is not handled here - HTTP server bring-up
/// is left to the embedding `http_server` module, which the caller should
/// invoke (and treat a bind failure as fatal) immediately after this
/// returns if `declaration.enable_http` is set.
pub async fn run_startup_pipeline(
    declaration: AgentDeclaration,
    runtime_config: RuntimeConfig,
) -> StartedAgent {
    info!("starting agent '{}' (id={})", declaration.name, declaration.agent_id);

    let shutdown_manager = Arc::new(ShutdownManager::new(crate::signal::DEFAULT_SHUTDOWN_DEADLINE));
    let (event_tx, event_rx) = mpsc::channel(runtime_config.event_buffer_size);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let shared_state = Arc::new(RwLock::new(HandleState {
        dependencies: Default::default(),
        health_status: HealthStatus::Healthy,
        shutdown_requested: false,
        agent_id: Some(declaration.agent_id.clone()),
    }));

    let handle = AgentHandle::new(event_rx, shared_state.clone(), shutdown_tx.clone());

    // Step 3: one full heartbeat, best-effort.
    match RegistryClient::new(&declaration.registry_url) {
        Ok(client) => match client.register(&declaration, HealthStatus::Healthy).await {
            Ok(_) => {
                info!("initial registration succeeded for agent '{}'", declaration.agent_id);
            }
            Err(e) => {
                warn!(
                    "initial registration failed for agent '{}' ({}); continuing in standalone mode",
                    declaration.agent_id, e
                );
            }
        },
        Err(e) => {
            warn!("could not build registry client ({}); continuing in standalone mode", e);
        }
    }

    // Step 5: spawn the background heartbeat loop if auto_run is set.
    let heartbeat_task = if declaration.auto_run {
        match AgentRuntime::new(
            declaration.clone(),
            runtime_config,
            event_tx,
            shared_state.clone(),
            shutdown_rx,
        ) {
            Ok(runtime) => Some(tokio::spawn(runtime.run())),
            Err(e) => {
                error!("failed to construct agent runtime: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Step 6: install signal handlers.
    shutdown_manager.install_signal_handlers(shutdown_tx);

    StartedAgent { handle, shutdown_manager, heartbeat_task }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSuffix(&'static str);
    impl AgentIdSuffix for FixedSuffix {
        fn suffix(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn resolves_defaults_when_no_agent_declaration_was_captured() {
        let registry = DecoratorRegistry::default();
        let decl = resolve_agent_declaration(None, &registry, &FixedSuffix("aaaaaaaa"));

        assert_eq!(decl.agent_id, "mcp-mesh-agent-aaaaaaaa");
        assert_eq!(decl.namespace, "default");
        assert!(decl.tools.is_empty());
    }

    #[test]
    fn sorts_tools_and_llm_agents_for_deterministic_ordering() {
        let mut registry = DecoratorRegistry::default();
        registry.insert_tool(crate::spec::ToolDeclaration {
            function_id: "m::zeta".to_string(),
            function_name: "zeta".to_string(),
            capability: None,
            tags: vec![],
            version: "1.0.0".to_string(),
            dependencies: vec![],
            description: None,
            input_schema: None,
            kwargs: Default::default(),
        });
        registry.insert_tool(crate::spec::ToolDeclaration {
            function_id: "m::alpha".to_string(),
            function_name: "alpha".to_string(),
            capability: None,
            tags: vec![],
            version: "1.0.0".to_string(),
            dependencies: vec![],
            description: None,
            input_schema: None,
            kwargs: Default::default(),
        });

        let decl = resolve_agent_declaration(None, &registry, &FixedSuffix("bbbbbbbb"));
        assert_eq!(decl.tools[0].function_id, "m::alpha");
        assert_eq!(decl.tools[1].function_id, "m::zeta");
    }
}
