//! Agent runtime - the background task that drives heartbeats and topology.
//!
//! The runtime:
//! - Runs in a background tokio task
//! - Drives the heartbeat state machine
//! - Publishes events to the embedding application via a channel
//! - Tracks topology changes and emits dependency/LLM events on change

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{info, trace, warn};

use crate::config::{resolve_config_int, ConfigKey, UpdateStrategy};
use crate::events::{LlmProviderInfo, LlmToolInfo, MeshEvent};
use crate::handle::HandleState;
use crate::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatStateMachine};
use crate::injector::Injector;
use crate::proxy;
use crate::proxy::Proxy;
use crate::registry::{HeartbeatRequest, HeartbeatResponse, RegistryClient};
use crate::spec::AgentDeclaration;

/// Internal provider tracking, kept separate from the public event type so
/// the runtime doesn't need to rebuild an `LlmProviderInfo` just to diff it.
#[derive(Debug, Clone)]
struct TrackedProvider {
    #[allow(dead_code)]
    function_id: String,
    #[allow(dead_code)]
    agent_id: String,
    endpoint: String,
    function_name: String,
    #[allow(dead_code)]
    model: Option<String>,
}

/// Configuration for the agent runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Heartbeat configuration
    pub heartbeat: HeartbeatConfig,
    /// Event channel buffer size
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            event_buffer_size: 100,
        }
    }
}

/// Topology state - tracks current dependency endpoints.
#[derive(Debug, Default)]
struct TopologyState {
    /// Current dependencies (capability -> (endpoint, function_name, agent_id))
    dependencies: HashMap<String, (String, String, String)>,
    /// LLM tools (function_id -> tools)
    llm_tools: HashMap<String, Vec<LlmToolInfo>>,
    /// LLM providers (function_id -> provider info)
    llm_providers: HashMap<String, TrackedProvider>,
}

/// The agent runtime that runs in the background.
pub struct AgentRuntime {
    declaration: AgentDeclaration,
    config: RuntimeConfig,
    registry_client: RegistryClient,
    state_machine: HeartbeatStateMachine,
    topology: TopologyState,
    event_tx: mpsc::Sender<MeshEvent>,
    shared_state: Arc<RwLock<HandleState>>,
    shutdown_rx: mpsc::Receiver<()>,
    injector: Arc<Injector>,
}

impl AgentRuntime {
    /// Create a new agent runtime.
    pub fn new(
        declaration: AgentDeclaration,
        config: RuntimeConfig,
        event_tx: mpsc::Sender<MeshEvent>,
        shared_state: Arc<RwLock<HandleState>>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<Self, crate::registry::RegistryError> {
        let registry_client = RegistryClient::new(&declaration.registry_url)?;
        let heartbeat_config = HeartbeatConfig {
            interval: Duration::from_secs(declaration.health_interval),
            ..config.heartbeat.clone()
        };
        let state_machine = HeartbeatStateMachine::new(heartbeat_config);

        let strategy = UpdateStrategy::resolve(None);
        let grace_period_ms = resolve_config_int(ConfigKey::UpdateGracePeriodMs, None).unwrap_or(250);
        let injector = Arc::new(Injector::new(strategy, Duration::from_millis(grace_period_ms as u64)));

        Ok(Self {
            declaration,
            config,
            registry_client,
            state_machine,
            topology: TopologyState::default(),
            event_tx,
            shared_state,
            shutdown_rx,
            injector,
        })
    }

    /// Shared handle to the positional dependency injector backing every
    /// locally declared tool. The embedding application reads this once at
    /// startup to register its tool wrappers' `DependencySet`s; the runtime
    /// keeps the slots fed from heartbeat responses for as long as it runs.
    pub fn injector(&self) -> Arc<Injector> {
        self.injector.clone()
    }

    /// Run the agent runtime loop.
    ///
    /// This is the main entry point that runs until shutdown is requested.
    pub async fn run(mut self) {
        info!("starting agent runtime for '{}'", self.declaration.name);

        for tool in &self.declaration.tools {
            self.injector
                .register_function(&tool.function_id, tool.dependencies.clone())
                .await;
        }

        for llm in &self.declaration.llm_agents {
            self.injector.register_llm_function(&llm.function_id).await;
        }

        loop {
            // Check for shutdown signal (non-blocking)
            if self.shutdown_rx.try_recv().is_ok() {
                info!("shutdown signal received");
                self.state_machine.shutdown();
            }

            if self.state_machine.is_shutting_down() {
                // Gracefully unregister from registry before stopping
                self.unregister_from_registry().await;
                break;
            }

            // Determine next action
            let action = self.state_machine.next_action();
            trace!("next action: {:?}", action);

            match action {
                HeartbeatAction::SendFull => {
                    self.send_full_heartbeat().await;
                }
                HeartbeatAction::SendFast => {
                    self.send_fast_heartbeat().await;
                }
                HeartbeatAction::Wait(duration) => {
                    trace!("waiting {:?} until next heartbeat", duration);
                    tokio::select! {
                        _ = sleep(duration) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("shutdown signal received during wait");
                            self.state_machine.shutdown();
                        }
                    }
                }
                HeartbeatAction::Retry { attempt, backoff } => {
                    warn!("retry attempt {} with backoff {:?}", attempt, backoff);
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("shutdown signal received during backoff");
                            self.state_machine.shutdown();
                        }
                    }
                    // After backoff, try full registration
                    self.send_full_heartbeat().await;
                }
                HeartbeatAction::None => {
                    break;
                }
            }
        }

        // Send shutdown event
        let _ = self.event_tx.send(MeshEvent::shutdown()).await;
        info!("agent runtime for '{}' stopped", self.declaration.name);
    }

    /// Unregister the agent from the registry during shutdown.
    ///
    /// This ensures immediate topology update for dependent agents
    /// instead of waiting for the heartbeat timeout.
    async fn unregister_from_registry(&self) {
        let agent_id = &self.declaration.agent_id;
        info!("unregistering agent '{}' from registry", agent_id);

        match self.registry_client.unregister_agent(agent_id).await {
            Ok(()) => {
                info!("agent '{}' unregistered successfully", agent_id);
            }
            Err(e) => {
                // Log but don't fail shutdown - network issues shouldn't block shutdown
                warn!(
                    "failed to unregister agent '{}' (continuing shutdown): {}",
                    agent_id, e
                );
            }
        }
    }

    /// Send a fast heartbeat check (HEAD request).
    async fn send_fast_heartbeat(&mut self) {
        let agent_id = self.declaration.agent_id.clone();
        let status = self.registry_client.fast_heartbeat_check(&agent_id).await;

        let action = self.state_machine.on_fast_heartbeat_result(status);

        // If we need a full heartbeat, do it now
        if action == HeartbeatAction::SendFull {
            self.send_full_heartbeat().await;
        }
    }

    /// Send a full heartbeat (POST request).
    async fn send_full_heartbeat(&mut self) {
        let request =
            HeartbeatRequest::from_declaration(&self.declaration, self.state_machine.health_status());

        match self.registry_client.send_heartbeat(&request).await {
            Ok(response) => {
                self.state_machine.on_full_heartbeat_success();

                // Update shared state with agent ID
                {
                    let mut state = self.shared_state.write().await;
                    state.agent_id = Some(response.agent_id.clone());
                }

                // Process topology changes
                self.process_heartbeat_response(response).await;

                // Send registration event if this was first successful registration
                if self.state_machine.heartbeat_count() == 1 {
                    let _ = self
                        .event_tx
                        .send(MeshEvent::agent_registered(self.declaration.agent_id.clone()))
                        .await;
                }
            }
            Err(e) => {
                self.state_machine.on_full_heartbeat_failure(&e.to_string());

                // Send error event
                let _ = self
                    .event_tx
                    .send(MeshEvent::registration_failed(e.to_string()))
                    .await;
            }
        }
    }

    /// Process a heartbeat response and emit topology change events.
    async fn process_heartbeat_response(&mut self, response: HeartbeatResponse) {
        // Process dependency changes
        self.process_dependency_changes(&response.dependencies_resolved)
            .await;

        // Process LLM tools changes
        self.process_llm_tools_changes(&response.llm_tools).await;

        // Process LLM provider changes
        self.process_llm_providers_changes(&response.llm_providers)
            .await;
    }

    /// Process dependency resolution changes and emit events.
    ///
    /// This method batches state updates to minimize lock contention.
    async fn process_dependency_changes(
        &mut self,
        resolved: &HashMap<String, Vec<crate::registry::ResolvedDependency>>,
    ) {
        self.process_injector_updates(resolved).await;

        let mut new_deps = HashMap::new();

        // The registry returns dependencies keyed by the function that needs
        // them, but each provider carries the actual capability name. A
        // function can depend on multiple capabilities at once.
        for (_requesting_func, providers) in resolved {
            for provider in providers
                .iter()
                .filter(|p| p.status == "available" || p.status == "healthy")
            {
                new_deps.insert(
                    provider.capability.clone(),
                    (
                        provider.endpoint.clone(),
                        provider.function_name.clone(),
                        provider.agent_id.clone(),
                    ),
                );
            }
        }

        // Collect all changes first (before acquiring any locks)
        let mut removed_caps: Vec<String> = Vec::new();
        let mut added_or_changed: Vec<(String, String, String, String, bool)> = Vec::new();

        // Find removed dependencies
        let old_caps: Vec<String> = self.topology.dependencies.keys().cloned().collect();
        for cap in old_caps {
            if !new_deps.contains_key(&cap) {
                info!("dependency '{}' removed", cap);
                removed_caps.push(cap);
            }
        }

        // Find new or changed dependencies
        for (cap, (endpoint, func_name, agent_id)) in &new_deps {
            let changed = match self.topology.dependencies.get(cap) {
                Some((old_ep, old_fn, _)) => old_ep != endpoint || old_fn != func_name,
                None => true,
            };

            if changed {
                let is_new = !self.topology.dependencies.contains_key(cap);
                if is_new {
                    info!("dependency '{}' available at {} ({})", cap, endpoint, func_name);
                } else {
                    info!("dependency '{}' changed to {} ({})", cap, endpoint, func_name);
                }
                added_or_changed.push((
                    cap.clone(),
                    endpoint.clone(),
                    func_name.clone(),
                    agent_id.clone(),
                    is_new,
                ));
            }
        }

        // Batch update shared state (single lock acquisition)
        if !removed_caps.is_empty() || !added_or_changed.is_empty() {
            let mut state = self.shared_state.write().await;
            for cap in &removed_caps {
                state.dependencies.remove(cap);
            }
            for (cap, endpoint, _, _, _) in &added_or_changed {
                state.dependencies.insert(cap.clone(), endpoint.clone());
            }
        }

        // Update local topology and emit events (no lock needed)
        for cap in removed_caps {
            let _ = self
                .event_tx
                .send(MeshEvent::dependency_unavailable(cap.clone()))
                .await;
            self.topology.dependencies.remove(&cap);
        }

        for (cap, endpoint, func_name, agent_id, is_new) in added_or_changed {
            let event = if is_new {
                MeshEvent::dependency_available(
                    cap.clone(),
                    endpoint.clone(),
                    func_name.clone(),
                    agent_id.clone(),
                )
            } else {
                MeshEvent::dependency_changed(
                    cap.clone(),
                    endpoint.clone(),
                    func_name.clone(),
                    agent_id.clone(),
                )
            };
            let _ = self.event_tx.send(event).await;

            self.topology
                .dependencies
                .insert(cap, (endpoint, func_name, agent_id));
        }
    }

    /// Feed the registry's per-function resolved-dependency arrays into the
    /// positional injector. The registry returns each function's providers
    /// in the same order its `DependencySpec` list was declared, so a
    /// provider's position in the array is its slot index - this is what
    /// lets three dependencies on the same capability resolve to three
    /// distinct proxies instead of collapsing into one.
    async fn process_injector_updates(
        &self,
        resolved: &HashMap<String, Vec<crate::registry::ResolvedDependency>>,
    ) {
        for tool in &self.declaration.tools {
            let Some(providers) = resolved.get(&tool.function_id) else {
                continue;
            };

            for (index, spec) in tool.dependencies.iter().enumerate() {
                let provider = providers.get(index).filter(|p| {
                    (p.status == "available" || p.status == "healthy") && p.capability == spec.capability
                });

                let proxy = match provider {
                    Some(p) => match proxy::build_proxy(p.endpoint.clone(), p.function_name.clone(), &p.kwargs)
                    {
                        Ok(proxy) => Some(Arc::from(proxy)),
                        Err(e) => {
                            warn!(
                                "failed to build proxy for {}[{}] ({}): {}",
                                tool.function_id, index, p.endpoint, e
                            );
                            continue;
                        }
                    },
                    None => None,
                };

                if let Err(e) = self.injector.update_dependency(&tool.function_id, index, proxy).await {
                    warn!("failed to update injector slot {}[{}]: {}", tool.function_id, index, e);
                }
            }
        }
    }

    /// Check if two LlmToolInfo lists are equivalent.
    fn tools_are_equal(old: &[LlmToolInfo], new: &[LlmToolInfo]) -> bool {
        if old.len() != new.len() {
            return false;
        }

        for (old_tool, new_tool) in old.iter().zip(new.iter()) {
            if old_tool.function_name != new_tool.function_name
                || old_tool.capability != new_tool.capability
                || old_tool.endpoint != new_tool.endpoint
                || old_tool.agent_id != new_tool.agent_id
                || old_tool.input_schema != new_tool.input_schema
            {
                return false;
            }
        }
        true
    }

    /// Process LLM tools changes and emit events.
    async fn process_llm_tools_changes(
        &mut self,
        llm_tools: &HashMap<String, Vec<crate::registry::LlmToolInfo>>,
    ) {
        for (function_id, tools) in llm_tools {
            let tool_infos: Vec<LlmToolInfo> = tools
                .iter()
                .map(|t| LlmToolInfo {
                    function_name: t.function_name.clone(),
                    capability: t.capability.clone(),
                    endpoint: t.endpoint.clone(),
                    agent_id: t.agent_id.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect();

            let changed = match self.topology.llm_tools.get(function_id) {
                Some(old_tools) => !Self::tools_are_equal(old_tools, &tool_infos),
                None => true,
            };

            if changed {
                info!(
                    "LLM tools updated for function '{}': {} tools",
                    function_id,
                    tool_infos.len()
                );

                let resolved_tools: Vec<crate::spec::ResolvedTool> = tools
                    .iter()
                    .map(|t| crate::spec::ResolvedTool {
                        function_name: t.function_name.clone(),
                        capability: t.capability.clone(),
                        endpoint: t.endpoint.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect();

                let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
                for t in tools {
                    match proxy::build_proxy(t.endpoint.clone(), t.function_name.clone(), &HashMap::new()) {
                        Ok(proxy) => {
                            proxies.insert(t.function_name.clone(), Arc::from(proxy));
                        }
                        Err(e) => {
                            warn!(
                                "failed to build proxy for LLM tool '{}' ({}): {}",
                                t.function_name, t.endpoint, e
                            );
                        }
                    }
                }

                self.injector
                    .update_llm_tools(function_id, resolved_tools, proxies)
                    .await;

                let _ = self
                    .event_tx
                    .send(MeshEvent::llm_tools_updated(
                        function_id.clone(),
                        tool_infos.clone(),
                    ))
                    .await;

                self.topology
                    .llm_tools
                    .insert(function_id.clone(), tool_infos);
            }
        }
    }

    /// Process LLM provider changes and emit events.
    async fn process_llm_providers_changes(
        &mut self,
        llm_providers: &HashMap<String, crate::registry::ResolvedLlmProvider>,
    ) {
        for (function_id, provider) in llm_providers {
            let tracked = TrackedProvider {
                function_id: function_id.clone(),
                agent_id: provider.agent_id.clone(),
                endpoint: provider.endpoint.clone(),
                function_name: provider.function_name.clone(),
                model: provider.model.clone(),
            };

            let changed = match self.topology.llm_providers.get(function_id) {
                Some(old_provider) => {
                    old_provider.endpoint != tracked.endpoint
                        || old_provider.function_name != tracked.function_name
                }
                None => true,
            };

            if changed {
                info!(
                    "LLM provider resolved for function '{}': {} at {}",
                    function_id, tracked.function_name, tracked.endpoint
                );

                self.topology
                    .llm_providers
                    .insert(function_id.clone(), tracked.clone());

                let provider_info = LlmProviderInfo {
                    function_id: function_id.clone(),
                    agent_id: provider.agent_id.clone(),
                    endpoint: provider.endpoint.clone(),
                    function_name: provider.function_name.clone(),
                    model: provider.model.clone(),
                };

                self.injector
                    .update_llm_provider(function_id, provider_info.clone())
                    .await;

                let _ = self
                    .event_tx
                    .send(MeshEvent::llm_provider_available(provider_info))
                    .await;
            }
        }
    }
}
