//! Dependency injector.
//!
//! Each tool function declares an ordered list of dependencies
//! (`DependencySpec`), and the injector holds one slot per declared
//! dependency per function. A slot is a single `Arc<dyn Proxy>` (or empty);
//! tool wrappers read the current snapshot on every invocation instead of
//! capturing a proxy once, so a topology change is visible on the very next
//! call without the wrapper being rebuilt. Because slots are addressed by
//! `(function_id, position)` rather than by capability name, three
//! dependencies on the same capability in one function's signature resolve
//! to three distinct slots instead of collapsing into one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::UpdateStrategy;
use crate::error::InjectorError;
use crate::events::LlmProviderInfo;
use crate::llm_agent::{LlmConfig, LlmTransport, MeshLlmAgent};
use crate::proxy::Proxy;
use crate::spec::{DependencySpec, ResolvedTool};

/// Live, clonable view of one function's injected dependencies. Cloning is
/// cheap (an `Arc` bump); every clone observes the same underlying slots.
#[derive(Clone)]
pub struct DependencySet {
    slots: Arc<RwLock<Vec<Option<Arc<dyn Proxy>>>>>,
}

impl DependencySet {
    fn new(len: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new((0..len).map(|_| None).collect())),
        }
    }

    /// Read the proxy currently bound to `index`, or `None` if that
    /// dependency has never resolved (or was removed from the topology).
    pub async fn get(&self, index: usize) -> Option<Arc<dyn Proxy>> {
        self.slots.read().await.get(index).cloned().flatten()
    }

    /// Snapshot of every slot, in declared order. `None` entries mean the
    /// wrapper must treat that positional argument as absent - the injector
    /// always preserves array length, even for unresolved dependencies.
    pub async fn snapshot(&self) -> Vec<Option<Arc<dyn Proxy>>> {
        self.slots.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    async fn set(&self, index: usize, proxy: Option<Arc<dyn Proxy>>) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(index) {
            *slot = proxy;
        }
    }
}

/// Per-function bookkeeping: its declared dependency list (read-only after
/// registration) plus the live `DependencySet` backing it.
struct Wrapper {
    dependencies: Vec<DependencySpec>,
    set: DependencySet,
}

/// Live, atomically-swapped ingredients for one `#[mesh::llm]` function's
/// agent: its resolved tool palette, bound proxies, and provider endpoint.
/// `MeshLlmAgent` is generic over its output type, which only the call site
/// knows (the macro only ever sees a type name as a string), so the
/// injector can't construct the agent itself - it hands the call site a
/// snapshot of everything needed to build one, read and replaced as a
/// whole so a reader never observes a half-updated tool set.
#[derive(Clone)]
pub struct LlmSlot {
    state: Arc<RwLock<LlmSlotState>>,
}

#[derive(Clone, Default)]
struct LlmSlotState {
    tools: Vec<ResolvedTool>,
    proxies: HashMap<String, Arc<dyn Proxy>>,
    provider: Option<LlmProviderInfo>,
}

impl LlmSlot {
    fn new() -> Self {
        Self { state: Arc::new(RwLock::new(LlmSlotState::default())) }
    }

    /// Current tools, proxies, and provider, taken together under one read
    /// lock so they can't be observed mid-update.
    pub async fn snapshot(&self) -> (Vec<ResolvedTool>, HashMap<String, Arc<dyn Proxy>>, Option<LlmProviderInfo>) {
        let state = self.state.read().await;
        (state.tools.clone(), state.proxies.clone(), state.provider.clone())
    }

    async fn set_tools(&self, tools: Vec<ResolvedTool>, proxies: HashMap<String, Arc<dyn Proxy>>) {
        let mut state = self.state.write().await;
        state.tools = tools;
        state.proxies = proxies;
    }

    async fn set_provider(&self, provider: LlmProviderInfo) {
        self.state.write().await.provider = Some(provider);
    }
}

/// Tracks an in-flight delayed update so a later update to the same slot can
/// supersede and cancel it before the grace period elapses.
type Generation = u64;

/// Owns every function's dependency slots and the update strategy used when
/// the registry reports a new resolution for a slot.
pub struct Injector {
    wrappers: RwLock<HashMap<String, Wrapper>>,
    /// Fallback store for proxies resolved before their wrapper exists yet
    /// (e.g. a dependency arrives in a heartbeat response ahead of the local
    /// tool registration that will consume it), keyed by `function_id:index`.
    global_store: RwLock<HashMap<String, Arc<dyn Proxy>>>,
    generations: Arc<RwLock<HashMap<String, Generation>>>,
    strategy: UpdateStrategy,
    grace_period: Duration,
    llm_slots: RwLock<HashMap<String, LlmSlot>>,
}

fn slot_key(function_id: &str, index: usize) -> String {
    format!("{function_id}:{index}")
}

impl Injector {
    pub fn new(strategy: UpdateStrategy, grace_period: Duration) -> Self {
        Self {
            wrappers: RwLock::new(HashMap::new()),
            global_store: RwLock::new(HashMap::new()),
            generations: Arc::new(RwLock::new(HashMap::new())),
            strategy,
            grace_period,
            llm_slots: RwLock::new(HashMap::new()),
        }
    }

    /// Register a function's declared dependency list, creating its slots.
    /// Idempotent per `function_id` - re-registering with the same
    /// dependency count keeps the existing `DependencySet` (and whatever is
    /// already injected into it) rather than resetting it to empty.
    pub async fn register_function(&self, function_id: &str, dependencies: Vec<DependencySpec>) -> DependencySet {
        let mut wrappers = self.wrappers.write().await;
        if let Some(existing) = wrappers.get(function_id) {
            if existing.dependencies.len() == dependencies.len() {
                return existing.set.clone();
            }
        }

        let set = DependencySet::new(dependencies.len());
        wrappers.insert(
            function_id.to_string(),
            Wrapper {
                dependencies,
                set: set.clone(),
            },
        );
        set
    }

    pub async fn dependency_set(&self, function_id: &str) -> Option<DependencySet> {
        self.wrappers.read().await.get(function_id).map(|w| w.set.clone())
    }

    /// Update one positional slot. This is the single entry point the
    /// heartbeat pipeline calls once per `(function_id, index)` pair that
    /// changed in a resolved-dependencies response.
    pub async fn update_dependency(
        &self,
        function_id: &str,
        index: usize,
        proxy: Option<Arc<dyn Proxy>>,
    ) -> Result<(), InjectorError> {
        let set = match self.wrappers.read().await.get(function_id) {
            Some(w) => {
                if index >= w.dependencies.len() {
                    return Err(InjectorError::IndexOutOfRange {
                        function_id: function_id.to_string(),
                        index,
                        len: w.dependencies.len(),
                    });
                }
                w.set.clone()
            }
            None => {
                // No local wrapper yet; stash it so a later registration can
                // pick it up from the global store.
                let key = slot_key(function_id, index);
                match &proxy {
                    Some(p) => {
                        self.global_store.write().await.insert(key, p.clone());
                    }
                    None => {
                        self.global_store.write().await.remove(&key);
                    }
                }
                return Ok(());
            }
        };

        match self.strategy {
            UpdateStrategy::Immediate => {
                set.set(index, proxy).await;
                debug!("applied immediate update to {}[{}]", function_id, index);
            }
            UpdateStrategy::Manual => {
                let key = slot_key(function_id, index);
                match &proxy {
                    Some(p) => {
                        self.global_store.write().await.insert(key, p.clone());
                    }
                    None => {
                        self.global_store.write().await.remove(&key);
                    }
                }
                info!(
                    "update strategy is manual; {}[{}] staged but not applied",
                    function_id, index
                );
            }
            UpdateStrategy::Delayed => {
                let key = slot_key(function_id, index);
                let generation = {
                    let mut generations = self.generations.write().await;
                    let next = generations.get(&key).copied().unwrap_or(0) + 1;
                    generations.insert(key.clone(), next);
                    next
                };

                let grace_period = self.grace_period;
                let generations_store = self.generations.clone();
                let set = set.clone();
                let function_id = function_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    let still_current = generations_store
                        .read()
                        .await
                        .get(&key)
                        .copied()
                        .map(|g| g == generation)
                        .unwrap_or(false);
                    if still_current {
                        set.set(index, proxy).await;
                        debug!("applied delayed update to {}[{}]", function_id, index);
                    } else {
                        debug!(
                            "delayed update to {}[{}] was superseded before its grace period elapsed",
                            function_id, index
                        );
                    }
                });
            }
        }

        Ok(())
    }

    /// Apply any proxies staged in the global store (by `update_dependency`
    /// before a wrapper existed, or by a manual-strategy caller) to a
    /// function's slots. Used right after `register_function` so dependency
    /// resolutions that raced ahead of tool registration aren't lost.
    pub async fn apply_staged(&self, function_id: &str) {
        let set = match self.dependency_set(function_id).await {
            Some(set) => set,
            None => return,
        };
        let len = set.len().await;
        let mut store = self.global_store.write().await;
        for index in 0..len {
            let key = slot_key(function_id, index);
            if let Some(proxy) = store.remove(&key) {
                set.set(index, Some(proxy)).await;
            }
        }
    }

    /// Apply a manual-strategy caller's request to push all currently staged
    /// updates for a function into its live slots.
    pub async fn apply_manual(&self, function_id: &str) {
        if !matches!(self.strategy, UpdateStrategy::Manual) {
            warn!("apply_manual called but update strategy is not manual; applying anyway");
        }
        self.apply_staged(function_id).await;
    }

    /// Register an `#[mesh::llm]` function's slot, creating it empty if
    /// this is the first time it's seen. Idempotent - safe to call again on
    /// every topology change.
    pub async fn register_llm_function(&self, function_id: &str) -> LlmSlot {
        let mut slots = self.llm_slots.write().await;
        slots.entry(function_id.to_string()).or_insert_with(LlmSlot::new).clone()
    }

    pub async fn llm_slot(&self, function_id: &str) -> Option<LlmSlot> {
        self.llm_slots.read().await.get(function_id).cloned()
    }

    /// Swap in a new resolved tool palette and bound proxies for an LLM
    /// function, replacing the previous set atomically.
    pub async fn update_llm_tools(
        &self,
        function_id: &str,
        tools: Vec<ResolvedTool>,
        proxies: HashMap<String, Arc<dyn Proxy>>,
    ) {
        let slot = self.register_llm_function(function_id).await;
        slot.set_tools(tools, proxies).await;
    }

    /// Record the LLM provider endpoint resolved for this function.
    pub async fn update_llm_provider(&self, function_id: &str, provider: LlmProviderInfo) {
        let slot = self.register_llm_function(function_id).await;
        slot.set_provider(provider).await;
    }

    /// Build a `MeshLlmAgent` from the slot's current snapshot. Returns
    /// `None` if `function_id` was never registered - callers only reach
    /// this after their own `#[mesh::llm]` function has registered, so a
    /// `None` here means a caller used the wrong function id.
    pub async fn build_llm_agent<T: DeserializeOwned>(
        &self,
        function_id: &str,
        config: LlmConfig,
        transport: Arc<dyn LlmTransport>,
        output_schema: Option<Value>,
    ) -> Option<MeshLlmAgent<T>> {
        let slot = self.llm_slot(function_id).await?;
        let (tools, proxies, _provider) = slot.snapshot().await;
        Some(MeshLlmAgent::new(config, tools, proxies, transport, output_schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ContentBlock;
    use async_trait::async_trait;
    use serde_json::Value;

    struct StubProxy {
        endpoint: String,
        function_name: String,
    }

    #[async_trait]
    impl Proxy for StubProxy {
        async fn call(&self, _arguments: Value) -> Result<Vec<ContentBlock>, crate::error::ProxyError> {
            Ok(vec![ContentBlock::Text(self.endpoint.clone())])
        }
        fn endpoint(&self) -> &str {
            &self.endpoint
        }
        fn function_name(&self) -> &str {
            &self.function_name
        }
    }

    fn stub(endpoint: &str) -> Arc<dyn Proxy> {
        Arc::new(StubProxy {
            endpoint: endpoint.to_string(),
            function_name: "get_time".to_string(),
        })
    }

    fn deps(n: usize) -> Vec<DependencySpec> {
        (0..n)
            .map(|_| DependencySpec::new("time-service".to_string(), None, None))
            .collect()
    }

    #[tokio::test]
    async fn duplicate_capability_dependencies_resolve_to_distinct_positional_slots() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));
        let set = injector.register_function("m::multi_time", deps(3)).await;

        injector
            .update_dependency("m::multi_time", 0, Some(stub("http://time-a:9001")))
            .await
            .unwrap();
        injector
            .update_dependency("m::multi_time", 1, Some(stub("http://time-b:9002")))
            .await
            .unwrap();
        injector
            .update_dependency("m::multi_time", 2, Some(stub("http://time-c:9003")))
            .await
            .unwrap();

        let snapshot = set.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].as_ref().unwrap().endpoint(), "http://time-a:9001");
        assert_eq!(snapshot[1].as_ref().unwrap().endpoint(), "http://time-b:9002");
        assert_eq!(snapshot[2].as_ref().unwrap().endpoint(), "http://time-c:9003");

        injector.update_dependency("m::multi_time", 1, None).await.unwrap();
        let snapshot = set.snapshot().await;
        assert!(snapshot[0].is_some());
        assert!(snapshot[1].is_none());
        assert!(snapshot[2].is_some());
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));
        injector.register_function("m::one_dep", deps(1)).await;

        let err = injector
            .update_dependency("m::one_dep", 5, Some(stub("http://x:1")))
            .await
            .unwrap_err();
        assert!(matches!(err, InjectorError::IndexOutOfRange { index: 5, len: 1, .. }));
    }

    #[tokio::test]
    async fn manual_strategy_stages_without_applying_until_asked() {
        let injector = Injector::new(UpdateStrategy::Manual, Duration::from_millis(50));
        let set = injector.register_function("m::manual_dep", deps(1)).await;

        injector
            .update_dependency("m::manual_dep", 0, Some(stub("http://staged:1")))
            .await
            .unwrap();
        assert!(set.get(0).await.is_none());

        injector.apply_manual("m::manual_dep").await;
        assert_eq!(set.get(0).await.unwrap().endpoint(), "http://staged:1");
    }

    #[tokio::test]
    async fn delayed_update_applies_after_grace_period() {
        let injector = Injector::new(UpdateStrategy::Delayed, Duration::from_millis(20));
        let set = injector.register_function("m::delayed_dep", deps(1)).await;

        injector
            .update_dependency("m::delayed_dep", 0, Some(stub("http://delayed:1")))
            .await
            .unwrap();
        assert!(set.get(0).await.is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(set.get(0).await.unwrap().endpoint(), "http://delayed:1");
    }

    #[tokio::test]
    async fn superseding_delayed_update_cancels_the_earlier_one() {
        let injector = Injector::new(UpdateStrategy::Delayed, Duration::from_millis(40));
        let set = injector.register_function("m::superseded_dep", deps(1)).await;

        injector
            .update_dependency("m::superseded_dep", 0, Some(stub("http://first:1")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        injector
            .update_dependency("m::superseded_dep", 0, Some(stub("http://second:1")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(set.get(0).await.unwrap().endpoint(), "http://second:1");
    }

    #[tokio::test]
    async fn staged_global_updates_apply_once_a_wrapper_registers() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));
        // Resolution arrives before the function is registered locally.
        injector
            .update_dependency("m::not_yet_registered", 0, Some(stub("http://early:1")))
            .await
            .unwrap();

        let set = injector.register_function("m::not_yet_registered", deps(1)).await;
        assert!(set.get(0).await.is_none());
        injector.apply_staged("m::not_yet_registered").await;
        assert_eq!(set.get(0).await.unwrap().endpoint(), "http://early:1");
    }

    fn resolved_tool(function_name: &str) -> ResolvedTool {
        ResolvedTool {
            function_name: function_name.to_string(),
            capability: "weather".to_string(),
            endpoint: "http://weather-agent:9002".to_string(),
            input_schema: None,
        }
    }

    fn provider_info(function_id: &str) -> LlmProviderInfo {
        LlmProviderInfo {
            function_id: function_id.to_string(),
            agent_id: "llm-provider-agent".to_string(),
            endpoint: "http://llm-provider:9100".to_string(),
            function_name: "complete".to_string(),
            model: Some("gpt-4".to_string()),
        }
    }

    #[tokio::test]
    async fn llm_tool_updates_replace_the_previous_snapshot_atomically() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));

        let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
        proxies.insert("get_weather".to_string(), stub("http://weather-agent:9002"));
        injector
            .update_llm_tools("m::weather_bot", vec![resolved_tool("get_weather")], proxies)
            .await;

        let slot = injector.llm_slot("m::weather_bot").await.unwrap();
        let (tools, proxies, provider) = slot.snapshot().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function_name, "get_weather");
        assert!(proxies.contains_key("get_weather"));
        assert!(provider.is_none());

        // A later topology change swaps the whole set out rather than merging.
        injector.update_llm_tools("m::weather_bot", vec![], HashMap::new()).await;
        let (tools, proxies, _) = slot.snapshot().await;
        assert!(tools.is_empty());
        assert!(proxies.is_empty());
    }

    #[tokio::test]
    async fn llm_provider_updates_are_visible_through_the_same_slot() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));
        injector.register_llm_function("m::weather_bot").await;

        injector
            .update_llm_provider("m::weather_bot", provider_info("m::weather_bot"))
            .await;

        let slot = injector.llm_slot("m::weather_bot").await.unwrap();
        let (_, _, provider) = slot.snapshot().await;
        assert_eq!(provider.unwrap().endpoint, "http://llm-provider:9100");
    }

    struct NoopTransport;

    #[async_trait]
    impl LlmTransport for NoopTransport {
        async fn complete(
            &self,
            _model: &str,
            _api_key: Option<&str>,
            _messages: &[crate::llm_agent::ChatMessage],
            _tool_schemas: &[Value],
        ) -> Result<crate::llm_agent::LlmResponse, Box<dyn std::error::Error + Send + Sync>> {
            Ok(crate::llm_agent::LlmResponse::default())
        }
    }

    #[tokio::test]
    async fn build_llm_agent_uses_the_slots_current_snapshot() {
        let injector = Injector::new(UpdateStrategy::Immediate, Duration::from_millis(50));
        let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
        proxies.insert("get_weather".to_string(), stub("http://weather-agent:9002"));
        injector
            .update_llm_tools("m::weather_bot", vec![resolved_tool("get_weather")], proxies)
            .await;

        let config = LlmConfig {
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
            api_key: None,
            max_iterations: 3,
            system_prompt: None,
        };
        let agent = injector
            .build_llm_agent::<Value>("m::weather_bot", config, Arc::new(NoopTransport), None)
            .await;
        assert!(agent.is_some());

        let missing = injector
            .build_llm_agent::<Value>(
                "m::never_registered",
                LlmConfig {
                    provider: "openai".to_string(),
                    model: "gpt-4".to_string(),
                    api_key: None,
                    max_iterations: 1,
                    system_prompt: None,
                },
                Arc::new(NoopTransport),
                None,
            )
            .await;
        assert!(missing.is_none());
    }
}
