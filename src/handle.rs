//! Handle returned to the embedding application when an agent is started.
//!
//! `AgentHandle` is the user-facing control surface: an async event stream
//! for topology updates, snapshot queries over current state, and a
//! shutdown trigger. The runtime owns the other end of both channels.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::events::{HealthStatus, MeshEvent};

/// State shared between the handle and the runtime task driving it.
pub struct HandleState {
    /// Current dependency endpoints (capability -> endpoint).
    pub dependencies: HashMap<String, String>,
    pub health_status: HealthStatus,
    pub shutdown_requested: bool,
    /// Agent ID assigned once registration succeeds.
    pub agent_id: Option<String>,
}

impl Default for HandleState {
    fn default() -> Self {
        Self {
            dependencies: HashMap::new(),
            health_status: HealthStatus::Healthy,
            shutdown_requested: false,
            agent_id: None,
        }
    }
}

/// Handle to a running agent runtime.
pub struct AgentHandle {
    event_rx: Arc<Mutex<mpsc::Receiver<MeshEvent>>>,
    state: Arc<RwLock<HandleState>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl AgentHandle {
    pub fn new(
        event_rx: mpsc::Receiver<MeshEvent>,
        state: Arc<RwLock<HandleState>>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            event_rx: Arc::new(Mutex::new(event_rx)),
            state,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> Arc<RwLock<HandleState>> {
        self.state.clone()
    }

    /// Wait for the next mesh event. Returns a `shutdown` event once the
    /// runtime side of the channel has closed, so callers never see `None`.
    pub async fn next_event(&self) -> MeshEvent {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await.unwrap_or_else(MeshEvent::shutdown)
    }

    pub async fn dependencies(&self) -> HashMap<String, String> {
        self.state.read().await.dependencies.clone()
    }

    pub async fn status(&self) -> HealthStatus {
        self.state.read().await.health_status
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.state.read().await.agent_id.clone()
    }

    pub async fn is_shutdown_requested(&self) -> bool {
        self.state.read().await.shutdown_requested
    }

    /// Request graceful shutdown. Non-blocking: if the runtime's shutdown
    /// channel is momentarily full the flag is still set, so the runtime
    /// will observe it on its next poll regardless.
    pub async fn shutdown(&self) {
        self.state.write().await.shutdown_requested = true;
        let _ = self.shutdown_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_updates_are_visible_through_the_handle() {
        let (event_tx, event_rx) = mpsc::channel(10);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(HandleState::default()));

        let handle = AgentHandle::new(event_rx, state.clone(), shutdown_tx);

        {
            let mut s = state.write().await;
            s.agent_id = Some("test-agent".to_string());
            s.dependencies
                .insert("date-service".to_string(), "http://localhost:9001".to_string());
        }

        assert_eq!(handle.agent_id().await, Some("test-agent".to_string()));
        assert_eq!(handle.dependencies().await.len(), 1);

        event_tx
            .send(MeshEvent::dependency_available(
                "weather".to_string(),
                "http://localhost:9002".to_string(),
                "get_weather".to_string(),
                "weather-agent".to_string(),
            ))
            .await
            .unwrap();

        let event = handle.next_event().await;
        assert_eq!(event.capability, Some("weather".to_string()));

        drop(event_tx);
        let closed_event = handle.next_event().await;
        assert_eq!(closed_event.event_type.as_str(), "shutdown");
    }

    #[tokio::test]
    async fn shutdown_sets_flag_and_signals_runtime() {
        let (_event_tx, event_rx) = mpsc::channel(10);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(HandleState::default()));

        let handle = AgentHandle::new(event_rx, state.clone(), shutdown_tx);

        handle.shutdown().await;

        assert!(handle.is_shutdown_requested().await);
        assert!(shutdown_rx.try_recv().is_ok());
    }
}
