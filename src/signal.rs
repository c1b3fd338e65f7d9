//! Signal handling and graceful shutdown.
//!
//! Installs OS signal handlers that only set a flag and wake the shutdown
//! channel - no cleanup work happens inside the handler itself, since
//! handlers must stay reentrant-safe and cheap. The actual cleanup sequence
//! (cleanup callbacks, then any tracked child processes, then joining the
//! HTTP server and heartbeat loop) runs on the normal async executor after
//! the signal wakes it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A cleanup callback run once during shutdown. Boxed and type-erased so
/// callers can register arbitrary async cleanup work (closing a database
/// pool, flushing a trace buffer) without the manager knowing about it.
pub type CleanupHandler = Box<dyn (FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send>;

/// Default hard deadline for the whole shutdown sequence before giving up
/// on cooperative cancellation and returning anyway.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Owns the cleanup callback stack and any child processes spawned by tool
/// handlers, and drives the shutdown sequence exactly once.
pub struct ShutdownManager {
    shutdown_in_progress: AtomicBool,
    handlers: Mutex<Vec<CleanupHandler>>,
    children: Mutex<Vec<Child>>,
    deadline: Duration,
}

impl ShutdownManager {
    pub fn new(deadline: Duration) -> Self {
        Self {
            shutdown_in_progress: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            deadline,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    /// Register a cleanup callback. Callbacks run LIFO - the most recently
    /// registered callback (typically the most recently started subsystem)
    /// is torn down first.
    pub async fn register_cleanup(&self, handler: CleanupHandler) {
        self.handlers.lock().await.push(handler);
    }

    /// Track a child process so it gets terminated during shutdown.
    pub async fn track_child(&self, child: Child) {
        self.children.lock().await.push(child);
    }

    /// Install OS signal handlers (`Ctrl+C` everywhere, plus `SIGTERM` on
    /// unix) that push a single shutdown signal the first time either
    /// fires. The handler itself does no cleanup work - it only flips the
    /// flag and notifies `shutdown_tx`, matching the rule that signal
    /// handlers must stay reentrant and non-blocking.
    pub fn install_signal_handlers(self: &Arc<Self>, shutdown_tx: mpsc::Sender<()>) {
        let manager = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            if manager.shutdown_in_progress.swap(true, Ordering::SeqCst) {
                return;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(()).await;
        });
    }

    /// Run the full shutdown sequence once: invoke cleanup handlers LIFO,
    /// terminate tracked child processes (graceful then forceful), then
    /// join the HTTP server and heartbeat loop tasks with a hard deadline.
    /// Idempotent - a second call after the first completes is a no-op.
    pub async fn shutdown(
        &self,
        http_server: Option<JoinHandle<()>>,
        heartbeat_loop: Option<JoinHandle<()>>,
    ) {
        self.shutdown_in_progress.store(true, Ordering::SeqCst);
        let deadline = self.deadline;

        let outcome = tokio::time::timeout(deadline, async {
            self.run_cleanup_handlers().await;
            self.terminate_children().await;
            self.join_background_tasks(http_server, heartbeat_loop).await;
        })
        .await;

        if outcome.is_err() {
            warn!(
                "shutdown sequence did not complete within {:?}; returning anyway",
                deadline
            );
        } else {
            info!("shutdown sequence completed");
        }
    }

    async fn run_cleanup_handlers(&self) {
        let mut handlers = self.handlers.lock().await;
        while let Some(handler) = handlers.pop() {
            handler().await;
        }
    }

    async fn terminate_children(&self) {
        let mut children = self.children.lock().await;
        for mut child in children.drain(..) {
            let pid = child.id();
            info!("waiting for child process {:?} to exit gracefully", pid);
            let graceful = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
            if graceful.is_err() {
                warn!("child process {:?} did not exit gracefully; killing", pid);
                let _ = child.kill().await;
            }
        }
    }

    async fn join_background_tasks(&self, http_server: Option<JoinHandle<()>>, heartbeat_loop: Option<JoinHandle<()>>) {
        if let Some(handle) = http_server {
            if let Err(e) = handle.await {
                warn!("http server task did not join cleanly: {}", e);
            }
        }
        if let Some(handle) = heartbeat_loop {
            if let Err(e) = handle.await {
                warn!("heartbeat loop task did not join cleanly: {}", e);
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn cleanup_handlers_run_lifo_exactly_once() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            manager
                .register_cleanup(Box::new(move || {
                    Box::pin(async move {
                        order.lock().await.push(label);
                    })
                }))
                .await;
        }

        manager.shutdown(None, None).await;
        assert_eq!(*order.lock().await, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_with_respect_to_flag() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager
            .register_cleanup(Box::new(move || {
                Box::pin(async move {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        assert!(!manager.is_shutting_down());
        manager.shutdown(None, None).await;
        assert!(manager.is_shutting_down());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second shutdown call just re-runs an empty handler stack - no
        // handler fires twice because `run_cleanup_handlers` drains it.
        manager.shutdown(None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn joins_background_tasks_before_returning() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let http_server = tokio::spawn(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.shutdown(Some(http_server), None).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
