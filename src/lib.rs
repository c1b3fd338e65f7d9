//! Agent-side runtime for MCP Mesh.
//!
//! An agent links this crate, annotates its tool functions with
//! `#[mesh::tool]` (and optionally one `#[mesh::agent]` and any number of
//! `#[mesh::llm]` functions), and calls [`startup::run_startup_pipeline`]
//! once at process start. From there the runtime self-registers with the
//! mesh registry, keeps its dependency slots fed from heartbeat responses,
//! and serves its own tools back over HTTP to the rest of the mesh.
//!
//! `pub use mcp_mesh_macros as mesh` is what makes `#[mesh::tool(...)]` work
//! for downstream crates without a separate macro-crate import; `pub use
//! inventory` exists because the macros expand to `::mcp_mesh::inventory::submit!`
//! and need that path to resolve from the caller's crate root.

pub use inventory;
pub use mcp_mesh_macros as mesh;

pub mod config;
pub mod debounce;
pub mod decorator;
pub mod error;
pub mod events;
pub mod handle;
pub mod heartbeat;
pub mod injector;
pub mod llm_agent;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod signal;
pub mod spec;
pub mod startup;

#[cfg(feature = "http-server")]
pub mod http_server;

#[cfg(feature = "distributed-tracing")]
pub mod tracing_publish;

/// Install a `tracing-subscriber` env-filter subscriber reading
/// `MCP_MESH_LOG_LEVEL` (falling back to `info`), matching how every other
/// config knob in this crate resolves. Embedding applications that already
/// install their own subscriber should skip this and call
/// `startup::run_startup_pipeline` directly.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let level = config::resolve_config(config::ConfigKey::LogLevel, None).unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
