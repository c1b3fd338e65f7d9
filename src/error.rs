//! Crate-level error taxonomy.
//!
//! Each component keeps its own typed error (`RegistryError` in
//! `registry.rs`, `ProxyError` here, `InjectorError` here, `LlmError`
//! here); `MeshError` wraps them for the handful of call sites - mainly
//! the HTTP surface and the startup pipeline - that need a single type to
//! propagate through `?`.

use thiserror::Error;

use crate::registry::RegistryError;

/// Errors raised when calling a remote capability through a proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("dependency not yet resolved")]
    NotResolved,

    #[error("network error calling remote tool: {0}")]
    Network(#[from] reqwest::Error),

    #[error("remote tool returned JSON-RPC error {code}: {message}")]
    RemoteError { code: i64, message: String },

    #[error("malformed response from remote tool: {0}")]
    MalformedResponse(String),

    #[error("session '{0}' is no longer valid")]
    SessionLost(String),
}

/// Errors raised by the dependency injector.
#[derive(Debug, Error)]
pub enum InjectorError {
    #[error("no wrapper registered for function '{0}'")]
    UnknownFunction(String),

    #[error("dependency index {index} out of range for function '{function_id}' ({len} dependencies declared)")]
    IndexOutOfRange {
        function_id: String,
        index: usize,
        len: usize,
    },
}

/// Errors raised by the LLM agent subsystem.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API call failed (provider={provider}, model={model}): {source}")]
    Api {
        provider: String,
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("tool '{0}' failed during agentic loop: {1}")]
    ToolExecution(String, String),

    #[error("could not parse final response into the expected output type: {0}")]
    ResponseParse(String),

    #[error("exceeded {max_allowed} iterations without a final response (reached {iteration_count})")]
    MaxIterations { iteration_count: u32, max_allowed: u32 },

    #[error("template error: {0}")]
    Template(String),
}

/// Top-level error type for call sites that need one error enum.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("injector error: {0}")]
    Injector(#[from] InjectorError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown already in progress")]
    ShutdownInProgress,
}
