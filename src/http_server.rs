//! This agent's own MCP HTTP surface.
//!
//! Every other agent in the mesh reaches this one's tools through a plain
//! Streamable-HTTP MCP endpoint - the same shape `proxy.rs` speaks to when
//! calling out. `/mcp` (and `/mcp/`) accept JSON-RPC 2.0 requests for
//! `tools/list` and `tools/call`; `/health` is a cheap liveness probe for
//! infrastructure that doesn't want to speak JSON-RPC.
//!
//! Rust has no reflection-based way to turn an arbitrary `async fn` into a
//! dynamically dispatchable callable the way the original wrapped a
//! decorated Python function, so a tool's *metadata* (via
//! `#[mesh::tool]`) and its *callable* are registered separately: the
//! metadata lives in the `DecoratorRegistry`, the callable is registered
//! into a `ToolHandlers` map the embedding application builds alongside it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::decorator::DecoratorRegistry;

/// A tool's actual callable, keyed by `function_id` in `ToolHandlers`.
/// Boxed and type-erased since every tool has its own argument shape.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ToolHandlers {
    inner: Arc<RwLock<HashMap<String, ToolHandler>>>,
}

impl ToolHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, function_id: impl Into<String>, handler: ToolHandler) {
        self.inner.write().await.insert(function_id.into(), handler);
    }

    async fn get(&self, function_id: &str) -> Option<ToolHandler> {
        self.inner.read().await.get(function_id).cloned()
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<DecoratorRegistry>,
    handlers: ToolHandlers,
    agent_name: String,
}

pub fn router(registry: Arc<DecoratorRegistry>, handlers: ToolHandlers, agent_name: String) -> Router {
    let state = AppState { registry, handlers, agent_name };
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/mcp/", post(handle_mcp))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    }))
}

async fn handle_mcp(State(state): State<AppState>, Json(request): Json<JsonRpcRequest>) -> Json<Value> {
    debug!("mcp request: method={}", request.method);
    match request.method.as_str() {
        "tools/list" => handle_tools_list(&state, request.id).await,
        "tools/call" => handle_tools_call(&state, request.id, request.params).await,
        other => rpc_error(request.id, -32601, format!("method not found: {other}")),
    }
}

async fn handle_tools_list(state: &AppState, id: Value) -> Json<Value> {
    let tools: Vec<Value> = state
        .registry
        .tools()
        .map(|t| {
            json!({
                "name": t.function_name,
                "description": t.description,
                "inputSchema": t.input_schema.clone().unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect();
    rpc_result(id, json!({ "tools": tools }))
}

async fn handle_tools_call(state: &AppState, id: Value, params: Value) -> Json<Value> {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return rpc_error(id, -32602, "missing required param 'name'");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let Some(tool) = state.registry.tools().find(|t| t.function_name == name) else {
        return rpc_error(id, -32602, format!("unknown tool '{name}'"));
    };

    let Some(handler) = state.handlers.get(&tool.function_id).await else {
        warn!("tool '{}' is declared but has no registered handler", name);
        return rpc_error(id, -32603, format!("tool '{name}' has no registered handler"));
    };

    match handler(arguments).await {
        Ok(value) => rpc_result(id, json!({ "content": [{ "type": "text", "text": value.to_string() }] })),
        Err(message) => rpc_error(id, -32000, message),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "agent": state.agent_name,
        "tools_count": state.registry.tools().count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ToolDeclaration;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn registry_with_one_tool() -> Arc<DecoratorRegistry> {
        let mut registry = DecoratorRegistry::default();
        registry.insert_tool(ToolDeclaration {
            function_id: "m::greet".to_string(),
            function_name: "greet".to_string(),
            capability: Some("greeting".to_string()),
            tags: vec![],
            version: "1.0.0".to_string(),
            dependencies: vec![],
            description: Some("Say hello".to_string()),
            input_schema: None,
            kwargs: Default::default(),
        });
        Arc::new(registry)
    }

    #[tokio::test]
    async fn health_reports_agent_name_and_tool_count() {
        let app = router(registry_with_one_tool(), ToolHandlers::new(), "greeter".to_string());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["agent"], "greeter");
        assert_eq!(value["tools_count"], 1);
    }

    #[tokio::test]
    async fn tools_list_reports_declared_tools() {
        let app = router(registry_with_one_tool(), ToolHandlers::new(), "greeter".to_string());
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"]["tools"][0]["name"], "greet");
    }

    #[tokio::test]
    async fn tools_call_invokes_the_registered_handler() {
        let registry = registry_with_one_tool();
        let handlers = ToolHandlers::new();
        handlers
            .register(
                "m::greet",
                Arc::new(|args: Value| {
                    Box::pin(async move {
                        let who = args.get("name").and_then(Value::as_str).unwrap_or("world");
                        Ok(json!({ "greeting": format!("hello, {who}") }))
                    })
                }),
            )
            .await;

        let app = router(registry, handlers, "greeter".to_string());
        let body = json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": { "name": "greet", "arguments": { "name": "ada" } },
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        let text = value["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("hello, ada"));
    }

    #[tokio::test]
    async fn tools_call_on_unknown_tool_returns_json_rpc_error() {
        let app = router(registry_with_one_tool(), ToolHandlers::new(), "greeter".to_string());
        let body = json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": { "name": "does-not-exist", "arguments": {} },
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], -32602);
    }
}
