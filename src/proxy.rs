//! Remote-call proxy layer.
//!
//! A proxy is a callable bound to exactly one `(endpoint, function_name)`
//! pair. Proxies hold no pooled connection and no state across calls - every
//! invocation opens a fresh HTTP transaction, so an upstream load balancer
//! stays free to rebalance between calls. JSON-RPC framing and the
//! `application/json` vs `text/event-stream` response handling follow the
//! same shape as a plain Streamable-HTTP MCP client talking to one server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::ProxyError;

static CALL_ID: AtomicU64 = AtomicU64::new(1);

fn next_call_id() -> String {
    format!("mesh-{}", CALL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Per-dependency transport knobs derived from a tool's `kwargs` map.
/// Unknown keys in `kwargs` are simply not consumed here; they still travel
/// to the registry verbatim since they live in `ToolDeclaration::kwargs`.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub custom_headers: HashMap<String, String>,
    pub auth: Option<String>,
}

impl ProxyConfig {
    pub fn from_kwargs(kwargs: &HashMap<String, Value>) -> Self {
        let timeout = kwargs
            .get("timeout")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64);
        let retries = kwargs.get("retries").and_then(Value::as_u64).unwrap_or(0) as u32;
        let auth = kwargs
            .get("auth")
            .and_then(Value::as_str)
            .map(str::to_string);
        let custom_headers = kwargs
            .get("custom_headers")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            timeout,
            retries,
            custom_headers,
            auth,
        }
    }

    pub fn wants_streaming(kwargs: &HashMap<String, Value>) -> bool {
        kwargs.get("streaming").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn wants_session(kwargs: &HashMap<String, Value>) -> bool {
        kwargs
            .get("session_required")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Normalized result of a `tools/call` (or equivalent) invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Other(Value),
}

/// A callable bound to one remote capability. Implementations must not hold
/// a persistent connection - every call is a fresh HTTP transaction.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Call the bound tool with JSON `arguments`, returning its content
    /// blocks in order.
    async fn call(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError>;

    /// Endpoint this proxy is bound to (for logging/diagnostics).
    fn endpoint(&self) -> &str;

    /// Function name this proxy is bound to.
    fn function_name(&self) -> &str;
}

fn build_client(config: &ProxyConfig) -> Result<Client, ProxyError> {
    let mut builder = Client::builder();
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    } else {
        builder = builder.timeout(Duration::from_secs(30));
    }
    builder.build().map_err(ProxyError::Network)
}

fn mcp_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    format!("{trimmed}/mcp/")
}

/// JSON-RPC response body as returned by either a plain JSON response or the
/// first complete `data:` line of an SSE stream.
#[derive(Debug, serde::Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Parse a JSON-RPC response from an HTTP body that is either a single JSON
/// object or an SSE stream of `data:` lines (FastMCP emits SSE by default).
/// Returns the first line that decodes into a response carrying `result` or
/// `error`.
fn parse_json_rpc_body(body: &str, is_sse: bool) -> Result<JsonRpcResponse, ProxyError> {
    if !is_sse {
        return serde_json::from_str(body)
            .map_err(|e| ProxyError::MalformedResponse(e.to_string()));
    }

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data) {
            if parsed.result.is_some() || parsed.error.is_some() {
                return Ok(parsed);
            }
        }
    }
    Err(ProxyError::MalformedResponse(
        "SSE stream had no data: line carrying a result or error".to_string(),
    ))
}

fn extract_content(result: Value) -> Result<Vec<ContentBlock>, ProxyError> {
    let Some(content) = result.get("content") else {
        // Some tools return a bare scalar/object result with no MCP content
        // envelope; surface it as a single opaque block.
        return Ok(vec![ContentBlock::Other(result)]);
    };

    let blocks = match content {
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => ContentBlock::Text(text.to_string()),
                None => ContentBlock::Other(item.clone()),
            })
            .collect(),
        other => vec![ContentBlock::Other(other.clone())],
    };
    Ok(blocks)
}

async fn send_json_rpc(
    client: &Client,
    url: &str,
    config: &ProxyConfig,
    method: &str,
    params: Value,
) -> Result<Value, ProxyError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": next_call_id(),
        "method": method,
        "params": params,
    });

    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream")
        .json(&body);

    for (k, v) in &config.custom_headers {
        request = request.header(k.as_str(), v.as_str());
    }
    if let Some(auth) = &config.auth {
        request = request.header("Authorization", auth.as_str());
    }

    trace!("proxy call {} -> {}", method, url);
    let response = request.send().await?;
    let status = response.status();
    let is_sse = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.contains("text/event-stream"))
        .unwrap_or(false);

    let text = response.text().await?;
    if !status.is_success() {
        return Err(ProxyError::RemoteError {
            code: status.as_u16() as i64,
            message: text,
        });
    }

    let parsed = parse_json_rpc_body(&text, is_sse)?;
    if let Some(err) = parsed.error {
        return Err(ProxyError::RemoteError {
            code: err.code,
            message: err.message,
        });
    }
    parsed
        .result
        .ok_or_else(|| ProxyError::MalformedResponse("response had neither result nor error".to_string()))
}

/// Basic single-tool proxy: only `tools/call` against one bound function.
pub struct BasicProxy {
    client: Client,
    endpoint: String,
    function_name: String,
    config: ProxyConfig,
}

impl BasicProxy {
    pub fn new(endpoint: String, function_name: String, config: ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_client(&config)?,
            endpoint,
            function_name,
            config,
        })
    }
}

#[async_trait]
impl Proxy for BasicProxy {
    async fn call(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError> {
        let url = mcp_url(&self.endpoint);
        let params = json!({ "name": self.function_name, "arguments": arguments });
        let result = send_json_rpc(&self.client, &url, &self.config, "tools/call", params).await?;
        extract_content(result)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn function_name(&self) -> &str {
        &self.function_name
    }
}

/// Superset of `BasicProxy` adding the other MCP surface methods an @llm
/// function's filtered tool set may need beyond plain tool calling.
pub struct FullMcpProxy {
    inner: BasicProxy,
}

impl FullMcpProxy {
    pub fn new(endpoint: String, function_name: String, config: ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            inner: BasicProxy::new(endpoint, function_name, config)?,
        })
    }

    pub async fn list_tools(&self) -> Result<Value, ProxyError> {
        let url = mcp_url(&self.inner.endpoint);
        send_json_rpc(&self.inner.client, &url, &self.inner.config, "tools/list", json!({})).await
    }

    pub async fn list_resources(&self) -> Result<Value, ProxyError> {
        let url = mcp_url(&self.inner.endpoint);
        send_json_rpc(&self.inner.client, &url, &self.inner.config, "resources/list", json!({})).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, ProxyError> {
        let url = mcp_url(&self.inner.endpoint);
        let params = json!({ "uri": uri });
        send_json_rpc(&self.inner.client, &url, &self.inner.config, "resources/read", params).await
    }

    pub async fn list_prompts(&self) -> Result<Value, ProxyError> {
        let url = mcp_url(&self.inner.endpoint);
        send_json_rpc(&self.inner.client, &url, &self.inner.config, "prompts/list", json!({})).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, ProxyError> {
        let url = mcp_url(&self.inner.endpoint);
        let params = json!({ "name": name, "arguments": arguments });
        send_json_rpc(&self.inner.client, &url, &self.inner.config, "prompts/get", params).await
    }
}

#[async_trait]
impl Proxy for FullMcpProxy {
    async fn call(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError> {
        self.inner.call(arguments).await
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn function_name(&self) -> &str {
        self.inner.function_name()
    }
}

/// One decoded event from a streaming call.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub value: Value,
}

/// Streaming proxy: issues one `tools/call` whose response is a long-lived
/// SSE stream, decoding each `data:` line as it arrives rather than waiting
/// for the whole body.
pub struct StreamingProxy {
    client: Client,
    endpoint: String,
    function_name: String,
    config: ProxyConfig,
}

impl StreamingProxy {
    pub fn new(endpoint: String, function_name: String, config: ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_client(&config)?,
            endpoint,
            function_name,
            config,
        })
    }

    /// Open the stream and return a channel of decoded events. Dropping the
    /// receiver stops the background pump and the underlying response is
    /// dropped along with it, closing the connection.
    pub async fn call_streaming(
        &self,
        arguments: Value,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ProxyError>>, ProxyError> {
        let url = mcp_url(&self.endpoint);
        let body = json!({
            "jsonrpc": "2.0",
            "id": next_call_id(),
            "method": "tools/call",
            "params": { "name": self.function_name, "arguments": arguments },
        });

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        for (k, v) in &self.config.custom_headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16() as i64;
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::RemoteError { code: status, message: text });
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ProxyError::Network(e))).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" || data == "done" {
                        return;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => {
                            if tx.send(Ok(StreamEvent { value })).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            if tx
                                .send(Err(ProxyError::MalformedResponse(e.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl Proxy for StreamingProxy {
    async fn call(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError> {
        let mut rx = self.call_streaming(arguments).await?;
        let mut blocks = Vec::new();
        while let Some(event) = rx.recv().await {
            blocks.push(ContentBlock::Other(event?.value));
        }
        Ok(blocks)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn function_name(&self) -> &str {
        &self.function_name
    }
}

/// Session-affine proxy: wraps a `FullMcpProxy` with client-tracked session
/// lifecycle so a sequence of calls pins to one replica via a header.
pub struct SessionAffineProxy {
    inner: FullMcpProxy,
    session_id: Mutex<Option<String>>,
}

impl SessionAffineProxy {
    pub fn new(endpoint: String, function_name: String, config: ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            inner: FullMcpProxy::new(endpoint, function_name, config)?,
            session_id: Mutex::new(None),
        })
    }

    /// Start a session, returning its id. The id is remembered and attached
    /// to every subsequent call on this proxy.
    pub fn create_session(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        *self.session_id.lock().unwrap() = Some(id.clone());
        id
    }

    fn current_session(&self) -> Result<String, ProxyError> {
        self.session_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(ProxyError::SessionLost("no session created".to_string()))
    }

    pub async fn call_with_session(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError> {
        let session_id = self.current_session()?;
        let url = mcp_url(self.inner.endpoint());
        let mut config = self.inner.inner.config.clone();
        config
            .custom_headers
            .insert("MCP-Session-Id".to_string(), session_id);
        let params = json!({ "name": self.inner.function_name(), "arguments": arguments });
        let result = send_json_rpc(&self.inner.inner.client, &url, &config, "tools/call", params).await?;
        extract_content(result)
    }

    /// Best-effort close; the session id is forgotten regardless of whether
    /// the remote acknowledges. Calls made after this return `SessionLost`.
    pub async fn close_session(&self) {
        let session_id = self.session_id.lock().unwrap().take();
        if let Some(session_id) = session_id {
            let url = mcp_url(self.inner.endpoint());
            let mut config = self.inner.inner.config.clone();
            config.custom_headers.insert("MCP-Session-Id".to_string(), session_id);
            if let Err(e) = send_json_rpc(&self.inner.inner.client, &url, &config, "session/close", json!({})).await
            {
                debug!("best-effort session close failed (ignored): {}", e);
            }
        }
    }
}

#[async_trait]
impl Proxy for SessionAffineProxy {
    async fn call(&self, arguments: Value) -> Result<Vec<ContentBlock>, ProxyError> {
        self.call_with_session(arguments).await
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn function_name(&self) -> &str {
        self.inner.function_name()
    }
}

/// Build the proxy variant a dependency's `kwargs` asks for.
pub fn build_proxy(
    endpoint: String,
    function_name: String,
    kwargs: &HashMap<String, Value>,
) -> Result<Box<dyn Proxy>, ProxyError> {
    let config = ProxyConfig::from_kwargs(kwargs);

    if ProxyConfig::wants_session(kwargs) {
        return Ok(Box::new(SessionAffineProxy::new(endpoint, function_name, config)?));
    }
    if ProxyConfig::wants_streaming(kwargs) {
        return Ok(Box::new(StreamingProxy::new(endpoint, function_name, config)?));
    }
    if kwargs.get("full_mcp").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(Box::new(FullMcpProxy::new(endpoint, function_name, config)?));
    }
    Ok(Box::new(BasicProxy::new(endpoint, function_name, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_response() {
        let body = r#"{"jsonrpc":"2.0","id":"1","result":{"content":[{"type":"text","text":"hi"}]}}"#;
        let parsed = parse_json_rpc_body(body, false).unwrap();
        let result = parsed.result.unwrap();
        let blocks = extract_content(result).unwrap();
        assert_eq!(blocks, vec![ContentBlock::Text("hi".to_string())]);
    }

    #[test]
    fn parses_sse_response_taking_first_complete_data_line() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":\"1\",\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}\n\ndata: [DONE]\n\n";
        let parsed = parse_json_rpc_body(body, true).unwrap();
        assert!(parsed.result.is_some());
    }

    #[test]
    fn surfaces_json_rpc_error_code_and_message_verbatim() {
        let body = r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"method not found"}}"#;
        let parsed = parse_json_rpc_body(body, false).unwrap();
        let err = parsed.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found");
    }

    #[test]
    fn proxy_config_reads_streaming_and_session_flags_from_kwargs() {
        let mut kwargs = HashMap::new();
        kwargs.insert("streaming".to_string(), json!(true));
        assert!(ProxyConfig::wants_streaming(&kwargs));
        assert!(!ProxyConfig::wants_session(&kwargs));

        kwargs.insert("session_required".to_string(), json!(true));
        assert!(ProxyConfig::wants_session(&kwargs));
    }

    #[test]
    fn build_proxy_picks_variant_from_kwargs() {
        let mut kwargs = HashMap::new();
        let basic = build_proxy("http://x".to_string(), "f".to_string(), &kwargs).unwrap();
        assert_eq!(basic.function_name(), "f");

        kwargs.insert("session_required".to_string(), json!(true));
        let session = build_proxy("http://x".to_string(), "f".to_string(), &kwargs).unwrap();
        assert_eq!(session.endpoint(), "http://x");
    }
}
