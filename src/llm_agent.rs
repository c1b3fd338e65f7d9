//! LLM agent subsystem: the automatic agentic loop behind `#[mesh::llm]`.
//!
//! `MeshLlmAgent::call` drives the full cycle - call the LLM with a tool
//! palette, execute whatever tool calls come back through the bound
//! proxies, feed the results back, and repeat until the LLM returns a final
//! answer or `max_iterations` is exhausted. The LLM transport itself is a
//! trait object rather than a hardwired provider client, the same way the
//! original swapped providers through a single `completion()` entry point -
//! this keeps the loop provider-agnostic and lets tests inject a scripted
//! transport instead of calling out to a real API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::LlmError;
use crate::proxy::{ContentBlock, Proxy};
use crate::spec::ResolvedTool;

/// Resolved LLM configuration, distinct from the raw `LlmDeclaration` a
/// macro captures - this is what's left after config resolution (API key
/// pulled from env if not literal, provider/model defaults applied).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

/// One chat message in the running conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: Some(content.into()), tool_call_id: None, tool_calls: vec![] }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: Some(content.into()), tool_call_id: None, tool_calls: vec![] }
    }
}

/// A single tool invocation the LLM asked for.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// What the transport returns for one completion call: either a final
/// textual answer, or one or more tool calls to execute before continuing.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Swappable LLM API client. Implementations talk to whichever provider
/// `LlmConfig::provider` names; the agentic loop itself never references a
/// concrete SDK.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        api_key: Option<&str>,
        messages: &[ChatMessage],
        tool_schemas: &[Value],
    ) -> Result<LlmResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// Renders a system prompt from a flat context map. Literal prompts (no
/// template configured) skip this entirely.
pub trait Template: Send + Sync {
    fn render(&self, context: &HashMap<String, Value>) -> Result<String, LlmError>;
}

const TOOL_CALLING_RULES: &str = "\n\nIMPORTANT TOOL CALLING RULES:\n\
- You have access to tools that you can call to gather information\n\
- Make ONE tool call at a time - each tool call must be separate\n\
- After receiving results from a tool, you can make additional tool calls if needed\n\
- Once you have gathered all necessary information, provide your final response\n";

fn json_schema_instructions(output_schema: &Value) -> String {
    let schema_str = serde_json::to_string_pretty(output_schema).unwrap_or_else(|_| "{}".to_string());
    format!(
        "\n\nIMPORTANT: You must return your final response as valid JSON matching this schema:\n{schema_str}\n\nReturn ONLY the JSON object, no additional text."
    )
}

fn build_tool_schema(tool: &ResolvedTool) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.function_name,
            "description": format!("Capability '{}' provided by the mesh", tool.capability),
            "parameters": tool.input_schema.clone().unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        }
    })
}

/// LLM agent proxy with an automatic agentic loop. Generic over the output
/// type so the final response is validated and parsed by `serde_json`
/// instead of leaning on a string-named type resolved at runtime - the
/// macro can only capture `output_type_name` as a string, but by the time a
/// `MeshLlmAgent` is actually constructed the call site knows the concrete
/// type.
pub struct MeshLlmAgent<T> {
    config: LlmConfig,
    transport: Arc<dyn LlmTransport>,
    tool_schemas: Vec<Value>,
    tool_proxies: HashMap<String, Arc<dyn Proxy>>,
    system_prompt_override: Option<String>,
    template: Option<Box<dyn Template>>,
    context: HashMap<String, Value>,
    cached_json_instructions: String,
    iteration_count: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> MeshLlmAgent<T> {
    pub fn new(
        config: LlmConfig,
        tools: Vec<ResolvedTool>,
        tool_proxies: HashMap<String, Arc<dyn Proxy>>,
        transport: Arc<dyn LlmTransport>,
        output_schema: Option<Value>,
    ) -> Self {
        let tool_schemas = tools.iter().map(build_tool_schema).collect();
        let output_schema = output_schema.unwrap_or_else(|| serde_json::json!({"type": "object"}));
        let cached_json_instructions = json_schema_instructions(&output_schema);

        debug!(
            "MeshLlmAgent initialized: provider={}, model={}, tools={}, max_iterations={}",
            config.provider,
            config.model,
            tool_schemas.len(),
            config.max_iterations
        );

        Self {
            config,
            transport,
            tool_schemas,
            tool_proxies,
            system_prompt_override: None,
            template: None,
            context: HashMap::new(),
            cached_json_instructions,
            iteration_count: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_template(mut self, template: Box<dyn Template>, context: HashMap<String, Value>) -> Self {
        self.template = Some(template);
        self.context = context;
        self
    }

    /// Override the system prompt at runtime, taking precedence over both
    /// the configured literal and any template.
    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt_override = Some(prompt);
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    fn render_system_prompt(&self) -> Result<String, LlmError> {
        if let Some(override_prompt) = &self.system_prompt_override {
            return Ok(override_prompt.clone());
        }
        if let Some(template) = &self.template {
            return template.render(&self.context);
        }
        Ok(self.config.system_prompt.clone().unwrap_or_default())
    }

    /// Run the agentic loop for `message`, returning the parsed final
    /// response or an error if the loop never converges.
    pub async fn call(&mut self, message: &str) -> Result<T, LlmError> {
        self.iteration_count = 0;

        let base_prompt = self.render_system_prompt()?;
        let mut system_content = base_prompt;
        if !self.tool_schemas.is_empty() {
            system_content.push_str(TOOL_CALLING_RULES);
        }
        system_content.push_str(&self.cached_json_instructions);

        let mut messages = vec![ChatMessage::system(system_content), ChatMessage::user(message)];

        info!("starting agentic loop for message: {:.100}", message);

        while self.iteration_count < self.config.max_iterations {
            self.iteration_count += 1;
            debug!("llm iteration {}/{}", self.iteration_count, self.config.max_iterations);

            let response = self
                .transport
                .complete(
                    &self.config.model,
                    self.config.api_key.as_deref(),
                    &messages,
                    &self.tool_schemas,
                )
                .await
                .map_err(|source| LlmError::Api {
                    provider: self.config.provider.clone(),
                    model: self.config.model.clone(),
                    source,
                })?;

            if !response.tool_calls.is_empty() {
                debug!("llm requested {} tool calls", response.tool_calls.len());
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: response.content.clone(),
                    tool_call_id: None,
                    tool_calls: response.tool_calls.clone(),
                });

                for call in &response.tool_calls {
                    let result = self.execute_tool_call(call).await?;
                    messages.push(ChatMessage {
                        role: "tool".to_string(),
                        content: Some(result),
                        tool_call_id: Some(call.id.clone()),
                        tool_calls: vec![],
                    });
                }
                continue;
            }

            let content = response.content.unwrap_or_default();
            debug!("final response received from llm");
            return self.parse_response(&content);
        }

        error!(
            "max iterations ({}) exceeded without a final response",
            self.config.max_iterations
        );
        Err(LlmError::MaxIterations {
            iteration_count: self.iteration_count,
            max_allowed: self.config.max_iterations,
        })
    }

    async fn execute_tool_call(&self, call: &ToolCallRequest) -> Result<String, LlmError> {
        let proxy = self
            .tool_proxies
            .get(&call.name)
            .ok_or_else(|| LlmError::ToolExecution(call.name.clone(), "no proxy bound for this tool".to_string()))?;

        let blocks = proxy
            .call(call.arguments.clone())
            .await
            .map_err(|e| LlmError::ToolExecution(call.name.clone(), e.to_string()))?;

        Ok(blocks
            .into_iter()
            .map(|b| match b {
                ContentBlock::Text(t) => t,
                ContentBlock::Other(v) => v.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn parse_response(&self, content: &str) -> Result<T, LlmError> {
        let trimmed = content.trim();
        let trimmed = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed)
            .trim_end_matches("```")
            .trim();

        serde_json::from_str(trimmed).map_err(|e| {
            warn!("failed to parse llm response into expected output type: {}", e);
            LlmError::ResponseParse(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Answer {
        summary: String,
    }

    struct ScriptedTransport {
        responses: Mutex<Vec<LlmResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(
            &self,
            _model: &str,
            _api_key: Option<&str>,
            _messages: &[ChatMessage],
            _tool_schemas: &[Value],
        ) -> Result<LlmResponse, Box<dyn std::error::Error + Send + Sync>> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if index < responses.len() {
                Ok(std::mem::replace(&mut responses[index], LlmResponse::default()))
            } else {
                Ok(LlmResponse { content: Some("{}".to_string()), tool_calls: vec![] })
            }
        }
    }

    fn config(max_iterations: u32) -> LlmConfig {
        LlmConfig {
            provider: "anthropic".to_string(),
            model: "claude-test".to_string(),
            api_key: Some("test-key".to_string()),
            max_iterations,
            system_prompt: Some("You are a helpful assistant.".to_string()),
        }
    }

    #[tokio::test]
    async fn terminates_with_typed_response_when_llm_returns_final_answer() {
        let transport = Arc::new(ScriptedTransport::new(vec![LlmResponse {
            content: Some(r#"{"summary": "done"}"#.to_string()),
            tool_calls: vec![],
        }]));

        let mut agent: MeshLlmAgent<Answer> =
            MeshLlmAgent::new(config(3), vec![], HashMap::new(), transport, None);

        let answer = agent.call("summarize this").await.unwrap();
        assert_eq!(answer, Answer { summary: "done".to_string() });
        assert_eq!(agent.iteration_count(), 1);
    }

    #[tokio::test]
    async fn raises_max_iterations_error_when_llm_always_calls_tools() {
        let always_tool_call = || LlmResponse {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: "get_weather".to_string(),
                arguments: serde_json::json!({}),
            }],
        };
        let transport = Arc::new(ScriptedTransport::new(vec![
            always_tool_call(),
            always_tool_call(),
            always_tool_call(),
        ]));

        let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
        proxies.insert("get_weather".to_string(), Arc::new(NoopProxy));

        let mut agent: MeshLlmAgent<Answer> =
            MeshLlmAgent::new(config(3), vec![], proxies, transport, None);

        let err = agent.call("what's the weather").await.unwrap_err();
        assert!(matches!(
            err,
            LlmError::MaxIterations { iteration_count: 3, max_allowed: 3 }
        ));
    }

    #[tokio::test]
    async fn raises_response_parse_error_when_final_answer_does_not_match_output_type() {
        let transport = Arc::new(ScriptedTransport::new(vec![LlmResponse {
            content: Some("not json at all".to_string()),
            tool_calls: vec![],
        }]));

        let mut agent: MeshLlmAgent<Answer> =
            MeshLlmAgent::new(config(3), vec![], HashMap::new(), transport, None);

        let err = agent.call("hello").await.unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse(_)));
    }

    struct NoopProxy;

    #[async_trait]
    impl Proxy for NoopProxy {
        async fn call(&self, _arguments: Value) -> Result<Vec<ContentBlock>, crate::error::ProxyError> {
            Ok(vec![ContentBlock::Text("72F and sunny".to_string())])
        }
        fn endpoint(&self) -> &str {
            "http://weather:9000"
        }
        fn function_name(&self) -> &str {
            "get_weather"
        }
    }
}
