//! Anthropic streaming LLM provider.
//!
//! Streams the Messages API over SSE. Anthropic's format differs from
//! OpenAI's: auth uses an `x-api-key` header, the system prompt is a
//! separate field, content is an array of blocks, and tool use arrives as
//! `tool_use`/`input_json_delta` events.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::SseBuffer;
use crate::providers::{
    required_str, str_or, LanguageModel, LlmChunk, Message, ProviderError, Role,
};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API with streaming.
pub struct AnthropicLlm {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicLlm {
    pub fn from_config(config: &Value) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key: required_str(config, "api_key")?,
            model: str_or(config, "model", DEFAULT_MODEL),
            base_url: str_or(config, "base_url", "https://api.anthropic.com"),
            client: reqwest::Client::new(),
        })
    }

    /// Split messages into (system prompt, Anthropic message array). Tool
    /// results ride as `tool_result` blocks in user messages; assistant tool
    /// calls become `tool_use` blocks.
    fn convert_messages(messages: &[Message]) -> (String, Vec<Value>) {
        let mut system_prompt = String::new();
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_prompt = msg.content.clone(),
                Role::Tool => converted.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content,
                    }],
                })),
                Role::Assistant if !msg.tool_calls.is_empty() => {
                    let mut content = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in &msg.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    converted.push(json!({"role": "assistant", "content": content}));
                }
                role => converted.push(json!({"role": role.as_str(), "content": msg.content})),
            }
        }

        (system_prompt, converted)
    }

    /// OpenAI-format tool definitions to Anthropic's.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                let func = tool.get("function").unwrap_or(tool);
                json!({
                    "name": func.get("name").and_then(Value::as_str).unwrap_or(""),
                    "description": func.get("description").and_then(Value::as_str).unwrap_or(""),
                    "input_schema": func
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LanguageModel for AnthropicLlm {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<Value>>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<LlmChunk>, ProviderError> {
        let (system_prompt, converted) = Self::convert_messages(&messages);

        let mut body = json!({
            "model": self.model,
            "messages": converted,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": true,
        });
        if !system_prompt.is_empty() {
            body["system"] = json!(system_prompt);
        }
        if let Some(tools) = &tools {
            if !tools.is_empty() {
                body["tools"] = json!(Self::convert_tools(tools));
            }
        }

        debug!("anthropic request: model={}, messages={}", self.model, messages.len());

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let (tx, rx) = mpsc::channel::<LlmChunk>(64);
        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    error!("anthropic request failed: {e}");
                    let _ = tx.send(LlmChunk::failed(e.to_string())).await;
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!("anthropic returned {status}: {body}");
                let _ = tx.send(LlmChunk::failed(format!("anthropic returned {status}"))).await;
                return;
            }

            let mut stream = response.bytes_stream();
            let mut sse = SseBuffer::default();

            let mut current_tool_id = String::new();
            let mut current_tool_name = String::new();
            let mut current_tool_args = String::new();
            let mut input_tokens: u32 = 0;
            let mut output_tokens: u32 = 0;

            use futures_util::StreamExt;
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(LlmChunk::failed(e.to_string())).await;
                        return;
                    }
                };
                for payload in sse.push(&bytes) {
                    let data: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };

                    match data.get("type").and_then(Value::as_str).unwrap_or("") {
                        "content_block_start" => {
                            let block = data.get("content_block").cloned().unwrap_or_default();
                            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                                current_tool_id =
                                    block.get("id").and_then(Value::as_str).unwrap_or("").into();
                                current_tool_name =
                                    block.get("name").and_then(Value::as_str).unwrap_or("").into();
                                current_tool_args.clear();
                            }
                        }
                        "content_block_delta" => {
                            let delta = data.get("delta").cloned().unwrap_or_default();
                            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                                "text_delta" => {
                                    let text =
                                        delta.get("text").and_then(Value::as_str).unwrap_or("");
                                    if tx.send(LlmChunk::text(text)).await.is_err() {
                                        return;
                                    }
                                }
                                "input_json_delta" => {
                                    current_tool_args.push_str(
                                        delta
                                            .get("partial_json")
                                            .and_then(Value::as_str)
                                            .unwrap_or(""),
                                    );
                                    let chunk = LlmChunk {
                                        tool_call_id: current_tool_id.clone(),
                                        tool_name: current_tool_name.clone(),
                                        tool_arguments: current_tool_args.clone(),
                                        ..Default::default()
                                    };
                                    if tx.send(chunk).await.is_err() {
                                        return;
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            current_tool_id.clear();
                            current_tool_name.clear();
                            current_tool_args.clear();
                        }
                        "message_start" => {
                            input_tokens = data
                                .get("message")
                                .and_then(|m| m.get("usage"))
                                .and_then(|u| u.get("input_tokens"))
                                .and_then(Value::as_u64)
                                .unwrap_or(0) as u32;
                        }
                        "message_delta" => {
                            if let Some(out) = data
                                .get("usage")
                                .and_then(|u| u.get("output_tokens"))
                                .and_then(Value::as_u64)
                            {
                                output_tokens = out as u32;
                            }
                        }
                        _ => {}
                    }
                }
            }

            let _ = tx.send(LlmChunk::final_usage(input_tokens, output_tokens)).await;
        });

        Ok(rx)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LlmToolCall;

    #[test]
    fn test_config() {
        let llm = AnthropicLlm::from_config(&json!({"api_key": "a-1"})).unwrap();
        assert_eq!(llm.model(), DEFAULT_MODEL);
        assert!(AnthropicLlm::from_config(&json!({"model": "claude-x"})).is_err());
    }

    #[test]
    fn test_system_prompt_extraction() {
        let messages = vec![
            Message::new(Role::System, "be terse"),
            Message::new(Role::User, "hello"),
        ];
        let (system, converted) = AnthropicLlm::convert_messages(&messages);
        assert_eq!(system, "be terse");
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["role"], "user");
    }

    #[test]
    fn test_tool_cycle_conversion() {
        let mut assistant = Message::new(Role::Assistant, "checking");
        assistant.tool_calls.push(LlmToolCall {
            id: "toolu_1".into(),
            name: "weather".into(),
            arguments: json!({"city": "Austin"}),
        });
        let messages = vec![assistant, Message::tool_result("toolu_1", "weather", "72F")];

        let (_, converted) = AnthropicLlm::convert_messages(&messages);
        assert_eq!(converted[0]["content"][0]["type"], "text");
        assert_eq!(converted[0]["content"][1]["type"], "tool_use");
        assert_eq!(converted[0]["content"][1]["input"]["city"], "Austin");
        assert_eq!(converted[1]["role"], "user");
        assert_eq!(converted[1]["content"][0]["type"], "tool_result");
        assert_eq!(converted[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_tool_definition_conversion() {
        let tools = vec![json!({
            "type": "function",
            "function": {
                "name": "lookup",
                "description": "Look something up",
                "parameters": {"type": "object", "properties": {"q": {"type": "string"}}}
            }
        })];
        let converted = AnthropicLlm::convert_tools(&tools);
        assert_eq!(converted[0]["name"], "lookup");
        assert_eq!(converted[0]["input_schema"]["properties"]["q"]["type"], "string");
    }
}
