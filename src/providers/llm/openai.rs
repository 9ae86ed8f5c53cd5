//! OpenAI streaming LLM provider.
//!
//! Streams the Chat Completions API over SSE with
//! `stream_options.include_usage` so the final chunk carries token counts.
//! Tool/function calling is supported; argument fragments are forwarded as
//! they stream and accumulate per call id.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::SseBuffer;
use crate::providers::{
    required_str, str_or, LanguageModel, LlmChunk, Message, ProviderError, Role,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI Chat Completions with streaming.
pub struct OpenAiLlm {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn from_config(config: &Value) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key: required_str(config, "api_key")?,
            model: str_or(config, "model", DEFAULT_MODEL),
            base_url: str_or(config, "base_url", "https://api.openai.com/v1"),
            client: reqwest::Client::new(),
        })
    }

    /// Convert conversation messages to the Chat Completions schema.
    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| match msg.role {
                Role::Tool => json!({
                    "role": "tool",
                    "content": msg.content,
                    "tool_call_id": msg.tool_call_id,
                    "name": msg.name,
                }),
                Role::Assistant if !msg.tool_calls.is_empty() => json!({
                    "role": "assistant",
                    "content": if msg.content.is_empty() { Value::Null } else { json!(msg.content) },
                    "tool_calls": msg.tool_calls.iter().map(|tc| json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        },
                    })).collect::<Vec<_>>(),
                }),
                role => json!({ "role": role.as_str(), "content": msg.content }),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiLlm {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<Value>>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<LlmChunk>, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::convert_messages(&messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(tools) = &tools {
            if !tools.is_empty() {
                body["tools"] = json!(tools);
                body["tool_choice"] = json!("auto");
            }
        }

        debug!("openai request: model={}, messages={}", self.model, messages.len());

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);

        let (tx, rx) = mpsc::channel::<LlmChunk>(64);
        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    error!("openai request failed: {e}");
                    let _ = tx.send(LlmChunk::failed(e.to_string())).await;
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!("openai returned {status}: {body}");
                let _ = tx.send(LlmChunk::failed(format!("openai returned {status}"))).await;
                return;
            }

            let mut stream = response.bytes_stream();
            let mut sse = SseBuffer::default();
            // Accumulated tool-call fragments, keyed by stream index.
            let mut tool_calls: BTreeMap<u64, (String, String, String)> = BTreeMap::new();
            let mut sent_final = false;

            use futures_util::StreamExt;
            'stream: while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(LlmChunk::failed(e.to_string())).await;
                        return;
                    }
                };
                for payload in sse.push(&bytes) {
                    if payload == "[DONE]" {
                        break 'stream;
                    }
                    let data: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };

                    let delta = data
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"));

                    if let Some(text) = delta
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        if tx.send(LlmChunk::text(text)).await.is_err() {
                            return;
                        }
                    }

                    if let Some(deltas) = delta
                        .and_then(|d| d.get("tool_calls"))
                        .and_then(Value::as_array)
                    {
                        for tc in deltas {
                            let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                            let entry = tool_calls.entry(idx).or_default();
                            if let Some(id) = tc.get("id").and_then(Value::as_str) {
                                entry.0 = id.to_string();
                            }
                            if let Some(function) = tc.get("function") {
                                if let Some(name) = function.get("name").and_then(Value::as_str) {
                                    entry.1 = name.to_string();
                                }
                                if let Some(args) =
                                    function.get("arguments").and_then(Value::as_str)
                                {
                                    entry.2.push_str(args);
                                }
                            }
                            let chunk = LlmChunk {
                                tool_call_id: entry.0.clone(),
                                tool_name: entry.1.clone(),
                                tool_arguments: entry.2.clone(),
                                ..Default::default()
                            };
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }

                    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
                        let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
                        let output =
                            usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
                        sent_final = true;
                        if tx
                            .send(LlmChunk::final_usage(input as u32, output as u32))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }

            if !sent_final {
                let _ = tx.send(LlmChunk::final_usage(0, 0)).await;
            }
        });

        Ok(rx)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LlmToolCall;

    #[test]
    fn test_config() {
        let llm = OpenAiLlm::from_config(&json!({"api_key": "sk-1", "model": "gpt-4o"})).unwrap();
        assert_eq!(llm.model(), "gpt-4o");

        let llm = OpenAiLlm::from_config(&json!({"api_key": "sk-1"})).unwrap();
        assert_eq!(llm.model(), DEFAULT_MODEL);

        assert!(OpenAiLlm::from_config(&json!({})).is_err());
    }

    #[test]
    fn test_message_conversion_plain() {
        let messages = vec![
            Message::new(Role::System, "be brief"),
            Message::new(Role::User, "hi"),
        ];
        let converted = OpenAiLlm::convert_messages(&messages);
        assert_eq!(converted[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(converted[1], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_message_conversion_tool_cycle() {
        let mut assistant = Message::new(Role::Assistant, "");
        assistant.tool_calls.push(LlmToolCall {
            id: "tc1".into(),
            name: "lookup".into(),
            arguments: json!({"q": "x"}),
        });
        let messages = vec![assistant, Message::tool_result("tc1", "lookup", "{\"ok\":true}")];

        let converted = OpenAiLlm::convert_messages(&messages);
        assert_eq!(converted[0]["role"], "assistant");
        assert_eq!(converted[0]["content"], Value::Null);
        assert_eq!(converted[0]["tool_calls"][0]["id"], "tc1");
        assert_eq!(converted[0]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(converted[1]["role"], "tool");
        assert_eq!(converted[1]["tool_call_id"], "tc1");
    }
}
