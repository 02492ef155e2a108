// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Most hosted and local inference servers speak the same
//! `/chat/completions` SSE wire format, so one driver configured with a
//! base URL and an optional key covers them all.
use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::{EventStream, ModelProvider};
use crate::types::{
    ChatContent, CompletionRequest, ModelInfo, ProviderError, Role, StreamEvent, StreamUsage,
};

pub struct OpenAICompatProvider {
    driver_name: &'static str,
    model: String,
    /// Pre-resolved key; `None` for local servers.
    api_key: Option<String>,
    chat_url: String,
    info: ModelInfo,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        info: ModelInfo,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            info,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages = build_openai_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max) = req.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    fn provider_id(&self) -> &str {
        self.driver_name
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn info(&self) -> ModelInfo {
        self.info
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        let body = self.build_body(&req);
        debug!(
            driver = self.driver_name,
            model = %self.model,
            messages = req.messages.len(),
            tools = req.tools.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(text),
                429 => ProviderError::RateLimited(text),
                code => ProviderError::Api {
                    status: code,
                    message: text,
                },
            });
        }

        // SSE events can be split across TCP packets: keep a line buffer
        // and a per-index accumulator for parallel tool-call deltas.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let events = match chunk {
                    Ok(bytes) => {
                        state.buf.push_str(&String::from_utf8_lossy(&bytes));
                        state.drain()
                    }
                    Err(e) => vec![Err(ProviderError::Network(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

#[derive(Default)]
struct SseState {
    buf: String,
    /// Tool-call argument fragments keyed by the provider's parallel index.
    pending: HashMap<u32, (String, String, String)>,
    text_open: bool,
    reasoning_open: bool,
    usage: Option<StreamUsage>,
}

impl SseState {
    /// Drain complete `data:` lines from the buffer into events.  The
    /// trailing incomplete line stays buffered for the next TCP chunk.
    fn drain(&mut self) -> Vec<Result<StreamEvent, ProviderError>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.finish(&mut out);
                continue;
            }
            let chunk: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("unparsable SSE chunk: {e}");
                    continue;
                }
            };
            self.chunk_events(&chunk, &mut out);
        }
        out
    }

    fn chunk_events(&mut self, chunk: &Value, out: &mut Vec<Result<StreamEvent, ProviderError>>) {
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(StreamUsage {
                input: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output: usage["completion_tokens"].as_u64().unwrap_or(0),
                reasoning: usage["completion_tokens_details"]["reasoning_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                cache_read: usage["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                cache_write: 0,
            });
        }
        let Some(choice) = chunk["choices"].get(0) else {
            return;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["reasoning_content"].as_str() {
            if !text.is_empty() {
                self.reasoning_open = true;
                out.push(Ok(StreamEvent::ReasoningDelta(text.to_string())));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                if self.reasoning_open {
                    self.reasoning_open = false;
                    out.push(Ok(StreamEvent::ReasoningEnd));
                }
                self.text_open = true;
                out.push(Ok(StreamEvent::TextDelta(text.to_string())));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as u32;
                let entry = self.pending.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.0 = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.1.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.2.push_str(args);
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            if reason == "length" {
                out.push(Err(ProviderError::OutputLength(
                    "finish_reason=length".to_string(),
                )));
            }
        }
    }

    /// `[DONE]`: close open blocks, flush assembled tool calls in index
    /// order, emit the final step accounting.
    fn finish(&mut self, out: &mut Vec<Result<StreamEvent, ProviderError>>) {
        if self.reasoning_open {
            self.reasoning_open = false;
            out.push(Ok(StreamEvent::ReasoningEnd));
        }
        if self.text_open {
            self.text_open = false;
            out.push(Ok(StreamEvent::TextEnd));
        }
        let mut pending: Vec<(u32, (String, String, String))> = self.pending.drain().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        for (i, (_, (id, name, args))) in pending.into_iter().enumerate() {
            if name.is_empty() {
                warn!(call_id = %id, "dropping tool call with empty name");
                continue;
            }
            let id = if id.is_empty() {
                format!("call_synthetic_{i}")
            } else {
                id
            };
            out.push(Ok(StreamEvent::ToolCall {
                id,
                name,
                arguments: args,
            }));
        }
        let usage = self.usage.take().unwrap_or_default();
        out.push(Ok(StreamEvent::StepFinish { usage, cost: 0.0 }));
        out.push(Ok(StreamEvent::Done));
    }
}

/// Serialize wire messages into the OpenAI JSON shape.  Consecutive
/// assistant tool calls become one assistant message with a `tool_calls`
/// array, which is what the strict servers expect.
fn build_openai_messages(messages: &[crate::ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::Tool, ChatContent::ToolResult { call_id, content }) => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": content,
                }));
            }
            (_, ChatContent::ToolCall {
                call_id,
                name,
                arguments,
            }) => {
                let call = json!({
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                });
                match out.last_mut() {
                    Some(last)
                        if last["role"] == "assistant"
                            && last.get("tool_calls").is_some() =>
                    {
                        if let Some(calls) = last["tool_calls"].as_array_mut() {
                            calls.push(call);
                        }
                    }
                    _ => out.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [call],
                    })),
                }
            }
            (role, ChatContent::Text(text)) => {
                let role = match role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                out.push(json!({ "role": role, "content": text }));
            }
            (Role::System | Role::User | Role::Assistant, ChatContent::ToolResult { .. }) => {
                // Malformed pairing; skip rather than corrupt the request.
                warn!("tool result on non-tool role dropped");
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    fn drain_all(state: &mut SseState, text: &str) -> Vec<Result<StreamEvent, ProviderError>> {
        state.buf.push_str(text);
        state.drain()
    }

    #[test]
    fn text_deltas_stream_through() {
        let mut state = SseState::default();
        let events = drain_all(
            &mut state,
            "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        );
        let texts: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap())
            .filter_map(|e| match e {
                StreamEvent::TextDelta(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["hel", "lo"]);
    }

    #[test]
    fn incomplete_line_stays_buffered() {
        let mut state = SseState::default();
        let events = drain_all(&mut state, "data: {\"choices\":[{\"delta\":{\"conte");
        assert!(events.is_empty());
        let events = drain_all(&mut state, "nt\":\"x\"}}]}\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn done_flushes_toolcalls_in_index_order() {
        let mut state = SseState::default();
        let events = drain_all(
            &mut state,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[\
                {\"index\":1,\"id\":\"b\",\"function\":{\"name\":\"write\",\"arguments\":\"{}\"}},\
                {\"index\":0,\"id\":\"a\",\"function\":{\"name\":\"read\",\"arguments\":\"{}\"}}\
             ]}}]}\n\
             data: [DONE]\n",
        );
        let names: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap())
            .filter_map(|e| match e {
                StreamEvent::ToolCall { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["read", "write"]);
    }

    #[test]
    fn done_emits_step_finish_with_usage() {
        let mut state = SseState::default();
        let events = drain_all(
            &mut state,
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\
             data: [DONE]\n",
        );
        let usage = events
            .into_iter()
            .map(|e| e.unwrap())
            .find_map(|e| match e {
                StreamEvent::StepFinish { usage, .. } => Some(usage),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.input, 7);
        assert_eq!(usage.output, 3);
    }

    #[test]
    fn length_finish_reason_is_output_length_error() {
        let mut state = SseState::default();
        let events = drain_all(
            &mut state,
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n",
        );
        assert!(matches!(
            events[0],
            Err(ProviderError::OutputLength(_))
        ));
    }

    #[test]
    fn consecutive_tool_calls_merge_into_one_assistant_message() {
        let msgs = vec![
            ChatMessage::tool_call("a", "read", "{}"),
            ChatMessage::tool_call("b", "write", "{}"),
            ChatMessage::tool_result("a", "ok"),
        ];
        let wire = build_openai_messages(&msgs);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(wire[1]["role"], "tool");
    }
}
