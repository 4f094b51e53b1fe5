use super::models::{GeminiPart, UsageMetadata};
use super::response::decode_signature;
use super::signatures::remember_signature_family;
use crate::proxy::model_family::family_of;
use bytes::Bytes;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    Function,
}

// Transcodes backend parts into the public event taxonomy one event at a
// time; nothing is buffered beyond the current block boundary.
pub struct StreamingState {
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    used_tool: bool,
    pending_signature: Option<String>,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    model_name: Option<String>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            pending_signature: None,
            finish_reason: None,
            usage: None,
            model_name: None,
        }
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    fn emit_delta(&self, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    fn emit_message_start(&mut self, payload: &Value) -> Option<Bytes> {
        if self.message_start_sent {
            return None;
        }
        self.message_start_sent = true;

        if let Some(model) = payload.get("modelVersion").and_then(|v| v.as_str()) {
            self.model_name = Some(model.to_string());
        }
        let mut message = json!({
            "id": payload.get("responseId").and_then(|v| v.as_str()).unwrap_or("msg_unknown"),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": payload.get("modelVersion").and_then(|v| v.as_str()).unwrap_or(""),
            "stop_reason": null,
            "stop_sequence": null,
        });
        if let Some(usage) = payload
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
        {
            message["usage"] = json!(usage.to_claude_usage());
        }

        Some(self.emit(
            "message_start",
            json!({ "type": "message_start", "message": message }),
        ))
    }

    fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        chunks
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }
        let mut chunks = Vec::new();
        if self.block_type == BlockType::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                chunks.push(
                    self.emit_delta(json!({ "type": "signature_delta", "signature": signature })),
                );
            }
        }
        chunks.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block_index += 1;
        self.block_type = BlockType::None;
        chunks
    }

    // One backend SSE payload (already JSON-parsed, envelope unwrapped) in,
    // zero or more public events out.
    pub fn process_payload(&mut self, payload: &Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if let Some(start) = self.emit_message_start(payload) {
            chunks.push(start);
        }

        if let Some(usage) = payload
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
        {
            self.usage = Some(usage);
        }

        if let Some(candidate) = payload
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
            if let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            {
                for raw_part in parts {
                    if let Ok(part) = serde_json::from_value::<GeminiPart>(raw_part.clone()) {
                        chunks.extend(self.process_part(&part));
                    }
                }
            }
        }
        chunks
    }

    fn process_part(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let signature = part.thought_signature.as_deref().map(|raw| {
            let decoded = decode_signature(raw);
            if let Some(model) = &self.model_name {
                remember_signature_family(&decoded, family_of(model));
            }
            decoded
        });

        if let Some(fc) = &part.function_call {
            let mut chunks = Vec::new();
            self.used_tool = true;
            let tool_id = fc
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
            let mut tool_use =
                json!({ "type": "tool_use", "id": tool_id, "name": fc.name, "input": {} });
            if let Some(sig) = &signature {
                tool_use["signature"] = json!(sig);
            }
            chunks.extend(self.start_block(BlockType::Function, tool_use));
            if let Some(args) = &fc.args {
                let partial = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
                chunks.push(self.emit_delta(
                    json!({ "type": "input_json_delta", "partial_json": partial }),
                ));
            }
            chunks.extend(self.end_block());
            return chunks;
        }

        let Some(text) = &part.text else {
            return vec![];
        };

        if part.thought.unwrap_or(false) {
            let mut chunks = Vec::new();
            if self.block_type != BlockType::Thinking {
                chunks.extend(self.start_block(
                    BlockType::Thinking,
                    json!({ "type": "thinking", "thinking": "" }),
                ));
            }
            if !text.is_empty() {
                chunks.push(self.emit_delta(json!({ "type": "thinking_delta", "thinking": text })));
            }
            if signature.is_some() {
                self.pending_signature = signature;
            }
            chunks
        } else {
            if text.is_empty() {
                return vec![];
            }
            let mut chunks = Vec::new();
            if self.block_type != BlockType::Text {
                chunks.extend(
                    self.start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
                );
            }
            chunks.push(self.emit_delta(json!({ "type": "text_delta", "text": text })));
            chunks
        }
    }

    // Closes any open block and terminates the message. Safe to call on an
    // abrupt upstream close; the consumer always sees `message_stop`.
    pub fn finalize(&mut self) -> Vec<Bytes> {
        let mut chunks = self.end_block();

        let stop_reason = if self.used_tool {
            "tool_use"
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };
        let usage = self
            .usage
            .map(|u| u.to_claude_usage())
            .unwrap_or_default();

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": usage
            }),
        ));
        if !self.message_stop_sent {
            self.message_stop_sent = true;
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
        }
        chunks
    }
}

impl Default for StreamingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_text(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn text_stream_produces_the_public_event_sequence() {
        let mut state = StreamingState::new();
        let mut chunks = state.process_payload(&json!({
            "responseId": "resp-1",
            "modelVersion": "claude-sonnet-4-5",
            "candidates": [{"content": {"parts": [{"text": "Hello"}]}}]
        }));
        chunks.extend(state.process_payload(&json!({
            "candidates": [{"content": {"parts": [{"text": " World"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
        })));
        chunks.extend(state.finalize());

        let output = as_text(&chunks);
        let order = [
            "event: message_start",
            "event: content_block_start",
            "\"text\":\"Hello\"",
            "\"text\":\" World\"",
            "event: content_block_stop",
            "event: message_delta",
            "event: message_stop",
        ];
        let mut cursor = 0;
        for needle in order {
            let found = output[cursor..].find(needle).unwrap_or_else(|| {
                panic!("missing {} after position {}", needle, cursor)
            });
            cursor += found;
        }
        assert!(output.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn message_start_is_emitted_once() {
        let mut state = StreamingState::new();
        let payload = json!({
            "responseId": "resp-1",
            "candidates": [{"content": {"parts": [{"text": "a"}]}}]
        });
        let first = as_text(&state.process_payload(&payload));
        let second = as_text(&state.process_payload(&payload));
        assert!(first.contains("message_start"));
        assert!(!second.contains("message_start"));
    }

    #[test]
    fn thinking_block_flushes_signature_before_stop() {
        let mut state = StreamingState::new();
        let mut chunks = state.process_payload(&json!({
            "candidates": [{"content": {"parts": [
                {"text": "pondering", "thought": true, "thoughtSignature": "c2lnLTEyMw=="}
            ]}}]
        }));
        chunks.extend(state.process_payload(&json!({
            "candidates": [{"content": {"parts": [{"text": "result"}]}}]
        })));
        chunks.extend(state.finalize());

        let output = as_text(&chunks);
        let sig_pos = output.find("signature_delta").unwrap();
        let stop_pos = output.find("content_block_stop").unwrap();
        assert!(sig_pos < stop_pos);
        // Base64 wire form is decoded before reaching the client.
        assert!(output.contains("\"signature\":\"sig-123\""));
    }

    #[test]
    fn function_call_signature_rides_on_the_tool_use_block() {
        let mut state = StreamingState::new();
        let mut chunks = state.process_payload(&json!({
            "responseId": "r1",
            "modelVersion": "claude-opus-4-5-thinking",
            "candidates": [{"content": {"parts": [
                {
                    "functionCall": {"name": "grep", "args": {"pattern": "x"}, "id": "call_1"},
                    "thoughtSignature": "c2lnLXRvb2w="
                }
            ]}}]
        }));
        chunks.extend(state.finalize());

        let output = as_text(&chunks);
        let start_pos = output.find("content_block_start").unwrap();
        let sig_pos = output.find("\"signature\":\"sig-tool\"").unwrap();
        let stop_pos = output.find("content_block_stop").unwrap();
        assert!(start_pos < sig_pos && sig_pos < stop_pos);
    }

    #[test]
    fn function_call_emits_tool_block_with_json_delta() {
        let mut state = StreamingState::new();
        let mut chunks = state.process_payload(&json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"name": "grep", "args": {"pattern": "x"}, "id": "call_1"}}
            ]}}]
        }));
        chunks.extend(state.finalize());

        let output = as_text(&chunks);
        assert!(output.contains("\"type\":\"tool_use\""));
        assert!(output.contains("\"name\":\"grep\""));
        assert!(output.contains("input_json_delta"));
        assert!(output.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn finalize_without_any_payload_still_closes_the_message() {
        let mut state = StreamingState::new();
        let output = as_text(&state.finalize());
        assert!(output.contains("message_delta"));
        assert!(output.contains("message_stop"));
    }
}
