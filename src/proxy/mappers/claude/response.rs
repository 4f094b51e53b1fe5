use super::models::{ClaudeResponse, ContentBlock, GeminiResponse, Usage};
use base64::Engine;

// Folds a buffered (non-streaming) backend response into the public shape.
pub fn transform_response(gemini: &GeminiResponse, requested_model: &str) -> ClaudeResponse {
    let mut content = Vec::new();
    let mut used_tool = false;
    let mut finish_reason = None;

    if let Some(candidate) = gemini.candidates.first() {
        finish_reason = candidate.finish_reason.clone();
        if let Some(body) = &candidate.content {
            for part in &body.parts {
                if let Some(fc) = &part.function_call {
                    used_tool = true;
                    content.push(ContentBlock::ToolUse {
                        id: fc
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                        name: fc.name.clone(),
                        input: fc.args.clone().unwrap_or(serde_json::json!({})),
                        signature: part.thought_signature.as_deref().map(decode_signature),
                    });
                    continue;
                }
                let Some(text) = &part.text else { continue };
                if part.thought.unwrap_or(false) {
                    content.push(ContentBlock::Thinking {
                        thinking: text.clone(),
                        signature: part.thought_signature.as_deref().map(decode_signature),
                    });
                } else if !text.is_empty() {
                    content.push(ContentBlock::Text { text: text.clone() });
                }
            }
        }
    }

    let stop_reason = if used_tool {
        "tool_use"
    } else if finish_reason.as_deref() == Some("MAX_TOKENS") {
        "max_tokens"
    } else {
        "end_turn"
    };

    ClaudeResponse {
        id: gemini
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4())),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: gemini
            .model_version
            .clone()
            .unwrap_or_else(|| requested_model.to_string()),
        content,
        stop_reason: stop_reason.to_string(),
        stop_sequence: None,
        usage: gemini
            .usage_metadata
            .map(|u| u.to_claude_usage())
            .unwrap_or_else(Usage::default),
    }
}

// Signatures arrive base64-wrapped on the wire; pass through anything that
// does not decode to UTF-8.
pub fn decode_signature(raw: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(decoded) => String::from_utf8(decoded).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}
