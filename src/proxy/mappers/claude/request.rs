use super::models::{ClaudeRequest, ContentBlock, MessageContent};
use super::signatures::outbound_signature;
use crate::proxy::model_family::{family_of, is_thinking_model};
use serde_json::{json, Value};

const DEFAULT_THINKING_BUDGET: u32 = 24_576;

// Translates the public Anthropic-shaped request into the backend's wrapped
// payload: `{project, model, request, userAgent, requestId}` with a
// deterministic `sessionId` inside the inner request for cache affinity.
pub fn build_backend_request(
    request: &ClaudeRequest,
    project_id: &str,
    session_id: &str,
) -> Result<Value, String> {
    if request.messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }

    let target_family = family_of(&request.model);
    let thinking_enabled = is_thinking_model(&request.model);

    let mut contents = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let parts = build_parts(&message.content, target_family, thinking_enabled)?;
        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    let mut inner = json!({
        "contents": contents,
        "sessionId": session_id,
    });

    if let Some(system) = &request.system {
        let text = flatten_system(system);
        if !text.is_empty() {
            inner["systemInstruction"] = json!({
                "role": "user",
                "parts": [{ "text": text }]
            });
        }
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if thinking_enabled {
        let budget = request
            .thinking
            .as_ref()
            .and_then(|t| t.budget_tokens)
            .unwrap_or(DEFAULT_THINKING_BUDGET)
            .min(DEFAULT_THINKING_BUDGET);
        generation_config.insert(
            "thinkingConfig".to_string(),
            json!({ "includeThoughts": true, "thinkingBudget": budget }),
        );
    }
    if !generation_config.is_empty() {
        inner["generationConfig"] = Value::Object(generation_config);
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools.iter().map(tool_to_declaration).collect();
        if !declarations.is_empty() {
            inner["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    Ok(json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": request.model,
        "userAgent": "antigravity",
    }))
}

fn build_parts(
    content: &MessageContent,
    target_family: crate::proxy::model_family::ModelFamily,
    thinking_enabled: bool,
) -> Result<Vec<Value>, String> {
    let mut parts = Vec::new();
    match content {
        MessageContent::String(text) => {
            if !text.is_empty() {
                parts.push(json!({ "text": text }));
            }
        }
        MessageContent::Array(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            parts.push(json!({ "text": text }));
                        }
                    }
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    } => {
                        let mut part = json!({ "text": thinking, "thought": true });
                        if let Some(sig) = outbound_signature(
                            signature.as_deref(),
                            target_family,
                            thinking_enabled,
                        ) {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    // Redacted thoughts cannot be replayed to the backend.
                    ContentBlock::RedactedThinking { .. } => {}
                    ContentBlock::ToolUse {
                        id,
                        name,
                        input,
                        signature,
                    } => {
                        let mut part = json!({
                            "functionCall": {
                                "name": name,
                                "args": input,
                                "id": id,
                            }
                        });
                        if let Some(sig) = outbound_signature(
                            signature.as_deref(),
                            target_family,
                            thinking_enabled,
                        ) {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut response = json!({ "result": content });
                        if is_error == &Some(true) {
                            response["isError"] = json!(true);
                        }
                        parts.push(json!({
                            "functionResponse": {
                                "id": tool_use_id,
                                "name": tool_use_id,
                                "response": response,
                            }
                        }));
                    }
                }
            }
        }
    }
    Ok(parts)
}

fn flatten_system(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// Anthropic tool `{name, description, input_schema}` becomes a Gemini
// function declaration `{name, description, parameters}`.
fn tool_to_declaration(tool: &Value) -> Value {
    let mut declaration = serde_json::Map::new();
    if let Some(name) = tool.get("name") {
        declaration.insert("name".to_string(), name.clone());
    }
    if let Some(description) = tool.get("description") {
        declaration.insert("description".to_string(), description.clone());
    }
    if let Some(schema) = tool.get("input_schema").or_else(|| tool.get("parameters")) {
        declaration.insert("parameters".to_string(), schema.clone());
    }
    Value::Object(declaration)
}
