// Stream collector: folds an already-transcoded public event stream into one
// buffered response, so non-streaming callers can ride the SSE path used by
// thinking models.

use super::models::{ClaudeResponse, ContentBlock, Usage};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

struct SseEvent {
    event_type: String,
    data: Value,
}

fn parse_sse_line(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    Some((&line[..colon], line[colon + 1..].trim_start()))
}

pub async fn collect_stream_to_json<S>(mut stream: S) -> Result<ClaudeResponse, String>
where
    S: futures::Stream<Item = Result<Bytes, String>> + Unpin,
{
    let mut events = Vec::new();
    let mut current_event_type = String::new();
    let mut current_data = String::new();
    let mut pending = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let line = line.trim_end();
            if line.is_empty() {
                if !current_data.is_empty() {
                    if let Ok(data) = serde_json::from_str::<Value>(&current_data) {
                        events.push(SseEvent {
                            event_type: current_event_type.clone(),
                            data,
                        });
                    }
                    current_event_type.clear();
                    current_data.clear();
                }
            } else if let Some((key, value)) = parse_sse_line(line) {
                match key {
                    "event" => current_event_type = value.to_string(),
                    "data" => current_data = value.to_string(),
                    _ => {}
                }
            }
        }
    }

    let mut response = ClaudeResponse {
        id: "msg_unknown".to_string(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: String::new(),
        content: Vec::new(),
        stop_reason: "end_turn".to_string(),
        stop_sequence: None,
        usage: Usage::default(),
    };

    let mut current_text = String::new();
    let mut current_thinking = String::new();
    let mut current_signature: Option<String> = None;
    let mut current_tool_use: Option<Value> = None;
    let mut current_tool_input = String::new();

    for event in events {
        match event.event_type.as_str() {
            "message_start" => {
                if let Some(message) = event.data.get("message") {
                    if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                        response.id = id.to_string();
                    }
                    if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                        response.model = model.to_string();
                    }
                    if let Some(usage) = message.get("usage") {
                        if let Ok(u) = serde_json::from_value::<Usage>(usage.clone()) {
                            response.usage = u;
                        }
                    }
                }
            }
            "content_block_start" => {
                if let Some(block) = event.data.get("content_block") {
                    match block.get("type").and_then(|v| v.as_str()) {
                        Some("text") => current_text.clear(),
                        Some("thinking") => {
                            current_thinking.clear();
                            current_signature = None;
                        }
                        Some("tool_use") => {
                            current_tool_use = Some(block.clone());
                            current_tool_input.clear();
                            current_signature = None;
                        }
                        _ => {}
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.data.get("delta") {
                    match delta.get("type").and_then(|v| v.as_str()) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                current_text.push_str(text);
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(thinking) = delta.get("thinking").and_then(|v| v.as_str()) {
                                current_thinking.push_str(thinking);
                            }
                        }
                        Some("signature_delta") => {
                            if let Some(sig) = delta.get("signature").and_then(|v| v.as_str()) {
                                current_signature = Some(sig.to_string());
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(partial) =
                                delta.get("partial_json").and_then(|v| v.as_str())
                            {
                                current_tool_input.push_str(partial);
                            }
                        }
                        _ => {}
                    }
                }
            }
            "content_block_stop" => {
                if !current_text.is_empty() {
                    response.content.push(ContentBlock::Text {
                        text: std::mem::take(&mut current_text),
                    });
                } else if !current_thinking.is_empty() {
                    response.content.push(ContentBlock::Thinking {
                        thinking: std::mem::take(&mut current_thinking),
                        signature: current_signature.take(),
                    });
                } else if let Some(tool_use) = current_tool_use.take() {
                    let input = if current_tool_input.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&current_tool_input).unwrap_or(json!({}))
                    };
                    // The signature arrives on the block itself, or as a
                    // signature_delta while the block is open.
                    let signature = tool_use
                        .get("signature")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .or_else(|| current_signature.take());
                    response.content.push(ContentBlock::ToolUse {
                        id: tool_use
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        name: tool_use
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        input,
                        signature,
                    });
                    current_tool_input.clear();
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = event
                    .data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    response.stop_reason = stop_reason.to_string();
                }
                if let Some(usage) = event.data.get("usage") {
                    if let Ok(u) = serde_json::from_value::<Usage>(usage.clone()) {
                        response.usage = u;
                    }
                }
            }
            "message_stop" => break,
            "error" => {
                let message = event
                    .data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown stream error");
                return Err(message.to_string());
            }
            _ => {}
        }
    }

    Ok(response)
}
