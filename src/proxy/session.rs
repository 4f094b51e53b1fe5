use crate::proxy::mappers::claude::models::{ClaudeRequest, ContentBlock, MessageContent};
use sha2::{Digest, Sha256};

// Derives a stable session fingerprint for a conversation.
//
// Only the first meaningful user message is hashed; model names and timestamps
// never enter the digest, so every turn of the same conversation (including
// retries and model fallbacks) maps to the same backend session and keeps its
// cache affinity.
pub fn extract_session_id(request: &ClaudeRequest) -> String {
    if let Some(metadata) = &request.metadata {
        if let Some(user_id) = &metadata.user_id {
            if !user_id.is_empty() && !user_id.contains("session-") {
                return user_id.clone();
            }
        }
    }

    let mut hasher = Sha256::new();
    let mut content_found = false;
    for msg in &request.messages {
        if msg.role != "user" {
            continue;
        }
        let text = flatten_text(&msg.content);
        let clean = text.trim();
        // Very short messages are usually CLI probes; system reminders vary
        // between turns and would break the fingerprint.
        if clean.len() > 10 && !clean.contains("<system-reminder>") {
            hasher.update(clean.as_bytes());
            content_found = true;
            break;
        }
    }

    if !content_found {
        if let Some(last) = request.messages.last() {
            hasher.update(flatten_text(&last.content).as_bytes());
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hash[..16])
}

fn flatten_text(content: &MessageContent) -> String {
    match content {
        MessageContent::String(s) => s.clone(),
        MessageContent::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}
