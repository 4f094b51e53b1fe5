use crate::proxy::dispatch::errors::DispatchError;
use crate::proxy::dispatch::DispatchOutcome;
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::state::AppState;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::{error, info};

const ROUTABLE_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5",
    "claude-opus-4-5-thinking",
    "gemini-3-flash",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
];

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id: String =
        rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
            .take(6)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "type": "error",
                    "error": {
                        "type": "invalid_request_error",
                        "message": format!("Invalid request body: {}", e)
                    }
                })),
            )
                .into_response();
        }
    };

    info!(
        "[{}] Request | Model: {} | Stream: {} | Messages: {} | Tools: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.is_some()
    );

    let wants_stream = request.stream;
    match state
        .dispatcher
        .send(&request, state.config.fallback_enabled)
        .await
    {
        Ok(DispatchOutcome::Json(response)) => {
            info!(
                "[{}] Finished | Tokens: In {}, Out {}",
                trace_id, response.usage.input_tokens, response.usage.output_tokens
            );
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(DispatchOutcome::Stream(stream)) => {
            let body_stream = stream.map(|item| -> Result<Bytes, Infallible> {
                match item {
                    Ok(bytes) => Ok(bytes),
                    // Mid-stream failures become an error event; the stream
                    // then closes on the consumer's side.
                    Err(message) => Ok(error_event_bytes(&message)),
                }
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(body_stream))
                .unwrap()
        }
        Err(err) => {
            error!("[{}] Dispatch failed: {}", trace_id, err);
            error_response(&err, wants_stream)
        }
    }
}

pub async fn handle_list_models() -> Response {
    let data: Vec<Value> = ROUTABLE_MODELS
        .iter()
        .map(|id| json!({ "id": id, "type": "model" }))
        .collect();
    Json(json!({ "data": data, "has_more": false })).into_response()
}

fn error_event_bytes(message: &str) -> Bytes {
    let event = json!({
        "type": "error",
        "error": { "type": "api_error", "message": message }
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", event))
}

fn error_response(err: &DispatchError, streaming: bool) -> Response {
    let body = json!({
        "type": "error",
        "error": {
            "type": err.error_type(),
            "message": err.to_string()
        }
    });
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);

    if streaming {
        let payload = format!("event: error\ndata: {}\n\n", body);
        return Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(payload))
            .unwrap();
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_render_as_anthropic_error_objects() {
        let err = DispatchError::ResourceExhausted {
            model: "claude-sonnet-4-5".to_string(),
            reset_at: 123,
        };
        let response = error_response(&err, false);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn streaming_errors_close_with_an_error_event() {
        let err = DispatchError::NoAccountsAvailable;
        let response = error_response(&err, true);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }

    #[tokio::test]
    async fn model_catalog_lists_routable_models() {
        let response = handle_list_models().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
