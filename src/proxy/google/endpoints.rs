pub const CLOUDCODE_ENDPOINT_DAILY: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const CLOUDCODE_ENDPOINT_PUBLIC: &str = "https://cloudcode-pa.googleapis.com";

pub const METHOD_GENERATE_CONTENT: &str = "generateContent";
pub const METHOD_STREAM_GENERATE_CONTENT: &str = "streamGenerateContent";
pub const METHOD_LOAD_CODE_ASSIST: &str = "loadCodeAssist";
pub const METHOD_FETCH_AVAILABLE_MODELS: &str = "fetchAvailableModels";

pub const SSE_QUERY: &str = "alt=sse";

// Tried in order: the daily sandbox host first, the public host as fallback.
pub fn default_endpoints() -> Vec<String> {
    vec![
        CLOUDCODE_ENDPOINT_DAILY.to_string(),
        CLOUDCODE_ENDPOINT_PUBLIC.to_string(),
    ]
}

pub fn v1_internal_url(base: &str, method: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match query {
        Some(qs) if !qs.trim().is_empty() => format!("{}/v1internal:{}?{}", base, method, qs),
        _ => format!("{}/v1internal:{}", base, method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_sandbox_host_is_tried_first() {
        let endpoints = default_endpoints();
        assert_eq!(endpoints[0], CLOUDCODE_ENDPOINT_DAILY);
        assert_eq!(endpoints[1], CLOUDCODE_ENDPOINT_PUBLIC);
    }

    #[test]
    fn builds_colon_method_urls() {
        assert_eq!(
            v1_internal_url(CLOUDCODE_ENDPOINT_PUBLIC, METHOD_GENERATE_CONTENT, None),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            v1_internal_url(
                CLOUDCODE_ENDPOINT_PUBLIC,
                METHOD_STREAM_GENERATE_CONTENT,
                Some(SSE_QUERY)
            ),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn trailing_slash_on_base_is_tolerated() {
        assert_eq!(
            v1_internal_url("http://127.0.0.1:9000/", METHOD_LOAD_CODE_ASSIST, None),
            "http://127.0.0.1:9000/v1internal:loadCodeAssist"
        );
    }
}
