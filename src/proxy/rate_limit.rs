use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

// "30s" / "2.5s" forms carried in error.details retryDelay fields.
static RETRY_DELAY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)s$").expect("Invalid retry delay regex"));

// Extracts the reset delay in milliseconds from a 429 response.
//
// Sources, first match wins:
//   1. `Retry-After` header, either integer seconds or an HTTP-date
//   2. body `error.details[*].retryDelay` in "<n>s" form
//   3. body `error.details[*].retryInfo.retryDelay`, same form
//   4. the configured default cooldown
pub fn parse_reset_ms(
    retry_after: Option<&str>,
    body: &str,
    now_ms: i64,
    default_cooldown_ms: u64,
) -> u64 {
    if let Some(header) = retry_after {
        if let Some(ms) = parse_retry_after(header.trim(), now_ms) {
            return ms;
        }
    }
    if let Some(ms) = parse_retry_delay_from_body(body) {
        return ms;
    }
    default_cooldown_ms
}

fn parse_retry_after(value: &str, now_ms: i64) -> Option<u64> {
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds * 1000);
    }
    // HTTP-date form ("Wed, 21 Oct 2026 07:28:00 GMT").
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.timestamp_millis() - now_ms;
    Some(delta.max(0) as u64)
}

fn parse_retry_delay_from_body(body: &str) -> Option<u64> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let json: Value = serde_json::from_str(trimmed).ok()?;
    let details = json.get("error")?.get("details")?.as_array()?;

    for detail in details {
        if let Some(ms) = detail
            .get("retryDelay")
            .and_then(|v| v.as_str())
            .and_then(parse_delay_string)
        {
            return Some(ms);
        }
    }
    for detail in details {
        if let Some(ms) = detail
            .get("retryInfo")
            .and_then(|r| r.get("retryDelay"))
            .and_then(|v| v.as_str())
            .and_then(parse_delay_string)
        {
            return Some(ms);
        }
    }
    None
}

fn parse_delay_string(s: &str) -> Option<u64> {
    let caps = RETRY_DELAY_REGEX.captures(s.trim())?;
    let seconds: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some((seconds * 1000.0).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: u64 = 30_000;

    #[test]
    fn retry_after_integer_seconds_wins() {
        let body = r#"{"error":{"details":[{"retryDelay":"99s"}]}}"#;
        assert_eq!(parse_reset_ms(Some("5"), body, 0, DEFAULT), 5_000);
    }

    #[test]
    fn retry_after_http_date_is_relative_to_now() {
        let now = chrono::DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .timestamp_millis();
        let reset = parse_reset_ms(Some("Wed, 21 Oct 2026 07:28:30 GMT"), "", now, DEFAULT);
        assert_eq!(reset, 30_000);
    }

    #[test]
    fn past_http_date_clamps_to_zero() {
        let now = chrono::DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .timestamp_millis();
        assert_eq!(
            parse_reset_ms(Some("Wed, 21 Oct 2026 07:27:00 GMT"), "", now, DEFAULT),
            0
        );
    }

    #[test]
    fn body_retry_delay_is_used_when_header_absent() {
        let body = r#"{"error":{"details":[{"reason":"QUOTA_EXHAUSTED"},{"retryDelay":"42s"}]}}"#;
        assert_eq!(parse_reset_ms(None, body, 0, DEFAULT), 42_000);
    }

    #[test]
    fn nested_retry_info_form_is_accepted() {
        let body = r#"{"error":{"details":[{"retryInfo":{"retryDelay":"7s"}}]}}"#;
        assert_eq!(parse_reset_ms(None, body, 0, DEFAULT), 7_000);
    }

    #[test]
    fn fractional_seconds_round_up() {
        let body = r#"{"error":{"details":[{"retryDelay":"1.5s"}]}}"#;
        assert_eq!(parse_reset_ms(None, body, 0, DEFAULT), 1_500);
    }

    #[test]
    fn unparseable_input_falls_back_to_default() {
        assert_eq!(parse_reset_ms(Some("soon"), "try later", 0, DEFAULT), DEFAULT);
        assert_eq!(parse_reset_ms(None, "{not json", 0, DEFAULT), DEFAULT);
    }
}
