use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
    Unknown,
}

static GEMINI_MAJOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gemini-(\d+)").expect("Invalid gemini version regex"));

pub fn family_of(model: &str) -> ModelFamily {
    let lower = model.to_ascii_lowercase();
    if lower.contains("claude") {
        ModelFamily::Claude
    } else if lower.contains("gemini") {
        ModelFamily::Gemini
    } else {
        ModelFamily::Unknown
    }
}

// Claude models are thinking-capable only with an explicit "-thinking" suffix.
// Gemini models are thinking-capable with the suffix, or from major version 3
// onward where interleaved thoughts became the default.
pub fn is_thinking_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    match family_of(&lower) {
        ModelFamily::Claude => lower.contains("thinking"),
        ModelFamily::Gemini => {
            lower.contains("thinking") || gemini_major_version(&lower).is_some_and(|v| v >= 3)
        }
        ModelFamily::Unknown => false,
    }
}

fn gemini_major_version(lower_model: &str) -> Option<u32> {
    GEMINI_MAJOR_REGEX
        .captures(lower_model)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
}
