use std::sync::LazyLock;

// The backend only accepts traffic that identifies itself as the Antigravity
// IDE, so the outbound identity mirrors its user-agent shape.
pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "antigravity/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub static CLIENT_METADATA: LazyLock<String> = LazyLock::new(|| {
    serde_json::json!({
        "ideType": "ANTIGRAVITY",
        "platform": std::env::consts::OS,
        "pluginType": "ANTIGRAVITY",
    })
    .to_string()
});
