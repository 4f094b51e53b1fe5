use crate::proxy::model_family::ModelFamily;
use dashmap::DashMap;
use std::sync::LazyLock;

pub const MIN_SIGNATURE_LENGTH: usize = 50;

// Recognised by the backend as "do not validate this thought signature".
// Sent whenever a thinking-capable model requires a signature the client
// could not supply (absent, truncated, or minted by the other model family).
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

static SIGNATURE_FAMILIES: LazyLock<DashMap<String, ModelFamily>> = LazyLock::new(DashMap::new);

// Remembers which family minted a signature, keyed by the signature itself.
// Streamed signatures are recorded here so a later turn routed to the other
// family can drop them instead of failing validation.
pub fn remember_signature_family(signature: &str, family: ModelFamily) {
    if signature.len() >= MIN_SIGNATURE_LENGTH {
        SIGNATURE_FAMILIES.insert(signature.to_string(), family);
    }
}

pub fn signature_family(signature: &str) -> Option<ModelFamily> {
    SIGNATURE_FAMILIES.get(signature).map(|entry| *entry)
}

// Chooses the signature to place on an outbound thinking/tool part.
//
// A well-formed signature from the same family passes through; everything
// else degrades to the skip sentinel when the model insists on signatures,
// or to nothing at all otherwise.
pub fn outbound_signature(
    signature: Option<&str>,
    target_family: ModelFamily,
    thinking_enabled: bool,
) -> Option<String> {
    if let Some(sig) = signature {
        let cross_family = signature_family(sig).is_some_and(|f| f != target_family);
        if sig.len() >= MIN_SIGNATURE_LENGTH && !cross_family {
            return Some(sig.to_string());
        }
    }
    thinking_enabled.then(|| SKIP_SIGNATURE_SENTINEL.to_string())
}
