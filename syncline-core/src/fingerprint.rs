use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn calculate_checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content fingerprint pairing an optimistic write with its confirmed event when
/// the feed assigns a different id than the caller did.
pub fn match_key(author_id: &str, content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
