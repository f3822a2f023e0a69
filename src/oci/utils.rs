use sha2::{Digest, Sha256};

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical `sha256:<hex>` digest of a blob or manifest body
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_bytes(data))
}
