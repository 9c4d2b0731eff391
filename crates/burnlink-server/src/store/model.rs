use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// MIME type the sender attaches to text secrets.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A validated creation request, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSecret {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; 12],
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub file_size: Option<u64>,
    pub expires_in: u32,
}

/// Stored in the backend as bincode-encoded bytes, keyed by the secret id.
/// `ciphertext` was produced on the sender's device; the server never sees the key.
/// There is no `consumed` flag: delivery removes the record in the same atomic step.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// AEAD ciphertext with the tag appended.
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce used by the sender.
    pub iv: [u8; 12],
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub file_size: Option<u64>,
    /// Viewing window in seconds, enforced by the recipient's client.
    pub expires_in: u32,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
}

impl SecretRecord {
    pub fn from_new(secret: NewSecret, created_at: i64) -> Self {
        Self {
            ciphertext: secret.ciphertext,
            iv: secret.iv,
            filename: secret.filename,
            content_type: secret.content_type,
            file_size: secret.file_size,
            expires_in: secret.expires_in,
            created_at,
        }
    }

    /// True once the record has outlived the server-side retention window.
    /// Independent of `expires_in`, which only governs display time.
    pub fn is_retention_expired(&self, now: i64, retention_secs: i64) -> bool {
        now.saturating_sub(self.created_at) >= retention_secs
    }
}
