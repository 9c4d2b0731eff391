use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    store::{self, NewSecret, SecretRecord, StoreError},
    AppState,
};

/// Shortest allowed viewing window, in seconds.
pub const MIN_EXPIRES_IN: u32 = 10;
/// Longest allowed viewing window, in seconds.
pub const MAX_EXPIRES_IN: u32 = 300;
/// Viewing window used when the sender does not pick one.
pub const DEFAULT_EXPIRES_IN: u32 = 30;

const IV_LEN: usize = 12;
/// An AEAD ciphertext is at least as long as its tag.
const MIN_CIPHERTEXT_LEN: usize = 16;
const MAX_METADATA_LEN: usize = 255;

const NOT_FOUND_MESSAGE: &str = "secret not found or already viewed";

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Standard base64 of the ciphertext.
    pub encrypted_data: String,
    /// Standard base64 of the 12-byte nonce.
    pub iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub expires_in: u32,
    pub message: String,
}

/// Body of a successful retrieval. Served once per secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResponse {
    pub id: String,
    pub encrypted_data: String,
    pub iv: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub file_size: Option<u64>,
    pub created_at: i64,
    pub expires_in: u32,
}

impl SecretResponse {
    fn from_record(id: &str, record: &SecretRecord) -> Self {
        Self {
            id: id.to_owned(),
            encrypted_data: STANDARD.encode(&record.ciphertext),
            iv: STANDARD.encode(record.iv),
            filename: record.filename.clone(),
            content_type: record.content_type.clone(),
            file_size: record.file_size,
            created_at: record.created_at,
            expires_in: record.expires_in,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "expires_in must be between {min} and {max} seconds, got {0}",
        min = MIN_EXPIRES_IN,
        max = MAX_EXPIRES_IN
    )]
    ExpiresInOutOfRange(u32),
    #[error("{0} is not valid base64")]
    InvalidEncoding(&'static str),
    #[error("encrypted_data is too short to be an authenticated ciphertext")]
    CiphertextTooShort,
    #[error("encrypted_data exceeds the {limit}-byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("iv must be {len} bytes, got {0}", len = IV_LEN)]
    InvalidIv(usize),
    #[error("{field} must be at most {max} characters", max = MAX_METADATA_LEN)]
    FieldTooLong { field: &'static str },
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl CreateRequest {
    /// Check bounds and decode the transport encoding. Nothing is stored on failure.
    pub fn validate(self, max_payload_bytes: usize) -> Result<NewSecret, ValidationError> {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        if !(MIN_EXPIRES_IN..=MAX_EXPIRES_IN).contains(&expires_in) {
            return Err(ValidationError::ExpiresInOutOfRange(expires_in));
        }

        // Reject on the encoded length before allocating the decoded buffer.
        if self.encrypted_data.len() > base64_len(max_payload_bytes) {
            return Err(ValidationError::PayloadTooLarge {
                limit: max_payload_bytes,
            });
        }
        let ciphertext = STANDARD
            .decode(self.encrypted_data.as_bytes())
            .map_err(|_| ValidationError::InvalidEncoding("encrypted_data"))?;
        if ciphertext.len() > max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                limit: max_payload_bytes,
            });
        }
        if ciphertext.len() < MIN_CIPHERTEXT_LEN {
            return Err(ValidationError::CiphertextTooShort);
        }

        let iv_bytes = STANDARD
            .decode(self.iv.as_bytes())
            .map_err(|_| ValidationError::InvalidEncoding("iv"))?;
        let iv: [u8; IV_LEN] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ValidationError::InvalidIv(iv_bytes.len()))?;

        check_len("filename", self.filename.as_deref())?;
        check_len("content_type", self.content_type.as_deref())?;

        Ok(NewSecret {
            ciphertext,
            iv,
            filename: self.filename,
            content_type: self.content_type,
            file_size: self.file_size,
            expires_in,
        })
    }
}

fn check_len(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > MAX_METADATA_LEN => {
            Err(ValidationError::FieldTooLong { field })
        }
        _ => Ok(()),
    }
}

/// Length of the padded base64 encoding of `n` bytes.
pub fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

pub async fn create_secret(
    State(state): State<AppState>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return bad_request(ValidationError::Malformed(rejection.body_text()));
        }
    };

    let secret = match body.validate(state.max_payload_bytes) {
        Ok(secret) => secret,
        Err(e) => {
            debug!(error = %e, "rejected secret submission");
            return bad_request(e);
        }
    };
    let expires_in = secret.expires_in;
    let size = secret.ciphertext.len();

    match state.store.create(secret) {
        Ok(id) => {
            info!(id = %id, size, expires_in, "secret created");
            (
                StatusCode::CREATED,
                Json(CreateResponse {
                    id,
                    expires_in,
                    message: "secret created".into(),
                }),
            )
                .into_response()
        }
        Err(e) => storage_error(e),
    }
}

// ── Retrieve ──────────────────────────────────────────────────────────────────

pub async fn get_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !store::is_valid_id(&id) {
        return not_found();
    }
    match state.store.consume_if_pending(&id) {
        Ok(Some(record)) => {
            info!(id = %id, "secret delivered and destroyed");
            (
                [(header::CACHE_CONTROL, "no-store")],
                Json(SecretResponse::from_record(&id, &record)),
            )
                .into_response()
        }
        Ok(None) => {
            debug!(id = %id, "secret not found or already viewed");
            not_found()
        }
        // Fail closed: no record leaves the store when the consume primitive errors.
        Err(e) => storage_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_request(e: ValidationError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": NOT_FOUND_MESSAGE})),
    )
        .into_response()
}

fn storage_error(e: StoreError) -> Response {
    error!(error = %e, "storage failure");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "storage unavailable"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ciphertext: &[u8], iv: &[u8], expires_in: Option<u32>) -> CreateRequest {
        CreateRequest {
            encrypted_data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            filename: None,
            content_type: Some("text/plain".into()),
            file_size: None,
            expires_in,
        }
    }

    #[test]
    fn defaults_expires_in() {
        let secret = request(&[0u8; 32], &[0u8; 12], None).validate(1024).unwrap();
        assert_eq!(secret.expires_in, DEFAULT_EXPIRES_IN);
        assert_eq!(secret.ciphertext.len(), 32);
    }

    #[test]
    fn expires_in_bounds_are_inclusive() {
        assert!(request(&[0u8; 32], &[0u8; 12], Some(10)).validate(1024).is_ok());
        assert!(request(&[0u8; 32], &[0u8; 12], Some(300)).validate(1024).is_ok());
        assert_eq!(
            request(&[0u8; 32], &[0u8; 12], Some(9)).validate(1024).unwrap_err(),
            ValidationError::ExpiresInOutOfRange(9)
        );
        assert_eq!(
            request(&[0u8; 32], &[0u8; 12], Some(301)).validate(1024).unwrap_err(),
            ValidationError::ExpiresInOutOfRange(301)
        );
    }

    #[test]
    fn rejects_bad_iv_length() {
        assert_eq!(
            request(&[0u8; 32], &[0u8; 16], Some(30)).validate(1024).unwrap_err(),
            ValidationError::InvalidIv(16)
        );
    }

    #[test]
    fn rejects_bad_base64() {
        let mut req = request(&[0u8; 32], &[0u8; 12], Some(30));
        req.encrypted_data = "not base64 !!".into();
        assert_eq!(
            req.validate(1024).unwrap_err(),
            ValidationError::InvalidEncoding("encrypted_data")
        );
    }

    #[test]
    fn rejects_tagless_and_oversized_payloads() {
        assert_eq!(
            request(&[0u8; 4], &[0u8; 12], Some(30)).validate(1024).unwrap_err(),
            ValidationError::CiphertextTooShort
        );
        assert_eq!(
            request(&[0u8; 2048], &[0u8; 12], Some(30)).validate(1024).unwrap_err(),
            ValidationError::PayloadTooLarge { limit: 1024 }
        );
    }

    #[test]
    fn rejects_long_filename() {
        let mut req = request(&[0u8; 32], &[0u8; 12], Some(30));
        req.filename = Some("a".repeat(256));
        assert_eq!(
            req.validate(1024).unwrap_err(),
            ValidationError::FieldTooLong { field: "filename" }
        );
    }
}
