//! HTTP client for the submission and retrieval protocol.
//!
//! Encryption and decryption happen here, on the caller's side; only
//! ciphertext, nonce and display metadata cross the wire.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use burnlink_server::handlers::{CreateRequest, CreateResponse, SecretResponse};
use burnlink_server::store::{is_valid_id, TEXT_CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::envelope::{self, decode_iv, CryptoError};
use crate::link::ShareLink;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Never existed, already viewed, or past retention. The server does not say which.
    #[error("secret not found or already viewed")]
    NotFound,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("server storage is unavailable")]
    Unavailable,
    #[error("malformed server response: {0}")]
    Malformed(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// What the sender shares.
#[derive(Clone)]
pub enum Payload {
    Text(String),
    File {
        filename: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl Payload {
    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::File { bytes, .. } => bytes,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => write!(f, "Text({} bytes)", text.len()),
            Payload::File {
                filename,
                content_type,
                bytes,
            } => f
                .debug_struct("File")
                .field("filename", filename)
                .field("content_type", content_type)
                .field("size", &bytes.len())
                .finish(),
        }
    }
}

/// A decrypted secret. The plaintext buffer is wiped when dropped.
pub struct Opened {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub file_size: Option<u64>,
    /// Viewing window in seconds.
    pub expires_in: u32,
}

impl Opened {
    /// The plaintext as text, for text secrets that decode as UTF-8.
    /// Anything else is treated as a file blob.
    pub fn as_text(&self) -> Option<&str> {
        if self.filename.is_some() || self.content_type.as_deref() != Some(TEXT_CONTENT_TYPE) {
            return None;
        }
        std::str::from_utf8(&self.plaintext).ok()
    }
}

impl fmt::Debug for Opened {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opened")
            .field("plaintext", &format_args!("[{} bytes]", self.plaintext.len()))
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("file_size", &self.file_size)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: String,
    public_origin: String,
    token: Option<String>,
}

impl Client {
    /// Client for the server at `api_base`. Links are issued under the same origin
    /// unless [`Client::with_public_origin`] says otherwise.
    pub fn new(api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_owned();
        Self {
            http: reqwest::Client::new(),
            public_origin: api_base.clone(),
            api_base,
            token: None,
        }
    }

    pub fn with_public_origin(mut self, origin: impl Into<String>) -> Self {
        self.public_origin = origin.into().trim_end_matches('/').to_owned();
        self
    }

    /// Bearer token for servers that protect secret creation.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Encrypt `payload` under a fresh key, upload the ciphertext, and return
    /// the share link carrying the key in its fragment.
    pub async fn submit(&self, payload: &Payload, expires_in: u32) -> Result<ShareLink, ClientError> {
        let key = envelope::generate_key();
        let sealed = envelope::encrypt(payload.bytes(), &key)?;

        let (filename, content_type, file_size) = match payload {
            Payload::Text(_) => (None, Some(TEXT_CONTENT_TYPE.to_owned()), None),
            Payload::File {
                filename,
                content_type,
                bytes,
            } => (
                Some(filename.clone()),
                Some(content_type.clone()),
                Some(bytes.len() as u64),
            ),
        };
        let body = CreateRequest {
            encrypted_data: STANDARD.encode(&sealed.ciphertext),
            iv: STANDARD.encode(sealed.iv),
            filename,
            content_type,
            file_size,
            expires_in: Some(expires_in),
        };

        let request = self
            .http
            .post(format!("{}/api/secrets", self.api_base))
            .json(&body);
        let resp = self.authorized(request).send().await?;

        let created: CreateResponse = match resp.status() {
            StatusCode::CREATED | StatusCode::OK => resp
                .json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))?,
            _ => return Err(failure(resp).await),
        };
        debug!(id = %created.id, expires_in = created.expires_in, "secret uploaded");

        ShareLink::new(&self.public_origin, created.id, key)
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// The raw consume call. A second call for the same id is `NotFound`.
    pub async fn fetch(&self, id: &str) -> Result<SecretResponse, ClientError> {
        if !is_valid_id(id) {
            return Err(ClientError::NotFound);
        }
        let resp = self
            .http
            .get(format!("{}/api/secrets/{id}", self.api_base))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => resp
                .json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string())),
            _ => Err(failure(resp).await),
        }
    }

    /// Consume the secret behind `link` and decrypt it with the link's key.
    pub async fn retrieve(&self, link: &ShareLink) -> Result<Opened, ClientError> {
        let secret = self.fetch(link.id()).await?;

        let ciphertext = STANDARD
            .decode(secret.encrypted_data.as_bytes())
            .map_err(|_| ClientError::Malformed("encrypted_data is not base64".into()))?;
        let iv_bytes = STANDARD
            .decode(secret.iv.as_bytes())
            .map_err(|_| ClientError::Malformed("iv is not base64".into()))?;
        let iv = decode_iv(&iv_bytes)?;

        let plaintext = envelope::decrypt(&ciphertext, link.key(), &iv)?;
        Ok(Opened {
            plaintext,
            filename: secret.filename,
            content_type: secret.content_type,
            file_size: secret.file_size,
            expires_in: secret.expires_in,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn failure(resp: Response) -> ClientError {
    let status = resp.status();
    match status {
        StatusCode::NOT_FOUND => ClientError::NotFound,
        StatusCode::SERVICE_UNAVAILABLE => ClientError::Unavailable,
        _ => {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_owned))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_owned());
            ClientError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}
