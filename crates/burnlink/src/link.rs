use std::fmt;
use std::str::FromStr;

use burnlink_server::store::is_valid_id;
use thiserror::Error;

use crate::envelope::{export_key, import_key, CryptoError, SecretKey};

const VIEW_PATH: &str = "/view/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link has no key fragment")]
    MissingKey,
    #[error("malformed link: {0}")]
    Malformed(String),
    #[error("link does not carry a valid secret id")]
    InvalidId,
    #[error(transparent)]
    Key(#[from] CryptoError),
}

/// `<origin>/view/<id>#<key>`. The fragment is never sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    origin: String,
    id: String,
    key: SecretKey,
}

impl ShareLink {
    pub fn new(
        origin: impl Into<String>,
        id: impl Into<String>,
        key: SecretKey,
    ) -> Result<Self, LinkError> {
        let origin = origin.into().trim_end_matches('/').to_owned();
        if !(origin.starts_with("http://") || origin.starts_with("https://")) {
            return Err(LinkError::Malformed(format!(
                "origin must be http(s), got {origin:?}"
            )));
        }
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(LinkError::InvalidId);
        }
        Ok(Self { origin, id, key })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{VIEW_PATH}{}#{}",
            self.origin,
            self.id,
            export_key(&self.key)
        )
    }
}

impl FromStr for ShareLink {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (location, fragment) = match s.split_once('#') {
            Some((location, fragment)) if !fragment.is_empty() => (location, fragment),
            _ => return Err(LinkError::MissingKey),
        };
        let (origin, rest) = location
            .rsplit_once(VIEW_PATH)
            .ok_or_else(|| LinkError::Malformed(format!("expected a {VIEW_PATH} path")))?;
        let id = rest
            .split(['?', '/'])
            .next()
            .unwrap_or_default();

        let key = import_key(fragment)?;
        Self::new(origin, id, key)
    }
}
