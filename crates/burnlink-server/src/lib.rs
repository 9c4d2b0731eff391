pub mod auth;
pub mod handlers;
pub mod server;
pub mod store;

use std::sync::Arc;

use store::SecretStore;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SecretStore>,
    /// Optional API key for write-protecting secret creation.
    pub api_key: Option<String>,
    /// Largest accepted ciphertext, in decoded bytes.
    pub max_payload_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            api_key: None,
            max_payload_bytes: server::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

pub use server::{resolve_data_dir, router, run, serve, ServerConfig, StoreBackend};
