use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    handlers::{self, create_secret, get_secret, health},
    store::{spawn_sweep, MemoryStore, RedbStore, SecretStore},
    AppState,
};

/// Default ciphertext ceiling: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Which backend holds pending secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Durable redb file in the data directory.
    Redb,
    /// Process memory; everything is lost on restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend {other:?} (expected redb or memory)"),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required to create secrets ($BURNLINK_API_KEY).
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub store: StoreBackend,
    /// Server-side lifetime of a secret nobody opened.
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BURNLINK_PORT").unwrap_or(8080),
            api_key: std::env::var("BURNLINK_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            store: env_parse("BURNLINK_STORE").unwrap_or(StoreBackend::Redb),
            retention: Duration::from_secs(env_parse("BURNLINK_RETENTION_SECS").unwrap_or(86_400)),
            sweep_interval: Duration::from_secs(
                positive_secs("BURNLINK_SWEEP_INTERVAL_SECS").unwrap_or(60),
            ),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
            max_payload_bytes: env_parse("BURNLINK_MAX_PAYLOAD_BYTES")
                .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

/// Like [`env_parse`], but zero is ignored with a warning.
fn positive_secs(name: &str) -> Option<u64> {
    nonzero(name, env_parse(name)?)
}

fn nonzero(name: &str, secs: u64) -> Option<u64> {
    if secs == 0 {
        warn!(var = name, "ignoring zero interval, using the default");
        return None;
    }
    Some(secs)
}

/// Resolve (and create) the directory holding `burnlink.db`: the configured
/// one, else the platform data dir (`~/.local/share/burnlink/`, etc.).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "burnlink")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

fn open_store(cfg: &ServerConfig) -> Result<Arc<dyn SecretStore>> {
    match cfg.store {
        StoreBackend::Redb => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
            info!(data_dir = %data_dir.display(), "using data directory");
            let store = RedbStore::open(&data_dir.join("burnlink.db"), cfg.retention)
                .context("open store")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory store; pending secrets are lost on restart");
            Ok(Arc::new(MemoryStore::new(cfg.retention)))
        }
    }
}

/// Build the HTTP router. Creation sits behind the optional API key;
/// retrieval is public since possession of the id is the capability.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Transport encoding inflates the ciphertext; leave room for the JSON envelope.
    let body_limit = handlers::base64_len(state.max_payload_bytes) + 64 * 1024;

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/secrets/{id}", get(get_secret));

    let protected = Router::new()
        .route("/api/secrets", post(create_secret))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let store = open_store(&cfg)?;
    info!(
        retention_secs = cfg.retention.as_secs(),
        pending = store.pending_count().unwrap_or(0),
        "store ready"
    );
    if cfg.api_key.is_some() {
        info!("secret creation requires an API key");
    }

    let sweep = spawn_sweep(store.clone(), cfg.sweep_interval);

    let state = AppState {
        store,
        api_key: cfg.api_key,
        max_payload_bytes: cfg.max_payload_bytes,
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnlink server listening");
    let listener = TcpListener::bind(addr).await.context("bind listener")?;

    let served = serve(listener, app, shutdown_signal()).await;
    sweep.shutdown().await;
    info!("burnlink server stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{CreateRequest, CreateResponse, SecretResponse};
    use crate::store::{NewSecret, SecretRecord, StoreError};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::Value;

    const DAY: Duration = Duration::from_secs(86_400);

    async fn spawn_app(state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            router(state, None),
            std::future::pending::<()>(),
        ));
        format!("http://{addr}")
    }

    fn create_body() -> CreateRequest {
        CreateRequest {
            encrypted_data: STANDARD.encode([9u8; 40]),
            iv: STANDARD.encode([3u8; 12]),
            filename: None,
            content_type: Some("text/plain".into()),
            file_size: None,
            expires_in: Some(30),
        }
    }

    #[tokio::test]
    async fn create_then_retrieve_once() {
        let base = spawn_app(AppState::new(Arc::new(MemoryStore::new(DAY)))).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/secrets"))
            .json(&create_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let created: CreateResponse = resp.json().await.unwrap();
        assert_eq!(created.expires_in, 30);

        let resp = client
            .get(format!("{base}/api/secrets/{}", created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["cache-control"], "no-store");
        let secret: SecretResponse = resp.json().await.unwrap();
        assert_eq!(secret.id, created.id);
        assert_eq!(STANDARD.decode(secret.encrypted_data).unwrap(), [9u8; 40]);
        assert_eq!(STANDARD.decode(secret.iv).unwrap(), [3u8; 12]);
        assert_eq!(secret.expires_in, 30);

        let again = client
            .get(format!("{base}/api/secrets/{}", created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 404);
    }

    #[tokio::test]
    async fn not_found_responses_are_indistinguishable() {
        let base = spawn_app(AppState::new(Arc::new(MemoryStore::new(DAY)))).await;
        let client = reqwest::Client::new();

        let mut bodies = Vec::new();
        for id in ["not-an-id".to_string(), crate::store::generate_id()] {
            let resp = client
                .get(format!("{base}/api/secrets/{id}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 404);
            bodies.push(resp.json::<Value>().await.unwrap());
        }
        assert_eq!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn invalid_submission_stores_nothing() {
        let store = Arc::new(MemoryStore::new(DAY));
        let base = spawn_app(AppState::new(store.clone())).await;
        let client = reqwest::Client::new();

        let mut body = create_body();
        body.expires_in = Some(3_600);
        let resp = client
            .post(format!("{base}/api/secrets"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let json: Value = resp.json().await.unwrap();
        assert!(json["error"].as_str().unwrap().contains("expires_in"));

        let resp = client
            .post(format!("{base}/api/secrets"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn api_key_guards_creation_only() {
        let mut state = AppState::new(Arc::new(MemoryStore::new(DAY)));
        state.api_key = Some("s3cret-token".into());
        let base = spawn_app(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/secrets"))
            .json(&create_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(format!("{base}/api/secrets"))
            .bearer_auth("wrong")
            .json(&create_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(format!("{base}/api/secrets"))
            .bearer_auth("s3cret-token")
            .json(&create_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let created: CreateResponse = resp.json().await.unwrap();

        let resp = client
            .get(format!("{base}/api/secrets/{}", created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    /// A backend whose consume primitive is unreachable.
    struct Unreachable;

    impl SecretStore for Unreachable {
        fn create(&self, _secret: NewSecret) -> Result<String, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn consume_if_pending(&self, _id: &str) -> Result<Option<SecretRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn sweep(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn pending_count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn storage_failure_fails_closed() {
        let base = spawn_app(AppState::new(Arc::new(Unreachable))).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/api/secrets/{}", crate::store::generate_id()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        let json: Value = resp.json().await.unwrap();
        assert!(json.get("encrypted_data").is_none());

        let resp = client
            .post(format!("{base}/api/secrets"))
            .json(&create_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[test]
    fn creates_configured_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let wanted = tmp.path().join("nested").join("data");
        let resolved = resolve_data_dir(Some(&wanted)).unwrap();
        assert_eq!(resolved, wanted);
        assert!(wanted.is_dir());
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        assert_eq!(nonzero("BURNLINK_SWEEP_INTERVAL_SECS", 0), None);
        assert_eq!(nonzero("BURNLINK_SWEEP_INTERVAL_SECS", 15), Some(15));
    }

    #[test]
    fn parses_store_backend() {
        assert_eq!("redb".parse::<StoreBackend>().unwrap(), StoreBackend::Redb);
        assert_eq!(" Memory ".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("postgres".parse::<StoreBackend>().is_err());
    }
}
