//! End-to-end: the real router on an ephemeral port, driven through the client.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burnlink::envelope::generate_key;
use burnlink::guard::{WindowMetrics, WindowProbe};
use burnlink::{
    Client, ClientError, CryptoError, DestroyReason, Payload, SessionState, ShareLink, ViewError,
    ViewPolicy, ViewingSession,
};
use burnlink_server::store::{MemoryStore, NewSecret, SecretRecord, SecretStore, StoreError};
use burnlink_server::AppState;
use tokio::net::TcpListener;

const DAY: Duration = Duration::from_secs(86_400);

async fn spawn_server(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = burnlink_server::router(state, None);
    tokio::spawn(burnlink_server::serve(
        listener,
        app,
        std::future::pending::<()>(),
    ));
    format!("http://{addr}")
}

async fn spawn_with(store: Arc<dyn SecretStore>) -> (Client, Arc<dyn SecretStore>) {
    let base = spawn_server(AppState::new(store.clone())).await;
    (Client::new(base), store)
}

fn text(s: &str) -> Payload {
    Payload::Text(s.to_owned())
}

#[tokio::test]
async fn share_open_once() {
    let (client, store) = spawn_with(Arc::new(MemoryStore::new(DAY))).await;

    let link = client.submit(&text("correct horse battery staple"), 30).await.unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);

    let session = ViewingSession::new(link.clone(), ViewPolicy::default());
    session.open(&client, None).await.unwrap();
    assert_eq!(session.state(), SessionState::Viewing);
    assert_eq!(
        session
            .with_content(|o| o.as_text().map(str::to_owned))
            .flatten()
            .as_deref(),
        Some("correct horse battery staple")
    );
    assert_eq!(store.pending_count().unwrap(), 0);

    // A second recipient with the same link gets nothing.
    let again = ViewingSession::new(link, ViewPolicy::default());
    let err = again.open(&client, None).await.unwrap_err();
    assert!(matches!(err, ViewError::Client(ClientError::NotFound)));
    assert_eq!(again.state(), SessionState::Destroyed);
    assert_eq!(*again.destroyed().borrow(), Some(DestroyReason::Failed));
}

#[tokio::test]
async fn file_secret_keeps_metadata() {
    let (client, _) = spawn_with(Arc::new(MemoryStore::new(DAY))).await;
    let bytes: Vec<u8> = (0..=255u8).cycle().take(4_096).collect();
    let payload = Payload::File {
        filename: "backup.tar".into(),
        content_type: "application/x-tar".into(),
        bytes: bytes.clone(),
    };

    let link = client.submit(&payload, 120).await.unwrap();
    let opened = client.retrieve(&link).await.unwrap();
    assert_eq!(opened.plaintext.as_slice(), bytes.as_slice());
    assert_eq!(opened.filename.as_deref(), Some("backup.tar"));
    assert_eq!(opened.content_type.as_deref(), Some("application/x-tar"));
    assert_eq!(opened.file_size, Some(4_096));
    assert_eq!(opened.expires_in, 120);
    assert!(opened.as_text().is_none());
}

#[tokio::test]
async fn unopened_secret_expires_after_retention() {
    let now = Arc::new(AtomicI64::new(1_700_000_000));
    let clock = {
        let now = now.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    };
    let retention = Duration::from_secs(3_600);
    let store: Arc<dyn SecretStore> = Arc::new(MemoryStore::with_clock(retention, clock));
    let (client, store) = spawn_with(store).await;

    let link = client.submit(&text("stale"), 30).await.unwrap();
    let swept = client.submit(&text("also stale"), 30).await.unwrap();
    now.fetch_add(3_601, Ordering::SeqCst);

    assert!(matches!(client.retrieve(&link).await, Err(ClientError::NotFound)));
    assert_eq!(store.sweep().unwrap(), 1);
    assert!(matches!(client.retrieve(&swept).await, Err(ClientError::NotFound)));
    assert_eq!(store.pending_count().unwrap(), 0);
}

/// Flips one ciphertext bit on the way out, as a hostile store would.
struct Tampering(MemoryStore);

impl SecretStore for Tampering {
    fn create(&self, secret: NewSecret) -> Result<String, StoreError> {
        self.0.create(secret)
    }

    fn consume_if_pending(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.0.consume_if_pending(id)?.map(|mut record| {
            record.ciphertext[0] ^= 0x01;
            record
        }))
    }

    fn sweep(&self) -> Result<usize, StoreError> {
        self.0.sweep()
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        self.0.pending_count()
    }
}

#[tokio::test]
async fn tampered_ciphertext_fails_authentication() {
    let (client, store) = spawn_with(Arc::new(Tampering(MemoryStore::new(DAY)))).await;
    let link = client.submit(&text("wire transfer: 100"), 30).await.unwrap();

    let session = ViewingSession::new(link.clone(), ViewPolicy::default());
    let err = session.open(&client, None).await.unwrap_err();
    assert!(matches!(
        err,
        ViewError::Client(ClientError::Crypto(CryptoError::Authentication))
    ));
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(session.with_content(|_| ()).is_none());

    // The record was still consumed.
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(matches!(client.retrieve(&link).await, Err(ClientError::NotFound)));
}

#[tokio::test]
async fn wrong_key_is_distinct_from_not_found() {
    let (client, _) = spawn_with(Arc::new(MemoryStore::new(DAY))).await;
    let link = client.submit(&text("pin 0000"), 30).await.unwrap();
    let forged = ShareLink::new(link.origin(), link.id(), generate_key()).unwrap();

    assert!(matches!(
        client.retrieve(&forged).await,
        Err(ClientError::Crypto(CryptoError::Authentication))
    ));
    assert!(matches!(client.retrieve(&link).await, Err(ClientError::NotFound)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_single_winner() {
    let (client, _) = spawn_with(Arc::new(MemoryStore::new(DAY))).await;
    let link = client.submit(&text("race me"), 30).await.unwrap();

    let (a, b) = tokio::join!(client.retrieve(&link), client.retrieve(&link));
    let outcomes = [a, b];
    let delivered = outcomes.iter().filter(|r| r.is_ok()).count();
    let missing = outcomes
        .iter()
        .filter(|r| matches!(r, Err(ClientError::NotFound)))
        .count();
    assert_eq!(delivered, 1);
    assert_eq!(missing, 1);
}

struct DockedTools;

impl WindowProbe for DockedTools {
    fn metrics(&self) -> WindowMetrics {
        WindowMetrics {
            outer_width: 1_600,
            outer_height: 1_000,
            inner_width: 1_000,
            inner_height: 960,
        }
    }
}

#[tokio::test]
async fn refused_open_leaves_secret_pending() {
    let (client, store) = spawn_with(Arc::new(MemoryStore::new(DAY))).await;
    let link = client.submit(&text("not yet"), 30).await.unwrap();

    let session = ViewingSession::new(link, ViewPolicy::default());
    let err = session.open(&client, Some(&DockedTools)).await.unwrap_err();
    assert!(matches!(err, ViewError::InspectionDetected));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(store.pending_count().unwrap(), 1);

    session.open(&client, None).await.unwrap();
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(session.destroy(DestroyReason::Closed));
    assert_eq!(session.closed().await, DestroyReason::Closed);
}

#[tokio::test]
async fn api_key_protects_creation() {
    let mut state = AppState::new(Arc::new(MemoryStore::new(DAY)));
    state.api_key = Some("letmein".into());
    let base = spawn_server(state).await;

    let anonymous = Client::new(base.clone());
    assert!(matches!(
        anonymous.submit(&text("x"), 30).await,
        Err(ClientError::Rejected { status: 401, .. })
    ));

    let authed = Client::new(base).with_token(Some("letmein".into()));
    let link = authed.submit(&text("x"), 30).await.unwrap();
    // Retrieval needs only the link.
    assert!(anonymous.retrieve(&link).await.is_ok());
}
