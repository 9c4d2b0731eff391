//! The recipient-side viewing session.
//!
//! A session is opened at most once. From `Viewing` it reaches `Destroyed`
//! through whichever trigger fires first: the countdown, a grace timer, an
//! exfiltration attempt, suspected inspection, or an explicit close. Every
//! trigger funnels into [`ViewingSession::destroy`], which performs the
//! transition exactly once.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::client::{Client, ClientError, Opened};
use crate::guard::{self, UiEvent, Verdict, WindowProbe, INSPECTION_THRESHOLD_PX};
use crate::link::ShareLink;

const IDLE: u8 = 0;
const DECRYPTING: u8 = 1;
const VIEWING: u8 = 2;
const DESTROYED: u8 = 3;

/// Tunable timings for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewPolicy {
    /// How long the view may stay hidden before the secret is destroyed.
    pub visibility_grace: Duration,
    /// How long the view may stay unfocused before the secret is destroyed.
    pub focus_grace: Duration,
    pub poll_interval: Duration,
    pub inspection_threshold: u32,
}

impl Default for ViewPolicy {
    fn default() -> Self {
        Self {
            visibility_grace: Duration::from_secs(2),
            focus_grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            inspection_threshold: INSPECTION_THRESHOLD_PX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Decrypting,
    Viewing,
    Destroyed,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            IDLE => Self::Idle,
            DECRYPTING => Self::Decrypting,
            VIEWING => Self::Viewing,
            _ => Self::Destroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Countdown,
    VisibilityLost,
    FocusLost,
    ExfiltrationAttempt,
    InspectionDetected,
    Closed,
    Failed,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Countdown => "viewing time ran out",
            Self::VisibilityLost => "the view was hidden",
            Self::FocusLost => "the view lost focus",
            Self::ExfiltrationAttempt => "a screen capture was attempted",
            Self::InspectionDetected => "inspection tooling was detected",
            Self::Closed => "the view was closed",
            Self::Failed => "the secret could not be opened",
        })
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("close developer tools before opening this secret")]
    InspectionDetected,
    #[error("this secret has already been opened in this session")]
    AlreadyOpened,
    #[error("this secret has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct ViewingSession {
    inner: Arc<Inner>,
}

struct Inner {
    link: ShareLink,
    policy: ViewPolicy,
    state: AtomicU8,
    content: Mutex<Option<Opened>>,
    deadline: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<AbortHandle>>,
    visibility_timer: Mutex<Option<AbortHandle>>,
    focus_timer: Mutex<Option<AbortHandle>>,
    destroyed: watch::Sender<Option<DestroyReason>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ViewingSession {
    /// A session for `link`, in `Idle`. Nothing is fetched and no task runs yet.
    pub fn new(link: ShareLink, policy: ViewPolicy) -> Self {
        let (destroyed, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                link,
                policy,
                state: AtomicU8::new(IDLE),
                content: Mutex::new(None),
                deadline: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                visibility_timer: Mutex::new(None),
                focus_timer: Mutex::new(None),
                destroyed,
            }),
        }
    }

    pub fn link(&self) -> &ShareLink {
        &self.inner.link
    }

    pub fn policy(&self) -> &ViewPolicy {
        &self.inner.policy
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Open the secret: consume it on the server, decrypt it, and start the
    /// countdown. Refused without consuming anything while `probe` suggests
    /// inspection tooling. On any retrieval or decryption failure the session
    /// ends as `Destroyed(Failed)`.
    pub async fn open(
        &self,
        client: &Client,
        probe: Option<&dyn WindowProbe>,
    ) -> Result<(), ViewError> {
        self.begin(probe)?;
        match client.retrieve(&self.inner.link).await {
            Ok(opened) => self.reveal(opened),
            Err(e) => {
                debug!(error = %e, "open failed");
                self.destroy(DestroyReason::Failed);
                Err(e.into())
            }
        }
    }

    /// `Idle -> Decrypting`. Exposed for UI layers that drive retrieval themselves.
    pub fn begin(&self, probe: Option<&dyn WindowProbe>) -> Result<(), ViewError> {
        self.ensure_idle()?;
        if let Some(probe) = probe {
            if guard::inspection_suspected(probe.metrics(), self.inner.policy.inspection_threshold) {
                info!("refusing to open while inspection tooling is suspected");
                return Err(ViewError::InspectionDetected);
            }
        }
        self.inner
            .state
            .compare_exchange(IDLE, DECRYPTING, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(state_error)
    }

    /// `Decrypting -> Viewing`: hold the plaintext and start the countdown.
    pub fn reveal(&self, opened: Opened) -> Result<(), ViewError> {
        let window = Duration::from_secs(u64::from(opened.expires_in));
        {
            let mut content = lock(&self.inner.content);
            // Checked under the content lock so a concurrent destroy cannot
            // wipe the slot before the plaintext lands in it.
            self.inner
                .state
                .compare_exchange(DECRYPTING, VIEWING, Ordering::SeqCst, Ordering::SeqCst)
                .map_err(state_error)?;
            *content = Some(opened);
        }

        let deadline = Instant::now() + window;
        *lock(&self.inner.deadline) = Some(deadline);
        info!(secs = window.as_secs(), "secret revealed");

        let weak = Arc::downgrade(&self.inner);
        self.spawn_tracked(async move {
            time::sleep_until(deadline).await;
            fire(&weak, DestroyReason::Countdown);
        });
        Ok(())
    }

    /// Terminal transition. Only the first caller wins and gets `true`; it
    /// wipes the plaintext, cancels every timer and publishes `reason`.
    pub fn destroy(&self, reason: DestroyReason) -> bool {
        destroy_inner(&self.inner, reason)
    }

    /// Run `f` against the plaintext while the session is `Viewing`.
    pub fn with_content<R>(&self, f: impl FnOnce(&Opened) -> R) -> Option<R> {
        let content = lock(&self.inner.content);
        if self.state() != SessionState::Viewing {
            return None;
        }
        content.as_ref().map(f)
    }

    /// Time left on the countdown.
    pub fn remaining(&self) -> Option<Duration> {
        if self.state() != SessionState::Viewing {
            return None;
        }
        let deadline = *lock(&self.inner.deadline);
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The view was hidden (`true`) or shown again (`false`).
    pub fn visibility_changed(&self, hidden: bool) {
        self.arm_grace(
            &self.inner.visibility_timer,
            hidden,
            self.inner.policy.visibility_grace,
            DestroyReason::VisibilityLost,
        );
    }

    /// The view lost (`false`) or regained (`true`) input focus.
    pub fn focus_changed(&self, focused: bool) {
        self.arm_grace(
            &self.inner.focus_timer,
            !focused,
            self.inner.policy.focus_grace,
            DestroyReason::FocusLost,
        );
    }

    /// Apply the exfiltration guard to `event`. The caller suppresses the
    /// event on anything but [`Verdict::Allow`].
    pub fn handle_event(&self, event: &UiEvent) -> Verdict {
        let verdict = guard::evaluate(event);
        if verdict == Verdict::Destroy && self.state() == SessionState::Viewing {
            info!("screen capture attempt while viewing");
            self.destroy(DestroyReason::ExfiltrationAttempt);
        }
        verdict
    }

    /// Poll `probe` while viewing; suspected inspection destroys the secret.
    /// Returns `false` if the session is not `Viewing`.
    pub fn spawn_inspection_poll(&self, probe: Arc<dyn WindowProbe>) -> bool {
        if self.state() != SessionState::Viewing {
            return false;
        }
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.policy.poll_interval;
        let threshold = self.inner.policy.inspection_threshold;
        self.spawn_tracked(async move {
            let mut ticker = time::interval(every);
            loop {
                ticker.tick().await;
                if guard::inspection_suspected(probe.metrics(), threshold) {
                    info!("inspection tooling detected while viewing");
                    fire(&weak, DestroyReason::InspectionDetected);
                    break;
                }
            }
        });
        true
    }

    /// Subscribe to the terminal transition. The value becomes `Some(reason)` once.
    pub fn destroyed(&self) -> watch::Receiver<Option<DestroyReason>> {
        self.inner.destroyed.subscribe()
    }

    /// Wait until the session is destroyed.
    pub async fn closed(&self) -> DestroyReason {
        let mut rx = self.destroyed();
        rx.wait_for(Option::is_some)
            .await
            .map(|reason| *reason)
            .ok()
            .flatten()
            .unwrap_or(DestroyReason::Closed)
    }

    fn ensure_idle(&self) -> Result<(), ViewError> {
        match self.inner.state.load(Ordering::SeqCst) {
            IDLE => Ok(()),
            other => Err(state_error(other)),
        }
    }

    fn arm_grace(
        &self,
        slot: &Mutex<Option<AbortHandle>>,
        lost: bool,
        grace: Duration,
        reason: DestroyReason,
    ) {
        if !lost {
            if let Some(timer) = lock(slot).take() {
                debug!(?reason, "returned within grace period");
                timer.abort();
            }
            return;
        }
        if self.state() != SessionState::Viewing {
            return;
        }

        let mut slot_guard = lock(slot);
        if slot_guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            time::sleep(grace).await;
            fire(&weak, reason);
        })
        .abort_handle();
        *slot_guard = Some(handle);
        drop(slot_guard);

        // destroy may have drained the slots before this timer was stored.
        if self.state() == SessionState::Destroyed {
            if let Some(timer) = lock(slot).take() {
                timer.abort();
            }
        }
    }

    fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut).abort_handle();
        lock(&self.inner.tasks).push(handle.clone());
        if self.state() == SessionState::Destroyed {
            handle.abort();
        }
    }
}

fn state_error(raw: u8) -> ViewError {
    if raw == DESTROYED {
        ViewError::Destroyed
    } else {
        ViewError::AlreadyOpened
    }
}

fn fire(weak: &Weak<Inner>, reason: DestroyReason) {
    if let Some(inner) = weak.upgrade() {
        destroy_inner(&inner, reason);
    }
}

fn destroy_inner(inner: &Inner, reason: DestroyReason) -> bool {
    if inner.state.swap(DESTROYED, Ordering::SeqCst) == DESTROYED {
        return false;
    }

    // Dropping the content zeroizes the plaintext.
    lock(&inner.content).take();
    lock(&inner.deadline).take();
    for task in lock(&inner.tasks).drain(..) {
        task.abort();
    }
    for slot in [&inner.visibility_timer, &inner.focus_timer] {
        if let Some(timer) = lock(slot).take() {
            timer.abort();
        }
    }

    inner.destroyed.send_replace(Some(reason));
    info!(%reason, "secret destroyed");
    true
}
