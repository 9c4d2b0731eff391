use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use super::SecretStore;

/// Owner of the background retention sweep. Dropping it without calling
/// [`SweepHandle::shutdown`] leaves the task running until the runtime stops.
pub struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweep to stop and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "retention sweep task ended abnormally");
        }
    }
}

/// Shortest period the sweep will run at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background Tokio task that calls `sweep()` every `interval`
/// (never more often than [`MIN_SWEEP_INTERVAL`]).
pub fn spawn_sweep(store: Arc<dyn SecretStore>, interval: Duration) -> SweepHandle {
    if interval < MIN_SWEEP_INTERVAL {
        warn!(
            requested_ms = interval.as_millis() as u64,
            "sweep interval too short, using {}s",
            MIN_SWEEP_INTERVAL.as_secs()
        );
    }
    let interval = interval.max(MIN_SWEEP_INTERVAL);
    let (stop, mut stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = &mut stopped => {
                    debug!("retention sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.sweep() {
                        warn!(error = %e, "retention sweep error");
                    }
                }
            }
        }
    });
    SweepHandle {
        stop: Some(stop),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{text_secret, ManualClock};
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_until_shutdown() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::with_clock(
            Duration::from_secs(3_600),
            clock.clock(),
        ));
        let handle = spawn_sweep(store.clone(), Duration::from_secs(60));

        store.create(text_secret(b"abandoned")).unwrap();
        clock.advance(3_600);

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.pending_count().unwrap(), 0);

        handle.shutdown().await;

        // Nothing sweeps once stopped.
        store.create(text_secret(b"after")).unwrap();
        clock.advance(3_600);
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_sweeps() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::with_clock(
            Duration::from_secs(3_600),
            clock.clock(),
        ));
        let handle = spawn_sweep(store.clone(), Duration::ZERO);

        store.create(text_secret(b"abandoned")).unwrap();
        clock.advance(3_600);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.pending_count().unwrap(), 0);

        handle.shutdown().await;
    }
}
