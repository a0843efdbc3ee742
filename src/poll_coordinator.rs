use crate::error::EcobullesError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Target spacing between polls when no better estimate exists.
pub const NOMINAL_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Something the coordinator can poll.
///
/// `fetch` produces a new value; `next_delay` decides how long to wait before
/// the following cycle. An error from either counts as a failed cycle.
pub trait PollSource: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn fetch(&self) -> impl Future<Output = Result<Self::Output, EcobullesError>> + Send;

    fn next_delay(&self, value: &Self::Output) -> Result<Duration, EcobullesError>;
}

/// Sent to subscribers after every completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Updated,
    UpdateFailed(String),
}

/// Caches the latest value of a [`PollSource`] and refreshes it on a timer
/// whose period is recomputed after each successful cycle.
pub struct PollCoordinator<S: PollSource> {
    name: String,
    source: S,
    fetch_timeout: Duration,
    // Whole values are swapped in; readers only clone the Arc.
    snapshot: watch::Sender<Option<Arc<S::Output>>>,
    interval_millis: AtomicU64,
    last_update_success: AtomicBool,
    events: broadcast::Sender<PollEvent>,
    // Held for the whole of a cycle, fetch through publish.
    cycle_lock: Mutex<()>,
}

impl<S: PollSource> PollCoordinator<S> {
    pub fn new(name: impl Into<String>, source: S, fetch_timeout: Duration) -> Self {
        let (snapshot, _) = watch::channel(None);
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            source,
            fetch_timeout,
            snapshot,
            interval_millis: AtomicU64::new(NOMINAL_PERIOD.as_millis() as u64),
            last_update_success: AtomicBool::new(false),
            events,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Latest successfully fetched value, if any.
    pub fn current_snapshot(&self) -> Option<Arc<S::Output>> {
        self.snapshot.borrow().clone()
    }

    /// Delay the timer will wait before the next cycle.
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis.load(Ordering::Relaxed))
    }

    /// Whether the most recent cycle succeeded.
    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    /// Runs one cycle right away and reports its outcome to the caller.
    ///
    /// If the timer loop is mid-cycle, this waits for that cycle to publish
    /// before fetching, so the newest fetch is always the one kept.
    pub async fn refresh_now(&self) -> Result<(), EcobullesError> {
        self.run_cycle().await
    }

    /// Starts the timer loop. The next sleep only begins once the previous
    /// cycle has finished, and loop cycles never overlap `refresh_now`.
    pub fn spawn(self: Arc<Self>) -> PollTask {
        let coordinator = self;
        let handle = tokio::spawn(async move {
            info!("Starting poll loop for {}", coordinator.name);
            loop {
                let delay = coordinator.current_interval();
                debug!("{}: next poll in {:?}", coordinator.name, delay);
                sleep(delay).await;
                // Failures are already reported to subscribers.
                let _ = coordinator.run_cycle().await;
            }
        });
        PollTask { handle }
    }

    async fn run_cycle(&self) -> Result<(), EcobullesError> {
        let _cycle = self.cycle_lock.lock().await;
        let outcome = match timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(EcobullesError::FetchTimeout(self.fetch_timeout)),
        }
        .and_then(|value| {
            let delay = self.source.next_delay(&value)?;
            Ok((value, delay))
        });

        match outcome {
            Ok((value, delay)) => {
                self.snapshot.send_replace(Some(Arc::new(value)));
                self.interval_millis
                    .store(delay.as_millis() as u64, Ordering::Relaxed);
                self.last_update_success.store(true, Ordering::Relaxed);
                info!("{} updated, next update in {:?}", self.name, delay);
                // No receivers is fine.
                let _ = self.events.send(PollEvent::Updated);
                Ok(())
            }
            Err(e) => {
                warn!("Error fetching {} data: {}", self.name, e);
                self.last_update_success.store(false, Ordering::Relaxed);
                let _ = self.events.send(PollEvent::UpdateFailed(e.to_string()));
                Err(e)
            }
        }
    }
}

/// Handle to a running poll loop. Dropping it stops the loop.
pub struct PollTask {
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Stops the loop, abandoning any fetch in flight without notifying
    /// subscribers.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
