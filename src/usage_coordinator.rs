use crate::ecobulles::{EcobullesClient, UsageSnapshot, UsageWindow};
use crate::error::EcobullesError;
use crate::poll_coordinator::{PollCoordinator, PollSource, NOMINAL_PERIOD};
use chrono::{Local, NaiveDateTime, TimeDelta};
use std::time::Duration;
use tracing::debug;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest wait between two polls, whatever the server timestamp says.
pub const MIN_POLL_DELAY: Duration = Duration::from_secs(60);

/// Extra wait on top of the nominal period so the next reading exists.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

pub type UsageCoordinator = PollCoordinator<UsageSource>;

/// Polls the water and CO2 totals of one device.
pub struct UsageSource {
    client: EcobullesClient,
    device_ref: String,
}

impl UsageSource {
    pub fn new(client: EcobullesClient, device_ref: impl Into<String>) -> Self {
        Self {
            client,
            device_ref: device_ref.into(),
        }
    }

    pub fn device_ref(&self) -> &str {
        &self.device_ref
    }
}

impl PollSource for UsageSource {
    type Output = UsageSnapshot;

    async fn fetch(&self) -> Result<UsageSnapshot, EcobullesError> {
        let window = UsageWindow::current_hour(Local::now().naive_local());
        self.client.fetch_usage(&self.device_ref, &window).await
    }

    fn next_delay(&self, snapshot: &UsageSnapshot) -> Result<Duration, EcobullesError> {
        let last_updated = parse_last_updated(snapshot.last_updated.as_deref())?;
        debug!("Last updated of water and co2 usage: {last_updated}");
        Ok(next_poll_delay(Local::now().naive_local(), last_updated))
    }
}

pub fn usage_coordinator(client: EcobullesClient, device_ref: &str) -> UsageCoordinator {
    PollCoordinator::new(
        format!("water and co2 usage ({device_ref})"),
        UsageSource::new(client, device_ref),
        FETCH_TIMEOUT,
    )
}

/// Parses the normalised server timestamp, a local wall-clock time.
pub fn parse_last_updated(last_updated: Option<&str>) -> Result<NaiveDateTime, EcobullesError> {
    let text = last_updated.ok_or_else(|| EcobullesError::missing("last_updated"))?;
    text.parse().map_err(|e| {
        EcobullesError::MalformedResponse(format!("invalid last_updated {text:?}: {e}"))
    })
}

/// Wait until one nominal period after the server's last update, plus a margin
/// so the next reading is already there.
///
/// Clamped to `[MIN_POLL_DELAY, nominal period + margin]` so a stale or future
/// timestamp can neither spin the loop nor stall it.
pub fn next_poll_delay(now: NaiveDateTime, last_updated: NaiveDateTime) -> Duration {
    let period = TimeDelta::seconds(NOMINAL_PERIOD.as_secs() as i64);
    let margin = TimeDelta::seconds(SAFETY_MARGIN.as_secs() as i64);
    let min = TimeDelta::seconds(MIN_POLL_DELAY.as_secs() as i64);
    let delay = (period - (now - last_updated) + margin).clamp(min, period + margin);
    delay.to_std().unwrap_or(MIN_POLL_DELAY)
}
