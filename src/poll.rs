//! Bounded polling primitive.
//!
//! Every wait in the orchestrator — boot-settle verification, graceful
//! shutdown, network checks — goes through [`poll_until`] so timeout
//! semantics are identical everywhere: probe immediately, then at a fixed
//! interval, giving up once the total budget elapses. There is no
//! indefinite blocking anywhere in the crate.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// The probe never produced a value within the time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not met within {:?}", .timeout)]
pub struct PollTimedOut {
    pub timeout: Duration,
}

/// Poll `probe` every `interval` until it returns `Some`, or until `timeout`
/// has elapsed since the first probe.
///
/// The probe runs once immediately, so a condition that already holds costs
/// no sleep at all. The deadline is checked after each probe; a probe
/// started before the deadline is always allowed to finish.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<T, PollTimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }

        if Instant::now() + interval > deadline {
            return Err(PollTimedOut { timeout });
        }

        tokio::time::sleep(interval).await;
    }
}
