//! Client-side wait for a session to leave PROCESSING.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionStatus;

/// Fixed-interval polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between attempts.
    pub interval: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_attempts: 30,
        }
    }
}

/// Why polling stopped without a READY session.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Ingestion failed server-side.
    #[error("{0}")]
    Failed(String),
    /// Attempts ran out while the session was still PROCESSING.
    #[error("Session timeout: embedding took too long")]
    Timeout,
    /// The status check itself failed.
    #[error(transparent)]
    Fetch(E),
}

/// A polled status and, for FAILED sessions, the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledStatus {
    /// Session status.
    pub status: SessionStatus,
    /// Failure reason.
    pub error_message: Option<String>,
}

/// Calls `fetch` until READY, FAILED, or `max_attempts` calls have been made.
///
/// Sleeps `interval` between attempts but not after the last one.
pub async fn poll_until_ready<F, Fut, E>(
    mut fetch: F,
    config: PollConfig,
) -> Result<PolledStatus, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PolledStatus, E>>,
{
    for attempt in 1..=config.max_attempts {
        let polled = fetch().await.map_err(PollError::Fetch)?;
        match polled.status {
            SessionStatus::Ready => return Ok(polled),
            SessionStatus::Failed => {
                return Err(PollError::Failed(
                    polled
                        .error_message
                        .unwrap_or_else(|| "Embedding failed".to_string()),
                ))
            }
            SessionStatus::Processing => {
                tracing::debug!(attempt, max_attempts = config.max_attempts, "session still processing");
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.interval).await;
                }
            }
        }
    }
    Err(PollError::Timeout)
}
