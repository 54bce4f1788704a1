use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docshift_core::LibraryError;
use thiserror::Error;
use tracing::{error, warn};

use super::backoff::Backoff;

pub const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 10;
/// First wait when the service throttles without a `Retry-After`.
pub const THROTTLE_BASE_DELAY: Duration = Duration::from_secs(1);
pub const THROTTLE_MAX_DELAY: Duration = Duration::from_secs(30 * 60);

/// Errors that can carry a "slow down" signal from the service.
pub trait ThrottleAware {
    fn is_throttled(&self) -> bool;
    fn retry_after(&self) -> Option<Duration>;
}

impl ThrottleAware for LibraryError {
    fn is_throttled(&self) -> bool {
        LibraryError::is_throttled(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        LibraryError::retry_after(self)
    }
}

#[derive(Debug, Error)]
pub enum ThrottleError<E> {
    #[error("still throttled after {retries} retries, giving up: {last}")]
    Exhausted { retries: u32, last: E },
    #[error(transparent)]
    Failed(E),
}

impl<E> ThrottleError<E> {
    pub fn inner(&self) -> &E {
        match self {
            ThrottleError::Exhausted { last, .. } => last,
            ThrottleError::Failed(err) => err,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ThrottleError::Exhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleEvent {
    pub operation: String,
    pub retry: u32,
    pub delay: Duration,
}

pub type ThrottleObserver = Arc<dyn Fn(&ThrottleEvent) + Send + Sync>;

/// Re-issues a remote call while the service answers 429/503.
///
/// Waits for `Retry-After` when given, otherwise doubles from one second.
#[derive(Clone)]
pub struct Throttler {
    max_retries: u32,
    backoff: Backoff,
    observer: Option<ThrottleObserver>,
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_THROTTLE_RETRIES)
    }
}

impl Throttler {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::new(THROTTLE_BASE_DELAY, THROTTLE_MAX_DELAY, false),
            observer: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: ThrottleObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ThrottleError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ThrottleAware + Display,
    {
        let mut retries = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_throttled() => {
                    if retries >= self.max_retries {
                        error!(operation, retries, error = %err, "throttling retries exhausted");
                        return Err(ThrottleError::Exhausted { retries, last: err });
                    }
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.backoff.delay(retries));
                    retries += 1;
                    warn!(
                        operation,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "throttled by service; backing off"
                    );
                    if let Some(observer) = &self.observer {
                        observer(&ThrottleEvent {
                            operation: operation.to_string(),
                            retry: retries,
                            delay,
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(ThrottleError::Failed(err)),
            }
        }
    }
}
