/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
    /// Upper bound for a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Short, tight policy for database writes on the request path.
    pub fn store() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(250),
            attempt_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    /// Background policy for push notification delivery.
    pub fn notification() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure: {0}")]
    Permanent(E),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> RetryError<E> {
    /// The underlying operation error, if the last attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Permanent(last) => Some(last),
            RetryError::TimedOut(_) => None,
        }
    }
}

/// Retry every failure until the budget is spent.
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, |_| true, f).await
}

/// Retry only failures for which `should_retry` returns true.
///
/// A failure that is not retryable is returned immediately as
/// [`RetryError::Permanent`]. A timed-out attempt counts against the budget
/// like any other transient failure.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: RetryConfig,
    should_retry: P,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        let outcome = match config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(Some),
                Err(_) => Err(None),
            },
            None => f().await.map_err(Some),
        };

        let failure = match outcome {
            Ok(result) => return Ok(result),
            Err(Some(e)) if !should_retry(&e) => return Err(RetryError::Permanent(e)),
            Err(failure) => failure,
        };

        attempt += 1;
        if attempt > config.max_retries {
            warn!("Max retries ({}) reached", config.max_retries);
            return Err(match failure {
                Some(last) => RetryError::Exhausted {
                    attempts: attempt,
                    last,
                },
                None => RetryError::TimedOut(config.attempt_timeout.unwrap_or_default()),
            });
        }

        let delay = calculate_backoff(backoff, config.jitter);
        match &failure {
            Some(e) => warn!(
                "Retry attempt {}/{} after error: {}, waiting {:?}",
                attempt, config.max_retries, e, delay
            ),
            None => warn!(
                "Retry attempt {}/{} after timeout, waiting {:?}",
                attempt, config.max_retries, delay
            ),
        }

        tokio::time::sleep(delay).await;

        backoff = Duration::from_millis(
            ((backoff.as_millis() as f64 * config.backoff_multiplier)
                .min(config.max_backoff.as_millis() as f64)) as u64,
        );
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
