//! Delay policies: the capped exponential backoff a stream channel applies
//! between empty reads, and the cancellable retry loop used for session
//! connects.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Doubles from `min` up to `max` on every consecutive empty read; [`reset`]
/// after a non-empty batch.
///
/// [`reset`]: StreamBackoff::reset
#[derive(Debug, Clone)]
pub(crate) struct StreamBackoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl StreamBackoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => next_backoff(current, self.max),
        };
        self.current = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub max_delay: Duration,
    pub jitter: bool,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    /// Randomized delay in `[0, max_delay]` between attempts, retried forever.
    pub(crate) fn jittered(max_delay: Duration) -> Self {
        Self {
            max_delay,
            jitter: true,
            cancellation: None,
        }
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn delay(&self) -> Duration {
        if !self.jitter || self.max_delay.is_zero() {
            return self.max_delay;
        }
        let max_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify_error` aborts, or the
/// cancellation token fires.
pub(crate) async fn retry_with_backoff<'a, T, E, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    E: Into<anyhow::Error>,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(usize, Duration, &E),
    C: FnMut(usize, &E) -> RetryDisposition,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        if let Some(token) = config.cancellation {
            if token.is_cancelled() {
                return Err(anyhow!("retry cancelled"));
            }
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(err.into()),
                RetryDisposition::Retry => {
                    let delay = config.delay();
                    on_retry(attempt, delay, &err);
                    sleep_with_cancellation(delay, config.cancellation).await?;
                }
            },
        }
    }
}

pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("sleep cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
