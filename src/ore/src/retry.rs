// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! A [`Retry`] describes a bounded series of attempts separated by sleeps. The
//! sleeps start at [`Retry::initial_backoff`] and grow by [`Retry::factor`]
//! until they reach [`Retry::clamp_backoff`]. A factor of `1.0` yields the
//! fixed-delay retries used throughout the bootstrap path. Every retry is
//! bounded by [`Retry::max_tries`], [`Retry::max_duration`], or both; callers
//! that want an unbounded retry must say so explicitly.
//!
//! ```ignore
//! let members = Retry::default()
//!     .initial_backoff(Duration::from_secs(1))
//!     .max_tries(3)
//!     .retry_async(|state| async move {
//!         debug!(attempt = state.i, "listing members");
//!         client.member_list().await
//!     })
//!     .await?;
//! ```

use std::cmp;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// The number of retries required before upgrading a log level from `debug`
/// to `info`.
pub const INFO_MIN_RETRIES: usize = 5;

/// Configures a retry operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
    max_duration: Duration,
    jitter: bool,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// starting at 125ms and doubling up to one minute.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::from_secs(60),
            max_tries: usize::MAX,
            max_duration: Duration::MAX,
            jitter: false,
        }
    }
}

impl Retry {
    /// A retry that sleeps `delay` between each of at most `max_tries`
    /// attempts.
    pub fn fixed(delay: Duration, max_tries: usize) -> Self {
        Retry::default()
            .initial_backoff(delay)
            .factor(1.0)
            .clamp_backoff(delay)
            .max_tries(max_tries)
    }

    /// Sets the initial backoff for the retry operation.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the backoff multiplier. Values below `1.0` are treated as `1.0`.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_nan() || factor < 1.0 {
            1.0
        } else {
            factor
        };
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of tries, including the first.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Sets the maximum duration. Once the duration has elapsed no further
    /// attempts are made, and the final sleep is shortened so that it ends
    /// when the duration does.
    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Applies a random jitter of ±10% to each sleep.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Convert into a [`RetryStream`].
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream {
            backoff: self.initial_backoff,
            cfg: self,
            start: Instant::now(),
            attempt: 0,
        }
    }

    /// Retries the asynchronous, fallible operation `f` according to the
    /// configured policy.
    ///
    /// The operation is invoked with a [`RetryState`] describing the attempt.
    /// The result of the last attempt is returned if the policy is exhausted.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut stream = self.into_retry_stream();
        loop {
            let state = stream.state();
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) if state.next_backoff.is_none() => return Err(e),
                Err(_) => stream = stream.sleep().await,
            }
        }
    }
}

/// The state of a retry operation as seen by a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// The zero-based index of the attempt.
    pub i: usize,
    /// The sleep that will precede the next attempt, or `None` if this is the
    /// last attempt the policy allows.
    pub next_backoff: Option<Duration>,
}

/// A series of clamped, optionally jittered, sleeps.
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    start: Instant,
    attempt: usize,
    backoff: Duration,
}

impl RetryStream {
    /// How many times [`Self::sleep`] has been called.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The state of the current attempt.
    pub fn state(&self) -> RetryState {
        let elapsed = self.start.elapsed();
        let next_backoff = if self.attempt + 1 >= self.cfg.max_tries
            || elapsed >= self.cfg.max_duration
        {
            None
        } else {
            Some(cmp::min(self.backoff, self.cfg.max_duration - elapsed))
        };
        RetryState {
            i: self.attempt,
            next_backoff,
        }
    }

    /// Reports whether the policy allows another attempt after this one.
    pub fn exhausted(&self) -> bool {
        self.state().next_backoff.is_none()
    }

    /// Executes the next sleep in the series.
    ///
    /// This isn't cancel-safe, so it consumes and returns self, to prevent
    /// accidental mis-use.
    pub async fn sleep(self) -> Self {
        let sleep = self.state().next_backoff.unwrap_or(Duration::ZERO);
        let sleep = if self.cfg.jitter {
            let jitter = rand::thread_rng().gen_range(0.9..=1.1);
            sleep.mul_f64(jitter)
        } else {
            sleep
        };
        tokio::time::sleep(sleep).await;
        self.advance()
    }

    fn advance(mut self) -> Self {
        self.attempt += 1;
        let next = Duration::try_from_secs_f64(self.backoff.as_secs_f64() * self.cfg.factor)
            .unwrap_or(Duration::MAX);
        self.backoff = cmp::min(next, self.cfg.clamp_backoff);
        self
    }
}
