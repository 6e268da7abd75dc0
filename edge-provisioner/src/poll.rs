// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling for conditions in external systems.
//!
//! None of the systems we provision push notifications, so every wait in the
//! provisioner is a loop of "check, sleep". Each loop is bounded either by a
//! number of attempts or by total elapsed time; nothing waits forever.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of a condition
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// How long to keep checking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollLimit {
    /// Check at most this many times.
    Attempts(u32),
    /// Keep checking until this much time has passed.
    Elapsed(Duration),
}

impl std::fmt::Display for PollLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollLimit::Attempts(n) => write!(f, "{n} attempts"),
            PollLimit::Elapsed(d) => write!(f, "{d:?}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("gave up after {attempts} attempts ({elapsed:?}, limit {limit})")]
    TimedOut { attempts: u32, elapsed: Duration, limit: PollLimit },
    #[error("permanent error")]
    PermanentError(#[source] E),
}

/// Poll `cond` every `interval` until it produces a value, fails
/// permanently, or `limit` is reached.
///
/// With [PollLimit::Attempts], `cond` is invoked exactly that many times
/// before giving up, with no sleep after the final attempt.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    interval: Duration,
    limit: PollLimit,
) -> Result<O, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(err)) => {
                return Err(PollError::PermanentError(err))
            }
            Err(CondCheckError::NotYet) => (),
        }

        let elapsed = Instant::now().duration_since(start);
        let exhausted = match limit {
            PollLimit::Attempts(max) => attempts >= max,
            PollLimit::Elapsed(budget) => elapsed >= budget,
        };
        if exhausted {
            return Err(PollError::TimedOut { attempts, elapsed, limit });
        }

        tokio::time::sleep(interval).await;
    }
}
