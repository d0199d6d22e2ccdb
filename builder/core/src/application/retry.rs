// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded retry helpers for cluster mutations and readiness polling.
//!
//! - [`retry_on_conflict`] reruns a whole read-modify-write cycle when the
//!   store rejects a stale `resource_version`; every other error escapes on
//!   the first attempt.
//! - [`poll_until`] drives a fixed-interval, jittered poll with a step budget
//!   and a cancellation token.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::cluster::ClusterError;

/// Attempt budget for optimistic-concurrency retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(10),
        }
    }
}

/// Run `cycle` until it succeeds, fails with a non-conflict error, or the
/// attempt budget runs out. `cycle` must re-read the object each time.
pub async fn retry_on_conflict<T, F, Fut>(policy: ConflictRetry, mut cycle: F) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match cycle().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "Conflict on update, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            other => return other,
        }
    }
}

/// Fixed-interval poll schedule with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: usize,
    pub interval: Duration,
    /// Each sleep is `interval * (1 + rand[0, jitter))`
    pub jitter: f64,
}

impl Backoff {
    /// Builder readiness: 15 steps, 5 s apart, 30% jitter.
    pub fn readiness() -> Self {
        Self {
            steps: 15,
            interval: Duration::from_secs(5),
            jitter: 0.3,
        }
    }

    fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let extra = rand::rng().random_range(0.0..self.jitter);
        self.interval.mul_f64(1.0 + extra)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError<E> {
    #[error("poll budget exhausted after {0} attempts")]
    Exhausted(usize),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(E),
}

/// Call `check` until it yields `Some`, sleeping per `backoff` between calls.
/// An `Err` from `check` ends the poll immediately.
pub async fn poll_until<T, E, F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for step in 0..backoff.steps {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if let Some(value) = check().await.map_err(PollError::Failed)? {
            return Ok(value);
        }
        if step + 1 == backoff.steps {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }
    Err(PollError::Exhausted(backoff.steps))
}
