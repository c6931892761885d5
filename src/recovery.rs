//! Bounded retry with a remediation action between attempts.
//!
//! Every retry loop in the crate goes through [`RecoveryPolicy::run`]: the
//! recovery-wrapped connectivity stages, transport retries of ordinary
//! stages, and connection establishment. Each caller supplies a
//! [`Recoverable`] describing what one attempt is, what remediation runs
//! between attempts, and which failures are final.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::context::OrchestratorContext;

/// Result of one attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attempt<T> {
    /// The attempt succeeded.
    Succeeded(T),
    /// The attempt failed; another attempt may fix it.
    Retry(String),
    /// The attempt failed in a way retrying cannot fix.
    GiveUp(String),
}

/// Work that can be attempted repeatedly with remediation in between.
pub trait Recoverable {
    /// Value produced by a successful attempt.
    type Output;
    /// Error that aborts the loop outright.
    type Error;

    /// Performs attempt number `attempt` (starting at 1).
    fn attempt(
        &mut self,
        ctx: &OrchestratorContext,
        attempt: u32,
    ) -> impl Future<Output = Result<Attempt<Self::Output>, Self::Error>>;

    /// Runs the remediation after failed attempt number `attempt`.
    fn remediate(
        &mut self,
        ctx: &OrchestratorContext,
        attempt: u32,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Raised for an attempt bound of zero.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("recovery attempts must be at least 1")]
pub struct ZeroAttempts;

/// Why a recovery loop ended without success.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecoveryError<E> {
    /// Every attempt failed.
    #[error("{label} failed after {attempts} attempts: {last_failure}")]
    Exhausted {
        /// What was being attempted.
        label: String,
        /// Attempts made.
        attempts: u32,
        /// Reason given by the final attempt.
        last_failure: String,
    },
    /// An attempt reported a failure that retrying cannot fix.
    #[error("{label} failed: {reason}")]
    Failed {
        /// What was being attempted.
        label: String,
        /// Attempt that gave up.
        attempt: u32,
        /// Reason given.
        reason: String,
    },
    /// The loop was aborted by an error from the work itself.
    #[error("{0}")]
    Aborted(E),
    /// Shutdown was requested.
    #[error("shutdown requested")]
    Cancelled,
}

/// Attempt bound and cooldown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecoveryPolicy {
    max_attempts: u32,
    cooldown: Duration,
}

impl RecoveryPolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns [`ZeroAttempts`] when `max_attempts` is zero.
    pub const fn new(max_attempts: u32, cooldown: Duration) -> Result<Self, ZeroAttempts> {
        if max_attempts == 0 {
            return Err(ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            cooldown,
        })
    }

    /// A policy that tries exactly once.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            cooldown: Duration::ZERO,
        }
    }

    /// Upper bound on attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause after each remediation.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Runs `work` until it succeeds, gives up, or the attempts run out.
    ///
    /// After a retryable failure with attempts remaining, the remediation
    /// runs, then the cooldown elapses, then the next attempt starts. With
    /// `max_attempts = n` the remediation runs at most `n - 1` times.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Exhausted`] after the final failed attempt,
    /// [`RecoveryError::Failed`] when an attempt gives up,
    /// [`RecoveryError::Aborted`] when the work errors, and
    /// [`RecoveryError::Cancelled`] when shutdown interrupts the loop.
    pub async fn run<R: Recoverable>(
        &self,
        ctx: &OrchestratorContext,
        label: &str,
        work: &mut R,
    ) -> Result<R::Output, RecoveryError<R::Error>> {
        let mut last_failure = String::new();
        for attempt in 1..=self.max_attempts {
            if ctx.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }

            match work
                .attempt(ctx, attempt)
                .await
                .map_err(RecoveryError::Aborted)?
            {
                Attempt::Succeeded(output) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "recovered");
                    }
                    return Ok(output);
                }
                Attempt::GiveUp(reason) => {
                    return Err(RecoveryError::Failed {
                        label: label.to_owned(),
                        attempt,
                        reason,
                    });
                }
                Attempt::Retry(reason) => {
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        reason = %reason,
                        "attempt failed"
                    );
                    last_failure = reason;
                }
            }

            if attempt == self.max_attempts {
                break;
            }
            work.remediate(ctx, attempt)
                .await
                .map_err(RecoveryError::Aborted)?;
            ctx.sleep(self.cooldown)
                .await
                .map_err(|_| RecoveryError::Cancelled)?;
        }

        Err(RecoveryError::Exhausted {
            label: label.to_owned(),
            attempts: self.max_attempts,
            last_failure,
        })
    }
}
