//! Explicit run context threaded through every component.
//!
//! The context replaces ambient globals: it carries the cooperative
//! cancellation token, the settings that govern the run, and the tracing span
//! used as the structured logging handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::role::Role;

/// Whether the orchestrator stops after one cycle or keeps cycling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RunMode {
    /// Run exactly one cycle and report its outcome.
    #[default]
    Once,
    /// Start a fresh cycle after every cooldown until shutdown is requested.
    Continuous,
}

/// Run-wide settings resolved from configuration and CLI flags.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Network role applied by the role stage.
    pub role: Role,
    /// Single-cycle or continuous operation.
    pub mode: RunMode,
    /// Pause between cycles in continuous mode.
    pub cycle_cooldown: Duration,
    /// Timeout for establishing a remote session.
    pub connect_timeout: Duration,
    /// Ceiling on waiting for a device to answer probes after a network change.
    pub reachability_timeout: Duration,
    /// Delay between reachability probes while waiting.
    pub reachability_poll: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            role: Role::Forward,
            mode: RunMode::Once,
            cycle_cooldown: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reachability_timeout: Duration::from_secs(180),
            reachability_poll: Duration::from_secs(5),
        }
    }
}

/// Raised when shutdown was requested at a suspension point.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("shutdown requested")]
pub struct Cancelled;

/// Cancellation, settings, and logging handle shared by one orchestrator run.
#[derive(Clone, Debug)]
pub struct OrchestratorContext {
    cancel: CancellationToken,
    settings: Arc<RunSettings>,
    span: Span,
}

impl OrchestratorContext {
    /// Creates a context rooted at a `bringup` span.
    #[must_use]
    pub fn new(cancel: CancellationToken, settings: RunSettings) -> Self {
        Self {
            cancel,
            settings: Arc::new(settings),
            span: tracing::info_span!("bringup"),
        }
    }

    /// Returns a copy of this context logging under `span`.
    #[must_use]
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            cancel: self.cancel.clone(),
            settings: Arc::clone(&self.settings),
            span,
        }
    }

    /// Settings for this run.
    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Span that scopes log output for this context.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Token observed at every suspension point.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`Cancelled`] when shutdown has been requested.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] after the token fires.
    pub fn ensure_active(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early when shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the token fires before or during the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.ensure_active()?;
        tokio::select! {
            () = self.cancel.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let ctx = OrchestratorContext::new(CancellationToken::new(), RunSettings::default());
        assert_eq!(ctx.sleep(Duration::from_millis(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn sleep_wakes_early_on_cancellation() {
        let token = CancellationToken::new();
        let ctx = OrchestratorContext::new(token.clone(), RunSettings::default());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(30)).await;
        canceller
            .await
            .unwrap_or_else(|err| panic!("canceller task: {err}"));

        assert_eq!(result, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ensure_active_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = OrchestratorContext::new(token.clone(), RunSettings::default());
        assert!(ctx.ensure_active().is_ok());
        token.cancel();
        assert_eq!(ctx.ensure_active(), Err(Cancelled));
    }
}
