use std::future::Future;
use std::time::Duration;

use shadow_core::{ShadowError, ShadowResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request cancellation and deadline.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestCtx {
    pub fn new() -> Self { Self::default() }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Share an existing token, e.g. one tied to process shutdown.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn token(&self) -> &CancellationToken { &self.cancel }

    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Copy of this context that gets `timeout` when no deadline is set yet.
    pub fn or_timeout(&self, timeout: Option<Duration>) -> Self {
        match (self.deadline, timeout) {
            (None, Some(t)) => self.clone().with_timeout(t),
            _ => self.clone(),
        }
    }

    /// Run one store call, racing it against cancellation and the deadline.
    pub async fn guard<T, E, F>(&self, fut: F) -> ShadowResult<T>
    where
        F: Future<Output = Result<T, E>>,
        ShadowError: From<E>,
    {
        if self.is_done() {
            return Err(ShadowError::Cancelled);
        }
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ShadowError::Cancelled),
            _ = expired => Err(ShadowError::Cancelled),
            res = fut => res.map_err(ShadowError::from),
        }
    }
}
