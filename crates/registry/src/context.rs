use std::time::Duration;

use tessera_core::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE_DEFAULT: &str = "default";

/// Per-request scope: target namespace plus cancellation and deadline.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    namespace: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Cluster-wide context (no namespace).
    pub fn new() -> Self { Self::default() }

    pub fn with_namespace(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Self::default() }
    }

    /// Context targeting the `default` namespace.
    pub fn default_namespace() -> Self { Self::with_namespace(NAMESPACE_DEFAULT) }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Deadline `d` from now; a timeout past the clock's range means none.
    pub fn with_timeout(self, d: Duration) -> Self {
        match Instant::now().checked_add(d) {
            Some(at) => self.with_deadline(at),
            None => self,
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref().filter(|s| !s.is_empty()) }

    pub fn token(&self) -> &CancellationToken { &self.cancel }

    /// Fails with `Cancelled` once the token fired or the deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("request cancelled".into()));
        }
        if let Some(at) = self.deadline {
            if Instant::now() >= at {
                return Err(Error::Cancelled("deadline exceeded".into()));
            }
        }
        Ok(())
    }

    /// Sleep for `d`, waking early with `Cancelled` on cancellation or deadline.
    pub async fn sleep(&self, d: Duration) -> Result<()> {
        self.check()?;
        let until = [self.deadline, Instant::now().checked_add(d)].into_iter().flatten().min();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = async {
                match until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_empty_is_none() {
        assert_eq!(RequestContext::with_namespace("").namespace(), None);
        assert_eq!(RequestContext::default_namespace().namespace(), Some("default"));
        assert_eq!(RequestContext::new().namespace(), None);
    }

    #[tokio::test]
    async fn cancelled_token_fails_check() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new().with_cancellation(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(ctx.check().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_stops_at_deadline() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_and_sleep_do_not_overflow() {
        let ctx = RequestContext::new().with_timeout(Duration::MAX);
        assert!(ctx.check().is_ok());

        let token = CancellationToken::new();
        let ctx = ctx.with_cancellation(token.clone());
        let sleeper = tokio::spawn(async move { ctx.sleep(Duration::MAX).await });
        tokio::task::yield_now().await;
        token.cancel();
        assert!(sleeper.await.unwrap().unwrap_err().is_cancelled());
    }
}
