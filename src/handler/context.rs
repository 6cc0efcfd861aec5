//! Call context for handlers.
//!
//! Every handler invocation receives a [`CallContext`] carrying the call's
//! correlation id, the operation name it was routed by (if any), and a
//! cancellation token:
//! - future calls: fires when the caller sends `abort` or the responder
//!   shuts down
//! - stream calls: fires when the caller unsubscribes, the stream terminates,
//!   or the responder shuts down
//!
//! Observing cancellation is optional; the responder still waits for the
//! handler to settle before it forgets the call.
//!
//! # Example
//!
//! ```ignore
//! async fn slow(n: u64, ctx: CallContext) -> Result<u64> {
//!     tokio::select! {
//!         _ = ctx.cancelled() => Err(PortwireError::handler("aborted")),
//!         _ = tokio::time::sleep(Duration::from_secs(n)) => Ok(n),
//!     }
//! }
//! ```

use tokio_util::sync::CancellationToken;

use crate::protocol::CorrelationId;

/// Context passed to request handlers.
///
/// `CallContext` is `Clone`; clones share the cancellation token.
#[derive(Clone, Debug)]
pub struct CallContext {
    correlation_id: CorrelationId,
    operation: Option<String>,
    cancellation: CancellationToken,
}

impl CallContext {
    #[cfg(test)]
    pub(crate) fn new(correlation_id: CorrelationId) -> Self {
        Self::with_token(correlation_id, CancellationToken::new())
    }

    /// Create a context around an existing token.
    pub fn with_token(correlation_id: CorrelationId, cancellation: CancellationToken) -> Self {
        Self {
            correlation_id,
            operation: None,
            cancellation,
        }
    }

    pub(crate) fn set_operation(&mut self, operation: Option<String>) {
        self.operation = operation;
    }

    /// The correlation id chosen by the caller.
    #[inline]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// The operation name, when the call was routed by name.
    #[inline]
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// The cancellation token for this call.
    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = CallContext::new(CorrelationId::from(42));
        assert_eq!(ctx.correlation_id(), &CorrelationId::from(42));
        assert_eq!(ctx.operation(), None);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_clone_shares_token() {
        let ctx = CallContext::new(CorrelationId::from("a"));
        let clone = ctx.clone();

        ctx.cancellation().cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let token = CancellationToken::new();
        let ctx = CallContext::with_token(CorrelationId::from(1), token.clone());

        let waiter = tokio::spawn(async move { ctx.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
    }
}
