//! Middleware chain wrapped around every dispatch

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Action, ActionResult, Endpoint};

/// Middleware wrapping handler invocation.
///
/// Implementations call `next.run(action)` to continue the chain, or return
/// a result directly to short-circuit it.
pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, action: Action, next: Next<'a>) -> BoxFuture<'a, ActionResult>;
}

/// The remainder of the middleware chain
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a Endpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a Endpoint) -> Self {
        Self { chain, endpoint }
    }

    /// Run the rest of the chain, ending with the handlers
    pub fn run(self, action: Action) -> BoxFuture<'a, ActionResult> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(action, Next::new(rest, self.endpoint)),
            None => self.endpoint.call(action),
        }
    }

    /// Cancellation token of the action being dispatched
    pub fn token(&self) -> &CancellationToken {
        self.endpoint.token()
    }
}

/// Logs every dispatch with its outcome and duration
#[derive(Debug, Default, Clone)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn handle<'a>(&'a self, action: Action, next: Next<'a>) -> BoxFuture<'a, ActionResult> {
        Box::pin(async move {
            let started = Instant::now();
            let kind = action.kind.clone();
            let id = action.id.clone();
            debug!(action = %kind, id = %id, priority = ?action.priority, "dispatching action");

            let result = next.run(action).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result.error {
                Some(error) => warn!(action = %kind, id = %id, elapsed_ms, error = %error, "action failed"),
                None => debug!(
                    action = %kind,
                    id = %id,
                    elapsed_ms,
                    success = result.success,
                    cancelled = result.cancelled,
                    unhandled = result.unhandled,
                    "action settled"
                ),
            }
            result
        })
    }
}

type Predicate = dyn Fn(&Action) -> bool + Send + Sync;

/// Rejects actions failing a predicate before any handler runs
#[derive(Clone)]
pub struct GuardMiddleware {
    predicate: Arc<Predicate>,
    reason: String,
}

impl GuardMiddleware {
    pub fn new<F>(reason: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            reason: reason.into(),
        }
    }
}

impl Middleware for GuardMiddleware {
    fn handle<'a>(&'a self, action: Action, next: Next<'a>) -> BoxFuture<'a, ActionResult> {
        if (self.predicate)(&action) {
            next.run(action)
        } else {
            debug!(action = %action.kind, reason = %self.reason, "action rejected by guard");
            let error = anyhow::anyhow!("action '{}' rejected: {}", action.kind, self.reason);
            Box::pin(async move { ActionResult::failed(error) })
        }
    }
}
