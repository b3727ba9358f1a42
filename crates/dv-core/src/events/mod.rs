//! Action bus: prioritized, middleware-wrapped action dispatch
//!
//! Handlers are registered per action type and all of them fire on dispatch.
//! Every dispatch passes through the middleware chain in registration order.
//! Cancellation is cooperative: cancelling settles the dispatch as
//! `cancelled` right away, while the handler task keeps running until it
//! observes its [`CancellationToken`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod action;
mod middleware;

pub use action::{Action, ActionResult, Priority};
pub use middleware::{GuardMiddleware, LoggingMiddleware, Middleware, Next};

type HandlerFn =
    Arc<dyn Fn(Action, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Action bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionBusConfig {
    /// Debounce window per action type, in milliseconds
    pub debounce_ms: BTreeMap<String, u64>,

    /// Install a [`LoggingMiddleware`] at construction
    pub log_dispatch: bool,
}

impl ActionBusConfig {
    fn debounce_for(&self, kind: &str) -> Option<Duration> {
        self.debounce_ms
            .get(kind)
            .filter(|ms| **ms > 0)
            .map(|ms| Duration::from_millis(*ms))
    }
}

struct HandlerEntry {
    id: u64,
    handler: HandlerFn,
}

#[derive(Default)]
struct Registry {
    handlers: AHashMap<String, Vec<HandlerEntry>>,
    middlewares: Vec<(u64, Arc<dyn Middleware>)>,
    next_id: u64,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct PendingAction {
    kind: String,
    token: CancellationToken,
}

#[derive(Default)]
struct PendingSet {
    actions: AHashMap<u64, PendingAction>,
    next_seq: u64,
}

struct BusInner {
    registry: RwLock<Registry>,
    pending: Mutex<PendingSet>,
    debounce: Mutex<AHashMap<String, u64>>,
    config: ActionBusConfig,
}

/// Terminal step of the middleware chain: fans the action out to handlers
pub(crate) struct Endpoint {
    handlers: Vec<HandlerFn>,
    token: CancellationToken,
}

impl Endpoint {
    pub(crate) fn call(&self, action: Action) -> BoxFuture<'static, ActionResult> {
        if self.handlers.is_empty() {
            debug!(action = %action.kind, "no handler registered");
            return futures::future::ready(ActionResult::unhandled()).boxed();
        }

        // Handlers start in registration order and run independently
        let calls: Vec<_> = self
            .handlers
            .iter()
            .map(|handler| handler(action.clone(), self.token.clone()))
            .collect();

        async move { ActionResult::from_outcomes(join_all(calls).await) }.boxed()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Removes the dispatch from the pending set when it settles or is dropped
struct PendingGuard<'a> {
    inner: &'a BusInner,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().actions.remove(&self.seq);
    }
}

enum SubscriptionTarget {
    Handler { kind: String, id: u64 },
    Middleware { id: u64 },
}

/// Handle returned by registrations; `unsubscribe` removes exactly that entry
#[must_use = "dropping a Subscription keeps the registration; call unsubscribe() to remove it"]
pub struct Subscription {
    bus: Weak<BusInner>,
    target: SubscriptionTarget,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut registry = bus.registry.write();
        match self.target {
            SubscriptionTarget::Handler { kind, id } => {
                if let Some(list) = registry.handlers.get_mut(&kind) {
                    list.retain(|entry| entry.id != id);
                    if list.is_empty() {
                        registry.handlers.remove(&kind);
                    }
                }
            }
            SubscriptionTarget::Middleware { id } => {
                registry.middlewares.retain(|(mid, _)| *mid != id);
            }
        }
    }
}

/// Central action dispatcher
#[derive(Clone)]
pub struct ActionBus {
    inner: Arc<BusInner>,
}

impl ActionBus {
    pub fn new(config: ActionBusConfig) -> Self {
        let log_dispatch = config.log_dispatch;
        let bus = Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                pending: Mutex::new(PendingSet::default()),
                debounce: Mutex::new(AHashMap::new()),
                config,
            }),
        };
        if log_dispatch {
            // Lives as long as the bus
            let _logging = bus.use_middleware(LoggingMiddleware);
        }
        bus
    }

    pub fn config(&self) -> &ActionBusConfig {
        &self.inner.config
    }

    /// Register a handler for an action type. Handlers accumulate; all of
    /// them are invoked on dispatch, in registration order.
    pub fn on<F, Fut>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Action, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let kind = kind.into();
        let handler: HandlerFn = Arc::new(move |action, token| handler(action, token).boxed());

        let mut registry = self.inner.registry.write();
        let id = registry.allocate_id();
        registry
            .handlers
            .entry(kind.clone())
            .or_default()
            .push(HandlerEntry { id, handler });

        Subscription {
            bus: Arc::downgrade(&self.inner),
            target: SubscriptionTarget::Handler { kind, id },
        }
    }

    /// Remove every handler for an action type
    pub fn off(&self, kind: &str) {
        self.inner.registry.write().handlers.remove(kind);
    }

    /// Append a middleware to the chain
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) -> Subscription {
        let mut registry = self.inner.registry.write();
        let id = registry.allocate_id();
        registry.middlewares.push((id, Arc::new(middleware)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            target: SubscriptionTarget::Middleware { id },
        }
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.inner
            .registry
            .read()
            .handlers
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Dispatch an action. Never fails: handler errors, panics and
    /// cancellation are all reported through the [`ActionResult`].
    pub async fn dispatch(&self, action: Action) -> ActionResult {
        let token = CancellationToken::new();
        let seq = {
            let mut pending = self.inner.pending.lock();
            pending.next_seq += 1;
            let seq = pending.next_seq;
            pending.actions.insert(
                seq,
                PendingAction {
                    kind: action.kind.clone(),
                    token: token.clone(),
                },
            );
            seq
        };
        let _guard = PendingGuard {
            inner: &*self.inner,
            seq,
        };

        self.run(action, token).await
    }

    async fn run(&self, action: Action, token: CancellationToken) -> ActionResult {
        if let Some(window) = self.inner.config.debounce_for(&action.kind) {
            let generation = {
                let mut debounce = self.inner.debounce.lock();
                let counter = debounce.entry(action.kind.clone()).or_insert(0);
                *counter += 1;
                *counter
            };

            tokio::select! {
                _ = token.cancelled() => return ActionResult::cancelled(),
                _ = tokio::time::sleep(window) => {}
            }

            let latest = self.inner.debounce.lock().get(&action.kind).copied();
            if latest != Some(generation) {
                debug!(action = %action.kind, id = %action.id, "superseded by a newer dispatch");
                return ActionResult::cancelled();
            }
        }

        if token.is_cancelled() {
            return ActionResult::cancelled();
        }

        let (middlewares, handlers) = {
            let registry = self.inner.registry.read();
            let middlewares: Vec<Arc<dyn Middleware>> =
                registry.middlewares.iter().map(|(_, m)| m.clone()).collect();
            let handlers: Vec<HandlerFn> = registry
                .handlers
                .get(&action.kind)
                .map(|list| list.iter().map(|e| e.handler.clone()).collect())
                .unwrap_or_default();
            (middlewares, handlers)
        };

        let endpoint = Endpoint {
            handlers,
            token: token.clone(),
        };
        let kind = action.kind.clone();
        // Spawned so that a cancelled dispatch never preempts its handlers
        let task = tokio::spawn(async move {
            let next = Next::new(&middlewares, &endpoint);
            next.run(action).await
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(action = %kind, "dispatch cancelled");
                ActionResult::cancelled()
            }
            joined = task => match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(action = %kind, error = %e, "action task aborted");
                    ActionResult::failed(anyhow::anyhow!("action '{}' aborted: {}", kind, e))
                }
            }
        }
    }

    /// Dispatch actions one after another. A failure does not stop the
    /// remaining actions.
    pub async fn dispatch_sequence(&self, actions: Vec<Action>) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.dispatch(action).await);
        }
        results
    }

    /// Dispatch actions concurrently. Higher priorities start first; results
    /// are returned in input order.
    pub async fn dispatch_parallel(&self, actions: Vec<Action>) -> Vec<ActionResult> {
        let order = priority_order(&actions);
        let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();

        let dispatches: Vec<_> = order
            .into_iter()
            .filter_map(|index| slots[index].take().map(|action| (index, action)))
            .map(|(index, action)| async move { (index, self.dispatch(action).await) })
            .collect();

        let mut results = vec![ActionResult::default(); slots.len()];
        for (index, result) in join_all(dispatches).await {
            results[index] = result;
        }
        results
    }

    /// Whether any dispatch (optionally of one type) is still in flight
    pub fn has_pending(&self, kind: Option<&str>) -> bool {
        let pending = self.inner.pending.lock();
        match kind {
            Some(kind) => pending.actions.values().any(|p| p.kind == kind),
            None => !pending.actions.is_empty(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().actions.len()
    }

    /// Cancel in-flight dispatches of a type, or all of them. Returns the
    /// number of dispatches cancelled.
    pub fn cancel(&self, kind: Option<&str>) -> usize {
        let pending = self.inner.pending.lock();
        let mut count = 0;
        for action in pending.actions.values() {
            if kind.map_or(true, |k| action.kind == k) && !action.token.is_cancelled() {
                action.token.cancel();
                count += 1;
            }
        }
        if count > 0 {
            debug!(kind = ?kind, count, "cancelled pending actions");
        }
        count
    }
}

impl Default for ActionBus {
    fn default() -> Self {
        Self::new(ActionBusConfig::default())
    }
}

/// Start order for a parallel dispatch: descending priority, stable for ties
fn priority_order(actions: &[Action]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..actions.len()).collect();
    order.sort_by(|a, b| actions[*b].priority.cmp(&actions[*a].priority));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn handle<'a>(&'a self, action: Action, next: Next<'a>) -> BoxFuture<'a, ActionResult> {
            Box::pin(async move {
                self.log.lock().push(format!("{}-before", self.name));
                let result = next.run(action).await;
                self.log.lock().push(format!("{}-after", self.name));
                result
            })
        }
    }

    #[tokio::test]
    async fn test_all_handlers_fire() {
        let bus = ActionBus::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _sub = bus.on("PING", move |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("pong"))
                }
            });
        }

        let result = bus.dispatch(Action::new("PING")).await;
        assert!(result.success);
        assert_eq!(result.value, Some(json!("pong")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_count("PING"), 2);
    }

    #[tokio::test]
    async fn test_sequence_continues_after_failure() {
        let bus = ActionBus::default();
        let _a = bus.on("A", |_, _| async { Err(anyhow::anyhow!("boom")) });
        let _b = bus.on("B", |_, _| async { Ok(json!(2)) });

        let results = bus
            .dispatch_sequence(vec![Action::new("A"), Action::new("B")])
            .await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_ref().unwrap().to_string(), "boom");
        assert!(results[1].success);
        assert_eq!(results[1].value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_unhandled_is_distinguishable() {
        let bus = ActionBus::default();
        let result = bus.dispatch(Action::new("NOBODY")).await;

        assert!(!result.success);
        assert!(result.unhandled);
        assert!(result.error.is_none());
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_single_handler() {
        let bus = ActionBus::default();
        let first = bus.on("X", |_, _| async { Ok(json!("first")) });
        let _second = bus.on("X", |_, _| async { Ok(json!("second")) });

        first.unsubscribe();
        assert_eq!(bus.handler_count("X"), 1);
        let result = bus.dispatch(Action::new("X")).await;
        assert_eq!(result.value, Some(json!("second")));

        bus.off("X");
        assert_eq!(bus.handler_count("X"), 0);
        assert!(bus.dispatch(Action::new("X")).await.unhandled);
    }

    #[tokio::test]
    async fn test_middleware_onion_order() {
        let bus = ActionBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _m1 = bus.use_middleware(Recorder { name: "m1", log: log.clone() });
        let _m2 = bus.use_middleware(Recorder { name: "m2", log: log.clone() });
        let handler_log = log.clone();
        let _h = bus.on("X", move |_, _| {
            let log = handler_log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok(Value::Null)
            }
        });

        bus.dispatch(Action::new("X")).await;
        assert_eq!(
            *log.lock(),
            vec!["m1-before", "m2-before", "handler", "m2-after", "m1-after"]
        );
    }

    #[tokio::test]
    async fn test_middleware_unsubscribe() {
        let bus = ActionBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = bus.use_middleware(Recorder { name: "m", log: log.clone() });
        let _h = bus.on("X", |_, _| async { Ok(Value::Null) });

        sub.unsubscribe();
        bus.dispatch(Action::new("X")).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_guard_short_circuits() {
        let bus = ActionBus::default();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let _h = bus.on("DELETE", move |_, _| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let _g = bus.use_middleware(GuardMiddleware::new("read-only dashboard", |a| a.kind != "DELETE"));

        let result = bus.dispatch(Action::new("DELETE")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().to_string().contains("read-only dashboard"));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_is_cooperative() {
        let bus = ActionBus::default();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let _h = bus.on("SLOW", move |_, _| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let dispatcher = bus.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(Action::new("SLOW")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(bus.has_pending(Some("SLOW")));
        assert!(!bus.has_pending(Some("OTHER")));
        assert_eq!(bus.cancel(Some("SLOW")), 1);

        let result = handle.await.unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(!bus.has_pending(None));

        // The handler still completes its side effects
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_observes_token() {
        let bus = ActionBus::default();
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let _h = bus.on("POLL", move |_, token: CancellationToken| {
            let flag = flag.clone();
            async move {
                let observed = tokio::time::timeout(Duration::from_secs(2), token.cancelled()).await;
                flag.store(observed.is_ok(), Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let dispatcher = bus.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(Action::new("POLL")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.cancel(None);

        assert!(handle.await.unwrap().cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parallel_preserves_input_order() {
        let bus = ActionBus::default();
        let _h = bus.on("ECHO", |action: Action, _| async move {
            let delay = action.payload["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(action.payload["n"].clone())
        });

        let actions = vec![
            Action::new("ECHO").with_payload(json!({"n": 0, "delay": 40})),
            Action::new("ECHO").with_payload(json!({"n": 1, "delay": 0})).with_priority(Priority::High),
            Action::new("ECHO").with_payload(json!({"n": 2, "delay": 10})).with_priority(Priority::Low),
        ];
        let results = bus.dispatch_parallel(actions).await;

        let values: Vec<_> = results.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_priority_order_is_stable() {
        let actions = vec![
            Action::new("a").with_priority(Priority::Low),
            Action::new("b"),
            Action::new("c").with_priority(Priority::High),
            Action::new("d"),
        ];
        assert_eq!(priority_order(&actions), vec![2, 1, 3, 0]);
    }

    #[tokio::test]
    async fn test_handler_panic_is_captured() {
        let bus = ActionBus::default();
        let _h = bus.on("PANIC", |_, _| async {
            if true {
                panic!("handler exploded");
            }
            Ok(Value::Null)
        });

        let result = bus.dispatch(Action::new("PANIC")).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_debounce_keeps_latest() {
        let mut config = ActionBusConfig::default();
        config.debounce_ms.insert("SEARCH".to_string(), 30);
        let bus = ActionBus::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _h = bus.on("SEARCH", move |action: Action, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(action.payload)
            }
        });

        let results = bus
            .dispatch_parallel(vec![
                Action::new("SEARCH").with_payload(json!("a")),
                Action::new("SEARCH").with_payload(json!("ab")),
            ])
            .await;

        assert!(results[0].cancelled);
        assert!(results[1].success);
        assert_eq!(results[1].value, Some(json!("ab")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logging_config_installs_middleware() {
        let bus = ActionBus::new(ActionBusConfig {
            log_dispatch: true,
            ..Default::default()
        });
        let _h = bus.on("X", |_, _| async { Ok(json!(true)) });
        assert!(bus.dispatch(Action::new("X")).await.success);
        assert_eq!(bus.inner.registry.read().middlewares.len(), 1);
    }
}
