//! Query execution with caching and request coalescing
//!
//! Every query goes through [`QueryManager::execute`]. Identical concurrent
//! requests share one adapter call; completed results are cached until they
//! expire or are invalidated. Failures are never cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dv_core::{DataAdapter, QueryDefinition};
use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CacheStats, QueryCache, Settled};
use crate::DataError;

/// Query manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryManagerConfig {
    /// Store completed results
    pub enable_cache: bool,

    /// Lifetime of cached results; `None` keeps them until invalidated
    pub cache_ttl_ms: Option<u64>,

    /// Drop results of requests that were in flight when their key was
    /// invalidated, instead of writing them to the cache
    pub discard_stale_writes: bool,

    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for QueryManagerConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_ttl_ms: Some(5 * 60 * 1000),
            discard_stale_writes: false,
            event_capacity: 64,
        }
    }
}

impl QueryManagerConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }
}

/// Result of a query execution
pub struct QueryResult<T> {
    /// Shared with every caller that received the same settled request
    pub data: Arc<T>,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}

impl<T> Clone for QueryResult<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            from_cache: self.from_cache,
            timestamp: self.timestamp,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("data", &self.data)
            .field("from_cache", &self.from_cache)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl<T> QueryResult<T> {
    fn from_settled(settled: Settled<T>, from_cache: bool) -> Self {
        Self {
            data: settled.data,
            from_cache,
            timestamp: settled.timestamp,
        }
    }
}

/// Query lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    Started { query_id: String, key: String },
    Completed { query_id: String, from_cache: bool },
    Failed { query_id: String, error: String },
    Invalidated { scope: String, count: usize },
}

/// Single entry point for query execution against a [`DataAdapter`]
pub struct QueryManager<A: DataAdapter> {
    adapter: Arc<A>,
    cache: Arc<Mutex<QueryCache<A::Output>>>,
    config: QueryManagerConfig,
    events: broadcast::Sender<QueryEvent>,
}

impl<A: DataAdapter> QueryManager<A> {
    pub fn new(adapter: Arc<A>, config: QueryManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            adapter,
            cache: Arc::new(Mutex::new(QueryCache::new(config.cache_ttl()))),
            config,
            events,
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn get_config(&self) -> &QueryManagerConfig {
        &self.config
    }

    /// Subscribe to query lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueryEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Execute a query.
    ///
    /// Returns a cached result when one is available, joins the in-flight
    /// request for the same key when there is one, and otherwise starts a new
    /// adapter call. The pending slot is written before the call is spawned,
    /// so a second caller arriving at any point afterwards coalesces onto it.
    pub async fn execute(
        &self,
        query: &QueryDefinition<A::Query>,
    ) -> Result<QueryResult<A::Output>, DataError> {
        let key = query.cache_key();

        let request = {
            let mut cache = self.cache.lock();

            if self.config.enable_cache {
                if let Some(settled) = cache.lookup(&key) {
                    debug!(query_id = %query.id, "cache hit");
                    drop(cache);
                    self.emit(QueryEvent::Completed {
                        query_id: query.id.clone(),
                        from_cache: true,
                    });
                    return Ok(QueryResult::from_settled(settled, true));
                }
            }

            match cache.pending(&key) {
                Some(request) => {
                    debug!(query_id = %query.id, "joining in-flight request");
                    request
                }
                None => {
                    let ticket = cache.next_ticket();
                    let request = self.spawn_request(query, key.clone(), ticket);
                    cache.begin(key.clone(), ticket, &query.id, &query.schema_id, request.clone());
                    self.emit(QueryEvent::Started {
                        query_id: query.id.clone(),
                        key: key.clone(),
                    });
                    request
                }
            }
        };

        match request.await {
            Ok(settled) => {
                self.emit(QueryEvent::Completed {
                    query_id: query.id.clone(),
                    from_cache: false,
                });
                Ok(QueryResult::from_settled(settled, false))
            }
            Err(error) => {
                self.emit(QueryEvent::Failed {
                    query_id: query.id.clone(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Start the adapter call on its own task. Must be called with the cache
    /// lock held; the task only touches the cache after the adapter returns.
    fn spawn_request(
        &self,
        query: &QueryDefinition<A::Query>,
        key: String,
        ticket: u64,
    ) -> crate::cache::SharedRequest<A::Output> {
        let adapter = self.adapter.clone();
        let cache = self.cache.clone();
        let definition = query.clone();
        let store = self.config.enable_cache;

        let task_key = key.clone();
        let task_cache = cache.clone();
        let task = tokio::spawn(async move {
            let outcome = adapter.execute(&definition).await;

            let mut cache = task_cache.lock();
            let owns_slot = cache.settle(&task_key, ticket);
            match outcome {
                Ok(data) => {
                    let settled = Settled {
                        data: Arc::new(data),
                        timestamp: Utc::now(),
                    };
                    if store && owns_slot {
                        cache.store(task_key, &definition.id, &definition.schema_id, &settled);
                    } else if store {
                        debug!(query_id = %definition.id, "discarding result of invalidated request");
                    }
                    Ok(settled)
                }
                Err(e) => {
                    debug!(query_id = %definition.id, error = %e, "adapter execute failed");
                    Err(DataError::adapter(e))
                }
            }
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    // The task never reached its own settle step
                    cache.lock().settle(&key, ticket);
                    Err(DataError::from(join_error))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Execute several queries. Results are returned in input order in both
    /// modes; the first failure fails the batch.
    pub async fn execute_many(
        &self,
        queries: &[QueryDefinition<A::Query>],
        parallel: bool,
    ) -> Result<Vec<QueryResult<A::Output>>, DataError> {
        if parallel {
            try_join_all(queries.iter().map(|q| self.execute(q))).await
        } else {
            let mut results = Vec::with_capacity(queries.len());
            for query in queries {
                results.push(self.execute(query).await?);
            }
            Ok(results)
        }
    }

    /// Warm the cache. Failures are logged and swallowed.
    pub async fn prefetch(&self, queries: &[QueryDefinition<A::Query>]) {
        let outcomes = join_all(queries.iter().map(|q| self.execute(q))).await;
        for (query, outcome) in queries.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(query_id = %query.id, error = %e, "prefetch failed");
            }
        }
    }

    /// Whether a completed, unexpired result exists for the query
    pub fn is_cached(&self, query: &QueryDefinition<A::Query>) -> bool {
        self.config.enable_cache && self.cache.lock().contains(&query.cache_key())
    }

    /// Drop cached results of a query id
    pub fn invalidate(&self, query_id: &str) -> usize {
        let count = self
            .cache
            .lock()
            .invalidate_where(|id, _| id == query_id, self.config.discard_stale_writes);
        debug!(query_id, count, "invalidated query");
        self.emit(QueryEvent::Invalidated {
            scope: format!("query:{}", query_id),
            count,
        });
        count
    }

    /// Drop cached results of every query on a schema
    pub fn invalidate_schema(&self, schema_id: &str) -> usize {
        let count = self
            .cache
            .lock()
            .invalidate_where(|_, schema| schema == schema_id, self.config.discard_stale_writes);
        debug!(schema_id, count, "invalidated schema");
        self.emit(QueryEvent::Invalidated {
            scope: format!("schema:{}", schema_id),
            count,
        });
        count
    }

    pub fn clear_cache(&self) {
        let count = self.cache.lock().clear(self.config.discard_stale_writes);
        debug!(count, "query cache cleared");
        self.emit(QueryEvent::Invalidated {
            scope: "all".to_string(),
            count,
        });
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}
