//! Query result cache with in-flight request tracking
//!
//! Completed results and pending requests live in the same structure so the
//! check-then-act sequence in `QueryManager::execute` happens under one lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::Serialize;

use crate::DataError;

/// Result of a settled adapter call, shared by every coalesced caller
pub struct Settled<T> {
    pub data: Arc<T>,
    pub timestamp: DateTime<Utc>,
}

impl<T> Clone for Settled<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// In-flight request observed by every caller asking for the same key
pub type SharedRequest<T> = Shared<BoxFuture<'static, Result<Settled<T>, DataError>>>;

struct CacheEntry<T> {
    query_id: String,
    schema_id: String,
    data: Arc<T>,
    timestamp: DateTime<Utc>,
    stored_at: Instant,
}

struct PendingEntry<T> {
    ticket: u64,
    query_id: String,
    schema_id: String,
    request: SharedRequest<T>,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Completed entries currently stored
    pub size: usize,

    /// Requests currently in flight
    pub pending: usize,

    pub hits: u64,
    pub misses: u64,
    pub entries: Vec<CacheEntryInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub query_id: String,
    pub schema_id: String,
    pub age_ms: u64,
}

/// Query cache keyed by `QueryDefinition::cache_key`
pub struct QueryCache<T> {
    entries: AHashMap<String, CacheEntry<T>>,
    pending: AHashMap<String, PendingEntry<T>>,
    ttl: Option<Duration>,
    hits: u64,
    misses: u64,
    next_ticket: u64,
}

impl<T> QueryCache<T> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: AHashMap::new(),
            pending: AHashMap::new(),
            ttl,
            hits: 0,
            misses: 0,
            next_ticket: 0,
        }
    }

    fn is_expired(&self, entry: &CacheEntry<T>) -> bool {
        self.ttl.map_or(false, |ttl| entry.stored_at.elapsed() > ttl)
    }

    /// Look up a completed entry, pruning it if expired. Counts hits/misses.
    pub fn lookup(&mut self, key: &str) -> Option<Settled<T>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !self.is_expired(entry) => {
                self.hits += 1;
                return Some(Settled {
                    data: entry.data.clone(),
                    timestamp: entry.timestamp,
                });
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            tracing::debug!(key, "cache entry expired");
            self.entries.remove(key);
        }
        self.misses += 1;
        None
    }

    /// Whether a completed, unexpired entry exists. Does not count as a lookup.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| !self.is_expired(entry))
    }

    pub fn pending(&self, key: &str) -> Option<SharedRequest<T>> {
        self.pending.get(key).map(|p| p.request.clone())
    }

    pub fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Mark a request as in flight for `key`
    pub fn begin(
        &mut self,
        key: String,
        ticket: u64,
        query_id: &str,
        schema_id: &str,
        request: SharedRequest<T>,
    ) {
        self.pending.insert(
            key,
            PendingEntry {
                ticket,
                query_id: query_id.to_string(),
                schema_id: schema_id.to_string(),
                request,
            },
        );
    }

    /// Release the pending slot if `ticket` still owns it. Returns whether it
    /// did; a request detached by invalidation no longer owns its slot.
    pub fn settle(&mut self, key: &str, ticket: u64) -> bool {
        match self.pending.get(key) {
            Some(p) if p.ticket == ticket => {
                self.pending.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune_expired(&mut self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned expired cache entries");
        }
        removed
    }

    pub fn store(&mut self, key: String, query_id: &str, schema_id: &str, settled: &Settled<T>) {
        self.prune_expired();
        self.entries.insert(
            key,
            CacheEntry {
                query_id: query_id.to_string(),
                schema_id: schema_id.to_string(),
                data: settled.data.clone(),
                timestamp: settled.timestamp,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove completed entries matching `(query_id, schema_id)`. With
    /// `detach_pending`, matching in-flight requests lose their slot too.
    pub fn invalidate_where<F>(&mut self, predicate: F, detach_pending: bool) -> usize
    where
        F: Fn(&str, &str) -> bool,
    {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !predicate(&entry.query_id, &entry.schema_id));
        let removed = before - self.entries.len();

        if detach_pending {
            self.pending
                .retain(|_, p| !predicate(&p.query_id, &p.schema_id));
        }
        removed
    }

    pub fn clear(&mut self, detach_pending: bool) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        if detach_pending {
            self.pending.clear();
        }
        removed
    }

    /// Snapshot of the live cache; expired entries are pruned first
    pub fn stats(&mut self) -> CacheStats {
        self.prune_expired();
        let mut entries: Vec<CacheEntryInfo> = self
            .entries
            .iter()
            .map(|(key, entry)| CacheEntryInfo {
                key: key.clone(),
                query_id: entry.query_id.clone(),
                schema_id: entry.schema_id.clone(),
                age_ms: entry.stored_at.elapsed().as_millis() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        CacheStats {
            size: self.entries.len(),
            pending: self.pending.len(),
            hits: self.hits,
            misses: self.misses,
            entries,
        }
    }
}
