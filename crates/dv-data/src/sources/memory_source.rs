//! In-memory data adapter
//!
//! Serves canned responses or filters a row set held in memory. Records every
//! call it receives, which makes it the adapter of choice for tests and demos.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use dv_core::{DataAdapter, FilterTarget, QueryDefinition};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

/// A filter application received by the adapter
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFilter {
    pub schema_id: String,
    pub target: FilterTarget,
    pub value: Value,
    pub batched: bool,
}

/// Adapter backed by in-memory data
pub struct MemorySource {
    name: String,
    rows: Vec<Value>,
    responses: RwLock<AHashMap<String, Value>>,
    failures: Mutex<AHashMap<String, usize>>,
    delay: Duration,
    batch: bool,
    fail_filters: RwLock<bool>,
    execute_calls: AtomicUsize,
    applied: Mutex<Vec<AppliedFilter>>,
    active: RwLock<AHashMap<String, BTreeMap<String, Value>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
            responses: RwLock::new(AHashMap::new()),
            failures: Mutex::new(AHashMap::new()),
            delay: Duration::ZERO,
            batch: true,
            fail_filters: RwLock::new(false),
            execute_calls: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            active: RwLock::new(AHashMap::new()),
        }
    }

    /// Rows queried when no canned response matches. Filter ids are matched
    /// against row fields.
    pub fn with_rows(mut self, rows: Vec<Value>) -> Self {
        self.rows = rows;
        self
    }

    /// Simulated latency of every adapter call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_batch_support(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    /// Canned response for a query id
    pub fn set_response(&self, query_id: &str, response: Value) {
        self.responses.write().insert(query_id.to_string(), response);
    }

    /// Make the next `times` executions of a query id fail
    pub fn fail_next(&self, query_id: &str, times: usize) {
        self.failures.lock().insert(query_id.to_string(), times);
    }

    /// Make filter applications fail
    pub fn set_fail_filters(&self, fail: bool) {
        *self.fail_filters.write() = fail;
    }

    pub fn execute_count(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn applied_filters(&self) -> Vec<AppliedFilter> {
        self.applied.lock().clone()
    }

    /// Filter values currently held for a schema, keyed by adapter reference
    pub fn active_filters(&self, schema_id: &str) -> BTreeMap<String, Value> {
        self.active.read().get(schema_id).cloned().unwrap_or_default()
    }

    fn take_failure(&self, query_id: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(query_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn record(&self, schema_id: &str, target: &FilterTarget, value: &Value, batched: bool) {
        self.applied.lock().push(AppliedFilter {
            schema_id: schema_id.to_string(),
            target: target.clone(),
            value: value.clone(),
            batched,
        });
        self.active
            .write()
            .entry(schema_id.to_string())
            .or_default()
            .insert(target.reference.clone(), value.clone());
    }

    fn filter_rows(&self, filters: &BTreeMap<String, Value>) -> Vec<Value> {
        self.rows
            .iter()
            .filter(|row| {
                filters.iter().all(|(field, wanted)| match row.get(field) {
                    Some(actual) => value_matches(actual, wanted),
                    // Rows without the field are not constrained by it
                    None => true,
                })
            })
            .cloned()
            .collect()
    }
}

fn value_matches(actual: &Value, wanted: &Value) -> bool {
    match wanted {
        Value::Null => true,
        Value::Array(options) if options.is_empty() => true,
        Value::Array(options) => options.iter().any(|o| o == actual),
        other => other == actual,
    }
}

#[async_trait]
impl DataAdapter for MemorySource {
    type Query = Value;
    type Output = Value;

    async fn execute(&self, query: &QueryDefinition<Value>) -> anyhow::Result<Value> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.take_failure(&query.id) {
            anyhow::bail!("{}: query '{}' failed", self.name, query.id);
        }

        if let Some(response) = self.responses.read().get(&query.id) {
            return Ok(response.clone());
        }

        if !self.rows.is_empty() {
            let rows = self.filter_rows(&query.filters);
            debug!(source = %self.name, query_id = %query.id, rows = rows.len(), "filtered rows");
            return Ok(json!({ "count": rows.len(), "rows": rows }));
        }

        Ok(json!({
            "query_id": query.id,
            "schema_id": query.schema_id,
            "query": query.query,
            "filters": query.filters,
        }))
    }

    async fn apply_filter(
        &self,
        schema_id: &str,
        target: &FilterTarget,
        value: &Value,
    ) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if *self.fail_filters.read() {
            anyhow::bail!("{}: cannot apply filter '{}'", self.name, target.filter_id);
        }
        self.record(schema_id, target, value, false);
        Ok(())
    }

    async fn apply_filters(
        &self,
        schema_id: &str,
        filters: &[(FilterTarget, Value)],
    ) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if *self.fail_filters.read() {
            anyhow::bail!("{}: cannot apply {} filters", self.name, filters.len());
        }
        for (target, value) in filters {
            self.record(schema_id, target, value, true);
        }
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn name(&self) -> &str {
        &self.name
    }
}
