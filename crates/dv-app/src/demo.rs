//! Demo mode for the dashboard
//! Serves a synthetic sales dataset through the data adapter contract

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dv_core::{
    DataAdapter, FilterConfig, FilterTarget, ObjectFilterConfig, QueryDefinition, Schema,
    SchemaBuilder, SimpleFilterConfig,
};
use dv_data::{FilterBinding, FilterDefinition};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const SALES_SCHEMA: &str = "vendas";
pub const CURRENT_YEAR: i64 = 2024;

const STORES: [&str; 4] = ["bdn", "cps", "spo", "rib"];

/// What the demo adapter can aggregate
#[derive(Debug, Clone, Serialize)]
pub struct SalesQuery {
    /// `revenue`, `cost` or `profit`
    pub measure: String,
}

impl SalesQuery {
    pub fn new(measure: impl Into<String>) -> Self {
        Self {
            measure: measure.into(),
        }
    }
}

/// Aggregated measure for the filtered rows
#[derive(Debug, Clone, Serialize)]
pub struct SalesSummary {
    pub measure: String,
    pub current: f64,
    pub previous: f64,

    /// Current-year value across every store, for participation
    pub total: f64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
struct SalesRow {
    year: i64,
    store: &'static str,
    channel: &'static str,
    revenue: f64,
    cost: f64,
}

impl SalesRow {
    fn measure(&self, name: &str) -> Option<f64> {
        match name {
            "revenue" => Some(self.revenue),
            "cost" => Some(self.cost),
            "profit" => Some(self.revenue - self.cost),
            _ => None,
        }
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "loja" => Some(json!(self.store)),
            "canal" => Some(json!(self.channel)),
            "ano" => Some(json!(self.year)),
            _ => None,
        }
    }
}

/// Demo data source that generates synthetic sales
pub struct DemoSalesSource {
    rows: Vec<SalesRow>,
    latency: Duration,
    applied: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl DemoSalesSource {
    pub fn new() -> Self {
        Self::with_rows(1000)
    }

    pub fn with_rows(total_rows: usize) -> Self {
        let rows = (0..total_rows).map(generate_row).collect::<Vec<_>>();
        info!(rows = rows.len(), "generated demo sales");
        Self {
            rows,
            latency: Duration::from_millis(25),
            applied: RwLock::new(BTreeMap::new()),
        }
    }

    /// Filter values the adapter has received for a schema
    pub fn applied_filters(&self, schema_id: &str) -> BTreeMap<String, Value> {
        self.applied.read().get(schema_id).cloned().unwrap_or_default()
    }
}

impl Default for DemoSalesSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthetic row: a seasonal revenue curve with pseudo-random noise
fn generate_row(i: usize) -> SalesRow {
    let idx = i as f64;
    let t = idx * 0.01;
    let noise = (idx * 12345.6789).sin() * 0.1;

    let year = if i % 2 == 0 { CURRENT_YEAR - 1 } else { CURRENT_YEAR };
    let growth = if year == CURRENT_YEAR { 1.15 } else { 1.0 };
    let is_weekend = (i / 10) % 7 >= 5;
    let base_revenue = 10000.0 + (t * 10.0).sin() * 2000.0;
    let revenue = if is_weekend { base_revenue * 0.7 } else { base_revenue } * growth;
    let cost = 6000.0 + (t * 8.0).cos() * 500.0 + noise * 200.0;

    SalesRow {
        year,
        store: STORES[(i / 25) % STORES.len()],
        channel: if i % 3 == 0 { "loja_fisica" } else { "online" },
        revenue,
        cost,
    }
}

fn matches(actual: &Value, wanted: &Value) -> bool {
    match wanted {
        Value::Null => true,
        Value::Array(options) if options.is_empty() => true,
        Value::Array(options) => options.iter().any(|o| o == actual),
        other => other == actual,
    }
}

#[async_trait]
impl DataAdapter for DemoSalesSource {
    type Query = SalesQuery;
    type Output = SalesSummary;

    async fn execute(&self, query: &QueryDefinition<SalesQuery>) -> Result<SalesSummary> {
        tokio::time::sleep(self.latency).await;

        let measure = query.query.measure.as_str();
        if self.rows.first().and_then(|r| r.measure(measure)).is_none() {
            anyhow::bail!("unknown measure '{}'", measure);
        }

        let selected = |row: &SalesRow, skip: &str| {
            query.filters.iter().all(|(field, wanted)| {
                field == skip || row.field(field).map_or(true, |actual| matches(&actual, wanted))
            })
        };

        let mut summary = SalesSummary {
            measure: measure.to_string(),
            current: 0.0,
            previous: 0.0,
            total: 0.0,
            rows: 0,
        };
        for row in &self.rows {
            let value = row.measure(measure).unwrap_or_default();
            if row.year == CURRENT_YEAR && selected(row, "loja") {
                summary.total += value;
            }
            if !selected(row, "") {
                continue;
            }
            summary.rows += 1;
            if row.year == CURRENT_YEAR {
                summary.current += value;
            } else {
                summary.previous += value;
            }
        }

        debug!(query_id = %query.id, rows = summary.rows, "demo query executed");
        Ok(summary)
    }

    async fn apply_filter(&self, schema_id: &str, target: &FilterTarget, value: &Value) -> Result<()> {
        self.apply_filters(schema_id, &[(target.clone(), value.clone())]).await
    }

    async fn apply_filters(&self, schema_id: &str, filters: &[(FilterTarget, Value)]) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        let mut applied = self.applied.write();
        let state = applied.entry(schema_id.to_string()).or_default();
        for (target, value) in filters {
            info!(schema = schema_id, reference = %target.reference, %value, "filter applied");
            state.insert(target.reference.clone(), value.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "demo-sales"
    }
}

/// Schema describing the demo dataset
pub fn sales_schema() -> Result<Schema> {
    let schema = SchemaBuilder::new(SALES_SCHEMA)
        .data_source("demo-sales")
        .dimension_with_hierarchy("loja", "Loja", "[Loja].[Codigo]")
        .dimension("canal", "Canal")
        .dimension("ano", "Ano")
        .measure("revenue", "Receita", "currency")
        .measure("cost", "Custo", "currency")
        .measure("profit", "Lucro", "currency")
        .category("financeiro", "Financeiro", &["revenue", "cost", "profit"])
        .filter_config("loja", FilterConfig::Simple(SimpleFilterConfig { dimension: "loja".into() }))
        .filter_config(
            "canal",
            FilterConfig::Object(ObjectFilterConfig {
                dimension: "canal".into(),
                fixed_value: Some(json!("online")),
                accepts: None,
                zero_on_conflict: true,
            }),
        )
        .governance_filter("canal")
        .build()?;
    Ok(schema)
}

/// Dashboard filters of the demo
pub fn filter_definitions() -> Vec<FilterDefinition> {
    let mut loja = FilterDefinition::new("loja", Value::Null).with_label("Loja");
    for (value, label) in STORES.iter().zip(["Bandeirantes", "Campinas", "Sao Paulo", "Ribeirao"]) {
        loja = loja.with_option(json!(value), label);
    }

    vec![
        loja.bind(
            SALES_SCHEMA,
            FilterBinding::new()
                .with_config("loja")
                .with_to_adapter(|v| match v {
                    Value::Null | Value::Array(_) => v.clone(),
                    other => json!([other]),
                })
                .with_from_adapter(|v| match v.as_array().map(|a| a.as_slice()) {
                    Some([single]) => single.clone(),
                    _ => v.clone(),
                }),
        ),
        FilterDefinition::new("canal", json!("online"))
            .with_label("Canal")
            .bind(SALES_SCHEMA, FilterBinding::new().with_config("canal")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_source_filters_rows() {
        let source = DemoSalesSource::with_rows(200);
        let all = QueryDefinition::new("q", SALES_SCHEMA, SalesQuery::new("revenue"));
        let everything = source.execute(&all).await.unwrap();
        assert_eq!(everything.rows, 200);
        assert!(everything.current > everything.previous);

        let mut filters = BTreeMap::new();
        filters.insert("loja".to_string(), json!(["bdn"]));
        let one_store = source
            .execute(&QueryDefinition::new("q", SALES_SCHEMA, SalesQuery::new("revenue")).with_filters(filters))
            .await
            .unwrap();
        assert!(one_store.rows < everything.rows);
        assert_eq!(one_store.total, everything.current);
    }

    #[tokio::test]
    async fn test_unknown_measure_fails() {
        let source = DemoSalesSource::with_rows(10);
        let query = QueryDefinition::new("q", SALES_SCHEMA, SalesQuery::new("headcount"));
        assert!(source.execute(&query).await.is_err());
    }

    #[tokio::test]
    async fn test_applied_filters_follow_adapter_reference() {
        let source = DemoSalesSource::with_rows(10);
        let loja = FilterTarget::new("loja", "[Loja].[Codigo]");
        let canal = FilterTarget::new("canal", "canal");

        source
            .apply_filters(SALES_SCHEMA, &[(loja.clone(), json!(["bdn"])), (canal, json!("online"))])
            .await
            .unwrap();
        source.apply_filter(SALES_SCHEMA, &loja, &json!(["cps"])).await.unwrap();

        let applied = source.applied_filters(SALES_SCHEMA);
        assert_eq!(applied.len(), 2);
        assert_eq!(applied["[Loja].[Codigo]"], json!(["cps"]));
        assert_eq!(applied["canal"], json!("online"));
        assert!(source.applied_filters("estoque").is_empty());
    }

    #[test]
    fn test_schema_and_filters_are_consistent() {
        let schema = sales_schema().unwrap();
        for definition in filter_definitions() {
            let binding = definition.binding(SALES_SCHEMA).unwrap();
            let config = binding.config.as_deref().unwrap();
            assert!(schema.filter_config(config).is_some());
        }
    }
}
