//! Dashboard demo entry point
//!
//! Wires the orchestration services around the synthetic sales adapter and
//! drives a scripted session through the action bus.

use std::sync::Arc;

use anyhow::Result;
use dv_core::{Action, ActionBusConfig, GuardMiddleware, SchemaRegistry};
use dv_data::{DashboardConfig, DashboardServices};
use dv_measures::{FormatKind, MeasureData, MeasureEngine, MeasureSchema};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod demo;

use demo::{DemoSalesSource, SalesQuery, SALES_SCHEMA};

type Services = DashboardServices<DemoSalesSource>;

/// KPI cards shown by the demo: query id and measure
const KPIS: [(&str, &str); 3] = [
    ("kpi_revenue", "revenue"),
    ("kpi_cost", "cost"),
    ("kpi_profit", "profit"),
];

fn format_kind(format: &str) -> FormatKind {
    match format {
        "currency" => FormatKind::Currency,
        "percent" => FormatKind::Percent,
        "compact" => FormatKind::Compact,
        _ => FormatKind::Number,
    }
}

/// Run every KPI query with the current filters and turn the results into
/// display-ready measures
async fn refresh(services: &Services, measures: &MeasureEngine) -> Result<Value> {
    let mut cards = Vec::with_capacity(KPIS.len());
    for (query_id, measure) in KPIS {
        let result = services
            .query_with_filters(query_id, SalesQuery::new(measure))
            .await?;
        let summary = &result.data;

        let definition = services
            .registry
            .measure(SALES_SCHEMA, measure)
            .ok_or_else(|| anyhow::anyhow!("measure '{}' missing from schema", measure))?;
        let mut schema = MeasureSchema::new(measure, format_kind(&definition.format))
            .with_label(definition.label)
            .with_variation()
            .with_participation();
        if measure == "cost" {
            schema = schema.inverted();
        }

        let data = MeasureData::new(summary.current)
            .with_previous(summary.previous)
            .with_total(summary.total);
        let card = measures.process(&data, &schema)?;
        info!(
            measure = %card.label,
            value = %card.formatted,
            variation = card.variation.as_ref().map(|v| v.formatted.as_str()).unwrap_or("-"),
            from_cache = result.from_cache,
            "kpi"
        );
        cards.push(card);
    }
    Ok(serde_json::to_value(cards)?)
}

fn register_handlers(services: &Services, measures: Arc<MeasureEngine>) {
    let bus = &services.bus;

    // Registrations live for the whole session
    let _guard = bus.use_middleware(GuardMiddleware::new("filter id missing", |action: &Action| {
        action.kind != "APPLY_FILTER" || action.payload["filter"].is_string()
    }));

    let handler_services = services.clone();
    let _apply = bus.on("APPLY_FILTER", move |action, _| {
        let services = handler_services.clone();
        async move {
            let filter = action.payload["filter"].as_str().unwrap_or_default().to_string();
            let value = action.payload["value"].clone();
            if !services.filters.apply_filter(&filter, value).await? {
                anyhow::bail!("filter '{}' rejected", filter);
            }
            Ok::<_, anyhow::Error>(json!({ "active": services.filters.get_active_filters() }))
        }
    });

    let handler_services = services.clone();
    let _clear = bus.on("CLEAR_FILTERS", move |_, _| {
        let services = handler_services.clone();
        async move {
            services.filters.reset_all().await?;
            Ok::<_, anyhow::Error>(json!({ "dirty": services.filters.is_dirty() }))
        }
    });

    let handler_services = services.clone();
    let _refresh = bus.on("REFRESH", move |_, token| {
        let services = handler_services.clone();
        let measures = measures.clone();
        async move {
            if token.is_cancelled() {
                anyhow::bail!("refresh cancelled");
            }
            refresh(&services, &measures).await
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting dashboard demo");

    let registry = Arc::new(SchemaRegistry::new());
    registry.register(demo::sales_schema()?)?;

    let config = DashboardConfig {
        actions: ActionBusConfig {
            log_dispatch: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let services = DashboardServices::new(
        Arc::new(DemoSalesSource::new()),
        registry,
        demo::filter_definitions(),
        config,
    );
    for (query_id, _) in KPIS {
        services.filters.register_query(query_id, SALES_SCHEMA, Vec::<String>::new());
    }
    // Network-wide figure, unaffected by the store filter
    services.filters.register_query("kpi_network", SALES_SCHEMA, ["loja"]);

    let measures = Arc::new(MeasureEngine::default());
    register_handlers(&services, measures.clone());

    let script = vec![
        Action::new("REFRESH"),
        Action::new("APPLY_FILTER")
            .with_payload(json!({ "filter": "loja", "value": "bdn" })),
        Action::new("REFRESH"),
        Action::new("REFRESH"),
        Action::new("APPLY_FILTER").with_payload(json!({ "filter": "canal", "value": "loja_fisica" })),
        Action::new("APPLY_FILTER").with_payload(json!({ "value": "cps" })),
        Action::new("CLEAR_FILTERS"),
        Action::new("REFRESH"),
    ];

    for (action, result) in script.iter().zip(services.bus.dispatch_sequence(script.clone()).await) {
        match (result.success, &result.error) {
            (true, _) => info!(action = %action.kind, "ok"),
            (false, Some(error)) => warn!(action = %action.kind, %error, "failed"),
            (false, None) => warn!(action = %action.kind, unhandled = result.unhandled, "no result"),
        }
    }

    let network = services
        .query_with_filters("kpi_network", SalesQuery::new("revenue"))
        .await?;
    info!(
        revenue = %measures.format_compact(Some(network.data.current)),
        "network revenue"
    );

    let stats = services.queries.get_cache_stats();
    info!(
        entries = stats.size,
        hits = stats.hits,
        misses = stats.misses,
        "query cache"
    );

    Ok(())
}
