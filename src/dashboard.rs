use crate::aggregate::{AggregateCallback, Reducer};
use crate::engine::LiveViewEngine;
use crate::errors::{EngineError, EngineResult};
use crate::models::{JoinSpec, QuerySpec, ViewId, ViewSnapshot, ViewSpec};
use crate::view::{UpdateCallback, ViewRegistration};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PATIENTS_PANEL: &str = "patients";
pub const SYSTEM_LOGS_PANEL: &str = "system_logs";
pub const NETWORK_EVENTS_PANEL: &str = "network_events";
pub const BILLING_PANEL: &str = "billing";

const PATIENT_COUNT: &str = "stats_patients";
const PENDING_BILLING: &str = "stats_pending_billing";
const OVERDUE_BILLING: &str = "stats_overdue_billing";
const ANOMALIES: &str = "stats_anomalies";
const NETWORK_COUNT: &str = "stats_network_events";

pub const ACTIVE_PATIENTS: &str = "active_patients";
pub const PENDING_BILLING_TOTAL: &str = "pending_billing";
pub const SECURITY_ANOMALIES: &str = "security_anomalies";
pub const NETWORK_EVENT_COUNT: &str = "network_events";
pub const OUTSTANDING_BILLING: &str = "outstanding_billing";

/// Every view the dashboard mounts: the four panels followed by the stats views
/// that feed its aggregates.
pub fn catalog() -> Vec<ViewSpec> {
    vec![
        ViewSpec::new(
            PATIENTS_PANEL,
            QuerySpec::new("patients").order_by("admission_date", true).limit(10),
        ),
        ViewSpec::new(
            SYSTEM_LOGS_PANEL,
            QuerySpec::new("system_logs").order_by("timestamp", true).limit(20),
        ),
        ViewSpec::new(
            NETWORK_EVENTS_PANEL,
            QuerySpec::new("network_events").order_by("timestamp", true).limit(20),
        ),
        ViewSpec::new(BILLING_PANEL, billing_panel_query()),
        ViewSpec::new(PATIENT_COUNT, QuerySpec::new("patients").select(&["id"])),
        ViewSpec::new(
            PENDING_BILLING,
            QuerySpec::new("billing").select(&["amount"]).eq("status", json!("pending")),
        ),
        ViewSpec::new(
            OVERDUE_BILLING,
            QuerySpec::new("billing").select(&["amount"]).eq("status", json!("overdue")),
        ),
        ViewSpec::new(
            ANOMALIES,
            QuerySpec::new("system_logs").select(&["id"]).eq("is_anomaly", json!(true)),
        ),
        ViewSpec::new(NETWORK_COUNT, QuerySpec::new("network_events").select(&["id"])),
    ]
}

fn billing_panel_query() -> QuerySpec {
    QuerySpec::new("billing")
        .select(&["id", "invoice_number", "service_description", "amount", "status", "billing_date", "due_date"])
        .order_by("billing_date", true)
        .limit(15)
        .join(JoinSpec {
            relation: "patients".to_string(),
            local_column: "patient_id".to_string(),
            foreign_column: "id".to_string(),
            alias: "patients".to_string(),
            columns: vec!["full_name".to_string(), "patient_id".to_string()],
        })
        .row_schema(json!({
            "type": "object",
            "required": ["id", "invoice_number", "amount", "status"],
            "properties": {
                "amount": { "type": "number" },
                "status": { "enum": ["pending", "paid", "overdue", "cancelled"] }
            }
        }))
}

/// Aggregate name, reducer and source view names.
pub fn metrics() -> Vec<(&'static str, Reducer, Vec<&'static str>)> {
    vec![
        (ACTIVE_PATIENTS, Reducer::count(), vec![PATIENT_COUNT]),
        (PENDING_BILLING_TOTAL, Reducer::sum("amount"), vec![PENDING_BILLING]),
        (SECURITY_ANOMALIES, Reducer::count(), vec![ANOMALIES]),
        (NETWORK_EVENT_COUNT, Reducer::count(), vec![NETWORK_COUNT]),
        (OUTSTANDING_BILLING, Reducer::sum("amount"), vec![PENDING_BILLING, OVERDUE_BILLING]),
    ]
}

/// A mounted dashboard: its views are live until [`Dashboard::unmount`].
pub struct Dashboard {
    engine: LiveViewEngine,
    views: BTreeMap<String, ViewId>,
}

impl Dashboard {
    pub async fn mount(
        engine: &LiveViewEngine,
        on_update: impl Fn(&ViewSnapshot) + Send + Sync + 'static,
    ) -> EngineResult<Self> {
        Self::mount_with_metrics(engine, on_update, None).await
    }

    pub async fn mount_with_metrics(
        engine: &LiveViewEngine,
        on_update: impl Fn(&ViewSnapshot) + Send + Sync + 'static,
        on_metric: Option<AggregateCallback>,
    ) -> EngineResult<Self> {
        let on_update: UpdateCallback = Arc::new(on_update);
        let specs = catalog();
        let names = specs.iter().map(|spec| spec.name.clone()).collect::<Vec<_>>();
        let registrations = specs
            .into_iter()
            .map(|spec| ViewRegistration {
                spec,
                on_update: on_update.clone(),
            })
            .collect();

        let ids = engine.activate(registrations).await?;
        let dashboard = Self {
            engine: engine.clone(),
            views: names.into_iter().zip(ids).collect(),
        };

        for (name, reducer, sources) in metrics() {
            let sources = sources
                .iter()
                .filter_map(|source| dashboard.view_id(source))
                .collect::<Vec<_>>();
            if let Err(error) = engine
                .register_aggregate(name, reducer, sources, on_metric.clone())
                .await
            {
                dashboard.unmount().await?;
                return Err(error);
            }
        }

        tracing::info!(views = dashboard.views.len(), "dashboard mounted");
        Ok(dashboard)
    }

    pub fn view_id(&self, name: &str) -> Option<ViewId> {
        self.views.get(name).copied()
    }

    pub async fn snapshot(&self, name: &str) -> EngineResult<ViewSnapshot> {
        let id = self
            .view_id(name)
            .ok_or_else(|| EngineError::NotFound(format!("no dashboard view '{}'", name)))?;
        self.engine
            .snapshot(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("dashboard view '{}' is not live", name)))
    }

    pub async fn metric(&self, name: &str) -> EngineResult<Option<f64>> {
        self.engine.read_aggregate(name).await
    }

    pub async fn metrics(&self) -> EngineResult<BTreeMap<&'static str, Option<f64>>> {
        let mut values = BTreeMap::new();
        for (name, _, _) in metrics() {
            values.insert(name, self.engine.read_aggregate(name).await?);
        }
        Ok(values)
    }

    /// Deactivates every dashboard view; their aggregates go with them.
    pub async fn unmount(self) -> EngineResult<usize> {
        let ids = self.views.values().copied().collect();
        let released = self.engine.deactivate(ids).await?;
        tracing::info!(views = released, "dashboard unmounted");
        Ok(released)
    }
}
