use anyhow::Context;
use live_view_engine::dashboard::{self, Dashboard};
use live_view_engine::{init_tracing, Collaborators, EngineConfig, LiveViewEngine, SqliteStore, StaticSession};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(Path::new(&path)).with_context(|| format!("loading {}", path))?,
        None => EngineConfig::default(),
    };
    init_tracing(&config.logging).context("initialising tracing")?;

    let store = SqliteStore::healthcare_demo().context("opening demo store")?;
    let engine = LiveViewEngine::start(
        config.clone(),
        Collaborators {
            query: Arc::new(store.clone()),
            changes: Arc::new(store.clone()),
            session: Arc::new(StaticSession::signed_in("demo-access-token")),
        },
    )?;

    let board = Dashboard::mount_with_metrics(
        &engine,
        |snapshot| {
            tracing::info!(
                view = %snapshot.name,
                state = snapshot.state.as_str(),
                generation = snapshot.generation,
                rows = snapshot.result.as_ref().map(Vec::len).unwrap_or(0),
                "panel updated"
            );
        },
        Some(Arc::new(|name: &str, value: Option<f64>| {
            tracing::info!(metric = name, value = ?value, "metric updated");
        })),
    )
    .await?;

    let quiet = config.debounce_window() + Duration::from_millis(250);
    tokio::time::sleep(quiet).await;

    store.execute(
        "INSERT INTO billing (id, patient_id, invoice_number, service_description, amount, status, due_date)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        &[
            json!("b-100"),
            json!("p-003"),
            json!("INV-5100"),
            json!("Cardiology consult"),
            json!(245.0),
            json!("2026-11-01"),
        ],
    )?;
    store.execute("UPDATE billing SET status = 'paid' WHERE id = ?1", &[json!("b-001")])?;
    store.execute(
        "INSERT INTO system_logs (id, level, source, message, ip_address, is_anomaly) VALUES (?1, 'critical', 'network', ?2, ?3, ?4)",
        &[json!("l-100"), json!("Unusual outbound volume"), json!("10.0.4.77"), json!(true)],
    )?;
    tokio::time::sleep(quiet).await;

    let metrics = board.metrics().await?;
    let billing = board.snapshot(dashboard::BILLING_PANEL).await?;
    board.unmount().await?;
    let stats = engine.stats().await?;
    engine.shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "metrics": metrics,
            "billingRows": billing.result.map(|rows| rows.len()),
            "stats": stats,
        }))?
    );
    Ok(())
}
