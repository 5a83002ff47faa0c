use crate::errors::{EngineError, EngineResult};
use crate::models::{Row, ViewId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Read access to the accepted results of live views.
pub trait ResultSource {
    fn contains_view(&self, id: ViewId) -> bool;
    /// `None` until the view has reached `Ready` at least once.
    fn accepted_result(&self, id: ViewId) -> Option<&[Row]>;
}

pub type AggregateCallback = Arc<dyn Fn(&str, Option<f64>) + Send + Sync>;

/// Pure function from the source results (in registration order) to a number.
#[derive(Clone)]
pub struct Reducer(Arc<dyn Fn(&[&[Row]]) -> f64 + Send + Sync>);

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reducer(..)")
    }
}

impl Reducer {
    pub fn new(reduce: impl Fn(&[&[Row]]) -> f64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(reduce))
    }

    /// Sums a numeric column across every source. Numeric strings count;
    /// nulls and non-numeric values are ignored.
    pub fn sum(column: &str) -> Self {
        let column = column.to_string();
        Self::new(move |sources| {
            sources
                .iter()
                .flat_map(|rows| rows.iter())
                .filter_map(|row| row.get(&column).and_then(numeric))
                .sum()
        })
    }

    pub fn count() -> Self {
        Self::new(|sources| sources.iter().map(|rows| rows.len()).sum::<usize>() as f64)
    }

    pub fn count_where(column: &str, expected: Value) -> Self {
        let column = column.to_string();
        Self::new(move |sources| {
            sources
                .iter()
                .flat_map(|rows| rows.iter())
                .filter(|row| row.get(&column) == Some(&expected))
                .count() as f64
        })
    }

    pub fn apply(&self, sources: &[&[Row]]) -> f64 {
        (self.0)(sources)
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

struct AggregateMetric {
    reducer: Reducer,
    sources: Vec<ViewId>,
    value: Option<f64>,
    dirty: bool,
    on_change: Option<AggregateCallback>,
}

impl AggregateMetric {
    /// Recomputes and clears `dirty` in one step. Returns whether the value moved.
    fn recompute(&mut self, views: &dyn ResultSource) -> bool {
        let mut inputs = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match views.accepted_result(*source) {
                Some(rows) => inputs.push(rows),
                None => break,
            }
        }
        let next = if inputs.len() == self.sources.len() {
            Some(self.reducer.apply(&inputs))
        } else {
            None
        };

        let changed = next != self.value;
        self.value = next;
        self.dirty = false;
        changed
    }
}

/// Cross-view metrics, recomputed synchronously when a source turns `Ready`.
#[derive(Default)]
pub struct AggregationEngine {
    metrics: BTreeMap<String, AggregateMetric>,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        reducer: Reducer,
        sources: Vec<ViewId>,
        on_change: Option<AggregateCallback>,
        views: &dyn ResultSource,
    ) -> EngineResult<()> {
        if name.trim().is_empty() {
            return Err(EngineError::Query("aggregate name cannot be empty".to_string()));
        }
        if sources.is_empty() {
            return Err(EngineError::Query(format!("aggregate '{}' has no sources", name)));
        }
        if let Some(missing) = sources.iter().find(|id| !views.contains_view(**id)) {
            return Err(EngineError::NotFound(format!(
                "aggregate '{}' references unknown view {}",
                name, missing
            )));
        }

        let mut metric = AggregateMetric {
            reducer,
            sources,
            value: None,
            dirty: true,
            on_change,
        };
        metric.recompute(views);
        if let Some(callback) = &metric.on_change {
            callback(name, metric.value);
        }
        tracing::debug!(metric = name, value = ?metric.value, "registered aggregate");
        self.metrics.insert(name.to_string(), metric);
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(|metric| metric.value)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.metrics.get(name).map(|metric| metric.dirty).unwrap_or(false)
    }

    pub fn on_view_ready(&mut self, view: ViewId, views: &dyn ResultSource) {
        for metric in self.metrics.values_mut() {
            if metric.sources.contains(&view) {
                metric.dirty = true;
            }
        }

        for (name, metric) in self.metrics.iter_mut().filter(|(_, metric)| metric.dirty) {
            if metric.recompute(views) {
                tracing::debug!(metric = %name, value = ?metric.value, "aggregate recomputed");
                if let Some(callback) = &metric.on_change {
                    callback(name, metric.value);
                }
            }
        }
    }

    /// Drops every metric fed by `view`; it can never become known again.
    pub fn forget_view(&mut self, view: ViewId) -> Vec<String> {
        let removed = self
            .metrics
            .iter()
            .filter(|(_, metric)| metric.sources.contains(&view))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in &removed {
            self.metrics.remove(name);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.metrics.clear();
    }
}
