use crate::errors::EngineError;
use crate::models::{QuerySpec, Row, ViewId, ViewSnapshot, ViewSpec, ViewState, WatchedRelation};
use crate::validation::{RowBatch, RowValidator};
use std::sync::Arc;

pub type UpdateCallback = Arc<dyn Fn(&ViewSnapshot) + Send + Sync>;

/// A view to activate together with the callback that receives its snapshots.
#[derive(Clone)]
pub struct ViewRegistration {
    pub spec: ViewSpec,
    pub on_update: UpdateCallback,
}

impl ViewRegistration {
    pub fn new(spec: ViewSpec, on_update: impl Fn(&ViewSnapshot) + Send + Sync + 'static) -> Self {
        Self {
            spec,
            on_update: Arc::new(on_update),
        }
    }
}

/// One live view. Owned by the lifecycle controller; only fetch settlement and
/// trigger handling on the event loop mutate it.
pub struct ViewSubscription {
    id: ViewId,
    name: String,
    query: QuerySpec,
    watched: Vec<WatchedRelation>,
    validator: Arc<RowValidator>,
    generation: u64,
    state: ViewState,
    result: Option<Vec<Row>>,
    error: Option<EngineError>,
    warnings: Vec<String>,
    on_update: UpdateCallback,
}

impl ViewSubscription {
    pub fn new(
        id: ViewId,
        spec: ViewSpec,
        watched: Vec<WatchedRelation>,
        validator: RowValidator,
        on_update: UpdateCallback,
    ) -> Self {
        Self {
            id,
            name: spec.name,
            query: spec.query,
            watched,
            validator: Arc::new(validator),
            generation: 0,
            state: ViewState::Idle,
            result: None,
            error: None,
            warnings: Vec::new(),
            on_update,
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn validator(&self) -> Arc<RowValidator> {
        self.validator.clone()
    }

    pub fn watched(&self) -> &[WatchedRelation] {
        &self.watched
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Last accepted result; present once the view has reached `Ready`.
    pub fn result(&self) -> Option<&[Row]> {
        self.result.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ViewState::Destroyed
    }

    /// Starts a refresh and returns the generation the fetch must carry.
    /// Any fetch already in flight is superseded, not waited for.
    pub fn begin_refresh(&mut self) -> Option<u64> {
        if self.is_destroyed() {
            return None;
        }
        self.generation += 1;
        self.state = ViewState::Loading;
        Some(self.generation)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        !self.is_destroyed() && generation == self.generation
    }

    pub fn accept(&mut self, batch: RowBatch) {
        self.result = Some(batch.rows);
        self.warnings = batch.skipped;
        self.error = None;
        self.state = ViewState::Ready;
    }

    /// The previous result, if any, stays visible next to the error.
    pub fn reject(&mut self, error: EngineError) {
        self.error = Some(error);
        self.state = ViewState::Failed;
    }

    /// Fails the view outside a fetch and orphans whatever is in flight.
    pub fn abandon(&mut self, error: EngineError) {
        if self.is_destroyed() {
            return;
        }
        self.generation += 1;
        self.reject(error);
    }

    pub fn destroy(&mut self) {
        self.state = ViewState::Destroyed;
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            view_id: self.id,
            name: self.name.clone(),
            state: self.state,
            generation: self.generation,
            result: self.result.clone(),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub fn publish(&self) {
        if self.is_destroyed() {
            return;
        }
        (self.on_update)(&self.snapshot());
    }
}
