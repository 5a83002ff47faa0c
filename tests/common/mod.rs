#![allow(dead_code)]

use live_view_engine::{
    ChangeChannel, ChannelHandle, Collaborators, EngineConfig, EngineError, EngineResult, EventKind, FeedSink,
    LiveViewEngine, QueryFuture, QuerySpec, RemoteQuery, SessionContext, SessionProvider, StaticSession,
    ViewSnapshot, ViewState, WatchedRelation,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A fetch held open until the test answers it.
pub struct PendingFetch {
    pub spec: QuerySpec,
    responder: oneshot::Sender<EngineResult<Vec<Value>>>,
}

impl PendingFetch {
    pub fn respond(self, rows: Vec<Value>) {
        let _ = self.responder.send(Ok(rows));
    }

    pub fn fail(self, error: EngineError) {
        let _ = self.responder.send(Err(error));
    }
}

#[derive(Default)]
struct FakeState {
    tables: HashMap<String, Vec<Value>>,
    failing: HashMap<String, EngineError>,
    scripted: Option<mpsc::UnboundedSender<PendingFetch>>,
    fetches: Vec<QuerySpec>,
    sinks: HashMap<ChannelHandle, (WatchedRelation, FeedSink)>,
    subscribe_attempts: Vec<String>,
    offline: bool,
}

/// In-memory stand-in for the remote store. Queries answer from `tables`
/// unless the store is scripted, in which case each fetch is handed to the test.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted() -> (Self, mpsc::UnboundedReceiver<PendingFetch>) {
        let store = Self::new();
        let (tx, rx) = mpsc::unbounded_channel();
        store.state.lock().expect("state").scripted = Some(tx);
        (store, rx)
    }

    pub fn set_rows(&self, relation: &str, rows: Vec<Value>) {
        self.state.lock().expect("state").tables.insert(relation.to_string(), rows);
    }

    pub fn fail_queries(&self, relation: &str, error: EngineError) {
        self.state.lock().expect("state").failing.insert(relation.to_string(), error);
    }

    pub fn fetch_count(&self, relation: &str) -> usize {
        self.state
            .lock()
            .expect("state")
            .fetches
            .iter()
            .filter(|spec| spec.relation == relation)
            .count()
    }

    pub fn subscription_count(&self, relation: &str) -> usize {
        self.state
            .lock()
            .expect("state")
            .sinks
            .values()
            .filter(|(watched, _)| watched.relation.as_str() == relation)
            .count()
    }

    pub fn subscribe_attempts(&self, relation: &str) -> usize {
        self.state
            .lock()
            .expect("state")
            .subscribe_attempts
            .iter()
            .filter(|name| name.as_str() == relation)
            .count()
    }

    /// Delivers one notification to every live subscription on `relation`.
    pub fn emit(&self, relation: &str, kind: EventKind) {
        let sinks = self
            .state
            .lock()
            .expect("state")
            .sinks
            .values()
            .filter(|(watched, _)| watched.relation.as_str() == relation)
            .map(|(_, sink)| sink.clone())
            .collect::<Vec<_>>();
        for sink in sinks {
            sink.deliver(kind, None);
        }
    }

    /// Kills every subscription on `relation` with `error`.
    pub fn drop_connection(&self, relation: &str, error: EngineError) {
        let dropped = {
            let mut state = self.state.lock().expect("state");
            let handles = state
                .sinks
                .iter()
                .filter(|(_, (watched, _))| watched.relation.as_str() == relation)
                .map(|(handle, _)| *handle)
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .filter_map(|handle| state.sinks.remove(&handle))
                .collect::<Vec<_>>()
        };
        for (_, sink) in dropped {
            sink.close(error.clone());
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().expect("state").offline = offline;
    }
}

impl RemoteQuery for FakeStore {
    fn query(&self, spec: QuerySpec, _session: SessionContext) -> QueryFuture {
        let state = self.state.clone();
        Box::pin(async move {
            let response = {
                let mut state = state.lock().expect("state");
                state.fetches.push(spec.clone());
                if state.offline {
                    return Err(EngineError::Transport("fake store offline".to_string()));
                }
                if let Some(error) = state.failing.get(&spec.relation) {
                    return Err(error.clone());
                }
                let Some(script) = &state.scripted else {
                    return Ok(state.tables.get(&spec.relation).cloned().unwrap_or_default());
                };
                let (responder, response) = oneshot::channel();
                let _ = script.send(PendingFetch { spec, responder });
                response
            };
            response
                .await
                .unwrap_or_else(|_| Err(EngineError::Transport("fetch abandoned".to_string())))
        })
    }
}

impl ChangeChannel for FakeStore {
    fn subscribe(&self, relation: &WatchedRelation, sink: FeedSink) -> EngineResult<ChannelHandle> {
        let mut state = self.state.lock().expect("state");
        state.subscribe_attempts.push(relation.relation.to_string());
        if state.offline {
            return Err(EngineError::Transport("fake store offline".to_string()));
        }
        let handle = ChannelHandle::new();
        state.sinks.insert(handle, (relation.clone(), sink));
        Ok(handle)
    }

    fn unsubscribe(&self, handle: ChannelHandle) {
        self.state.lock().expect("state").sinks.remove(&handle);
    }
}

/// Collects every snapshot a view publishes.
#[derive(Clone, Default)]
pub struct Recorder {
    snapshots: Arc<Mutex<Vec<ViewSnapshot>>>,
}

impl Recorder {
    pub fn callback(&self) -> impl Fn(&ViewSnapshot) + Send + Sync + 'static {
        let snapshots = self.snapshots.clone();
        move |snapshot: &ViewSnapshot| snapshots.lock().expect("snapshots").push(snapshot.clone())
    }

    pub fn all(&self) -> Vec<ViewSnapshot> {
        self.snapshots.lock().expect("snapshots").clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().expect("snapshots").len()
    }

    pub fn last(&self) -> ViewSnapshot {
        self.snapshots
            .lock()
            .expect("snapshots")
            .last()
            .cloned()
            .expect("at least one snapshot")
    }

    pub fn count_in(&self, state: ViewState) -> usize {
        self.snapshots
            .lock()
            .expect("snapshots")
            .iter()
            .filter(|snapshot| snapshot.state == state)
            .count()
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
}

pub fn start_engine(store: &FakeStore, session: Arc<dyn SessionProvider>) -> LiveViewEngine {
    LiveViewEngine::start(
        test_config(),
        Collaborators {
            query: Arc::new(store.clone()),
            changes: Arc::new(store.clone()),
            session,
        },
    )
    .expect("engine starts")
}

pub fn signed_in() -> Arc<StaticSession> {
    Arc::new(StaticSession::signed_in("test-token"))
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Polls `check` until it holds, for tests on the real clock.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
