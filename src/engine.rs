use crate::aggregate::{AggregateCallback, AggregationEngine, Reducer};
use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::debounce::Debouncer;
use crate::errors::{EngineError, EngineResult};
use crate::feed::{ChangeChannel, ChangeFeedClient, FeedEvent, LinkEvent};
use crate::fetch::{self, FetchCompletion, FetchScheduler, RemoteQuery, Settlement};
use crate::lifecycle::LifecycleController;
use crate::models::{EngineStats, EventMask, RelationName, ViewId, ViewSnapshot, ViewSpec};
use crate::session::SessionProvider;
use crate::view::ViewRegistration;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// External collaborators the engine consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub query: Arc<dyn RemoteQuery>,
    pub changes: Arc<dyn ChangeChannel>,
    pub session: Arc<dyn SessionProvider>,
}

enum Command {
    Activate {
        views: Vec<ViewRegistration>,
        reply: oneshot::Sender<EngineResult<Vec<ViewId>>>,
    },
    Deactivate {
        views: Vec<ViewId>,
        reply: oneshot::Sender<usize>,
    },
    Refresh {
        view: ViewId,
        reply: oneshot::Sender<EngineResult<u64>>,
    },
    Snapshot {
        view: ViewId,
        reply: oneshot::Sender<Option<ViewSnapshot>>,
    },
    RegisterAggregate {
        name: String,
        reducer: Reducer,
        sources: Vec<ViewId>,
        on_change: Option<AggregateCallback>,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ReadAggregate {
        name: String,
        reply: oneshot::Sender<Option<f64>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct DebounceElapsed {
    relation: RelationName,
    window: u64,
}

/// Handle to a running engine. Cheap to clone; the event loop stops on
/// [`LiveViewEngine::shutdown`] or when the last handle is dropped.
#[derive(Clone)]
pub struct LiveViewEngine {
    commands: mpsc::UnboundedSender<Command>,
}

impl LiveViewEngine {
    /// Spawns the event loop on the current tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> EngineResult<Self> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let core = EngineCore {
            session: collaborators.session,
            feed: ChangeFeedClient::new(
                collaborators.changes,
                Backoff::new(config.reconnect_base(), config.reconnect_cap()),
                feed_tx,
            ),
            debouncer: Debouncer::new(config.debounce_window()),
            fetcher: FetchScheduler::new(collaborators.query, config.fetch_timeout(), fetch_tx),
            lifecycle: LifecycleController::new(),
            aggregates: AggregationEngine::new(),
            timers: timer_tx,
            session_expired: false,
            stats: EngineStats::default(),
        };
        tokio::spawn(core.run_loop(command_rx, feed_rx, timer_rx, fetch_rx));
        tracing::info!(
            debounce_ms = config.debounce_ms,
            fetch_timeout_ms = config.fetch_timeout_ms,
            "live view engine started"
        );

        Ok(Self { commands: command_tx })
    }

    pub async fn subscribe_view(
        &self,
        spec: ViewSpec,
        on_update: impl Fn(&ViewSnapshot) + Send + Sync + 'static,
    ) -> EngineResult<ViewId> {
        let views = self.activate(vec![ViewRegistration::new(spec, on_update)]).await?;
        views
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Internal("activation returned no view".to_string()))
    }

    /// Returns `false` when the view was not live.
    pub async fn unsubscribe_view(&self, view: ViewId) -> EngineResult<bool> {
        Ok(self.deactivate(vec![view]).await? == 1)
    }

    /// Creates the views and starts their first fetch. All or nothing: one
    /// invalid spec rejects the whole batch.
    pub async fn activate(&self, views: Vec<ViewRegistration>) -> EngineResult<Vec<ViewId>> {
        self.request(|reply| Command::Activate { views, reply }).await?
    }

    /// Returns how many of `views` were live. No callback for them runs after
    /// this resolves.
    pub async fn deactivate(&self, views: Vec<ViewId>) -> EngineResult<usize> {
        self.request(|reply| Command::Deactivate { views, reply }).await
    }

    /// Re-issues the view's query now and returns the new generation.
    pub async fn refresh_view(&self, view: ViewId) -> EngineResult<u64> {
        self.request(|reply| Command::Refresh { view, reply }).await?
    }

    pub async fn snapshot(&self, view: ViewId) -> EngineResult<Option<ViewSnapshot>> {
        self.request(|reply| Command::Snapshot { view, reply }).await
    }

    pub async fn register_aggregate(
        &self,
        name: &str,
        reducer: Reducer,
        sources: Vec<ViewId>,
        on_change: Option<AggregateCallback>,
    ) -> EngineResult<()> {
        let name = name.to_string();
        self.request(|reply| Command::RegisterAggregate {
            name,
            reducer,
            sources,
            on_change,
            reply,
        })
        .await?
    }

    /// `None` until every source view has produced a result.
    pub async fn read_aggregate(&self, name: &str) -> EngineResult<Option<f64>> {
        let name = name.to_string();
        self.request(|reply| Command::ReadAggregate { name, reply }).await
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| EngineError::Internal("engine is not running".to_string()))?;
        response
            .await
            .map_err(|_| EngineError::Internal("engine stopped before replying".to_string()))
    }
}

struct EngineCore {
    session: Arc<dyn SessionProvider>,
    feed: ChangeFeedClient,
    debouncer: Debouncer,
    fetcher: FetchScheduler,
    lifecycle: LifecycleController,
    aggregates: AggregationEngine,
    timers: mpsc::UnboundedSender<DebounceElapsed>,
    session_expired: bool,
    stats: EngineStats,
}

impl EngineCore {
    async fn run_loop(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut feed_events: mpsc::UnboundedReceiver<FeedEvent>,
        mut timers: mpsc::UnboundedReceiver<DebounceElapsed>,
        mut completions: mpsc::UnboundedReceiver<FetchCompletion>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(event) = feed_events.recv() => self.handle_feed_event(event),
                Some(elapsed) = timers.recv() => self.handle_debounce(elapsed),
                Some(completion) = completions.recv() => self.handle_completion(completion),
            }
        }
        tracing::info!(
            fetches = self.stats.fetches_issued,
            discarded = self.stats.responses_discarded,
            "live view engine stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate { views, reply } => {
                let _ = reply.send(self.activate(views));
            }
            Command::Deactivate { views, reply } => {
                let _ = reply.send(self.deactivate(&views));
            }
            Command::Refresh { view, reply } => {
                let _ = reply.send(self.refresh(view, "manual"));
            }
            Command::Snapshot { view, reply } => {
                let _ = reply.send(self.lifecycle.view(view).map(|view| view.snapshot()));
            }
            Command::RegisterAggregate {
                name,
                reducer,
                sources,
                on_change,
                reply,
            } => {
                let _ = reply.send(self.aggregates.register(&name, reducer, sources, on_change, &self.lifecycle));
            }
            Command::ReadAggregate { name, reply } => {
                let _ = reply.send(self.aggregates.value(&name));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn activate(&mut self, views: Vec<ViewRegistration>) -> EngineResult<Vec<ViewId>> {
        self.session.context()?;
        if self.session_expired {
            self.session_expired = false;
            tracing::info!("session restored; resuming change feed");
            for (relation, event) in self.feed.resume() {
                self.handle_link_event(&relation, event);
            }
        }

        let activation = self.lifecycle.activate(views)?;
        for relation in &activation.acquired {
            let event = self.feed.watch(relation);
            self.handle_link_event(relation, event);
        }
        for id in &activation.views {
            if let Err(error) = self.refresh(*id, "activate") {
                tracing::warn!(view_id = %id, error = %error, "initial fetch not started");
            }
        }
        Ok(activation.views)
    }

    fn deactivate(&mut self, views: &[ViewId]) -> usize {
        let deactivation = self.lifecycle.deactivate(views);
        for relation in &deactivation.released {
            self.feed.unwatch(relation);
            self.debouncer.clear(relation);
        }
        for id in &deactivation.views {
            for metric in self.aggregates.forget_view(*id) {
                tracing::debug!(view_id = %id, metric = %metric, "dropped aggregate with deactivated source");
            }
        }
        deactivation.views.len()
    }

    fn refresh(&mut self, id: ViewId, reason: &'static str) -> EngineResult<u64> {
        if self.session_expired {
            return Err(EngineError::SessionExpired(
                "re-activate after signing in again".to_string(),
            ));
        }
        if self.lifecycle.view(id).is_none() {
            return Err(EngineError::NotFound(format!("no live view {}", id)));
        }

        let session = match self.session.context() {
            Ok(session) => session,
            Err(error) if error.is_fatal() => {
                self.expire_session(error.clone());
                return Err(error);
            }
            Err(error) => {
                if let Some(view) = self.lifecycle.view_mut(id) {
                    view.abandon(error.clone());
                    view.publish();
                }
                return Err(error);
            }
        };

        let Some(view) = self.lifecycle.view_mut(id) else {
            return Err(EngineError::NotFound(format!("no live view {}", id)));
        };
        let Some(generation) = view.begin_refresh() else {
            return Err(EngineError::NotFound(format!("view {} is destroyed", id)));
        };
        view.publish();
        self.fetcher.execute(view, session);
        self.stats.fetches_issued += 1;
        tracing::debug!(view_id = %id, generation, reason, "refresh started");
        Ok(generation)
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Change { token, notification } => {
                if !self.feed.is_live(&notification.relation, token) {
                    tracing::trace!(relation = %notification.relation, "ignoring notification from released subscription");
                    return;
                }
                self.stats.notifications_received += 1;
                if let Some(window) = self.debouncer.notify(&notification.relation, notification.kind) {
                    let timers = self.timers.clone();
                    let relation = notification.relation.clone();
                    let delay = self.debouncer.window();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = timers.send(DebounceElapsed { relation, window });
                    });
                }
            }
            FeedEvent::Closed { relation, token, error } => {
                let event = self.feed.on_closed(&relation, token, error);
                self.handle_link_event(&relation, event);
            }
            FeedEvent::RetryDue { relation, token } => {
                let event = self.feed.on_retry_due(&relation, token);
                self.handle_link_event(&relation, event);
            }
        }
    }

    fn handle_link_event(&mut self, relation: &RelationName, event: LinkEvent) {
        match event {
            LinkEvent::Reconnected => {
                self.stats.reconnects += 1;
                // Missed notifications cannot be replayed; refresh every dependent view once.
                self.debouncer.clear(relation);
                for id in self.lifecycle.views_watching(relation, EventMask::ALL) {
                    if let Err(error) = self.refresh(id, "reconnect") {
                        tracing::warn!(view_id = %id, error = %error, "recovery refresh not started");
                    }
                }
            }
            LinkEvent::Fatal(error) => self.expire_session(error),
            LinkEvent::RetryScheduled(delay) => {
                tracing::debug!(relation = %relation, delay_ms = delay.as_millis() as u64, "feed retry pending");
            }
            LinkEvent::Connected | LinkEvent::Ignored => {}
        }
    }

    fn handle_debounce(&mut self, elapsed: DebounceElapsed) {
        let Some(fired) = self.debouncer.fire(&elapsed.relation, elapsed.window) else {
            return;
        };
        self.stats.triggers_fired += 1;
        if self.session_expired {
            return;
        }

        let targets = self.lifecycle.views_watching(&elapsed.relation, fired.kinds);
        tracing::debug!(
            relation = %elapsed.relation,
            coalesced = fired.coalesced,
            views = targets.len(),
            "debounced change trigger"
        );
        for id in targets {
            if let Err(error) = self.refresh(id, "change") {
                tracing::warn!(view_id = %id, error = %error, "triggered refresh not started");
            }
        }
    }

    fn handle_completion(&mut self, completion: FetchCompletion) {
        let view_id = completion.view_id;
        match self.lifecycle.view(view_id) {
            None => {
                self.stats.responses_discarded += 1;
                tracing::debug!(view_id = %view_id, "dropping response for deactivated view");
                return;
            }
            Some(view) if !view.is_current(completion.generation) => {
                self.stats.responses_discarded += 1;
                tracing::debug!(
                    view_id = %view_id,
                    generation = completion.generation,
                    current = view.generation(),
                    "discarding superseded response"
                );
                return;
            }
            Some(_) => {}
        }

        // Only a current response may end the session.
        if let Err(error) = &completion.outcome {
            if error.is_fatal() {
                let error = error.clone();
                self.expire_session(error);
                return;
            }
        }

        let Some(view) = self.lifecycle.view_mut(view_id) else {
            return;
        };

        match fetch::settle(view, completion) {
            Settlement::Superseded => self.stats.responses_discarded += 1,
            Settlement::Failed => view.publish(),
            Settlement::Ready => {
                view.publish();
                self.aggregates.on_view_ready(view_id, &self.lifecycle);
            }
        }
    }

    fn expire_session(&mut self, error: EngineError) {
        if self.session_expired {
            return;
        }
        self.session_expired = true;
        self.feed.suspend();
        self.debouncer.clear_all();
        tracing::warn!(error = %error, views = self.lifecycle.len(), "session expired; failing all views");

        for id in self.lifecycle.ids() {
            if let Some(view) = self.lifecycle.view_mut(id) {
                view.abandon(error.clone());
                view.publish();
            }
        }
    }

    fn teardown(&mut self) {
        let ids = self.lifecycle.ids();
        self.lifecycle.deactivate(&ids);
        self.feed.release_all();
        self.debouncer.clear_all();
        self.aggregates.clear();
    }
}
