use crate::backoff::Backoff;
use crate::errors::{EngineError, EngineResult};
use crate::models::{ChangeNotification, EventKind, EventMask, RelationName, Row, WatchedRelation};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(Uuid);

impl ChannelHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote store's change notification channel. Delivery is best effort:
/// notifications may be dropped or duplicated. A subscription that dies must be
/// reported through [`FeedSink::close`].
pub trait ChangeChannel: Send + Sync {
    fn subscribe(&self, relation: &WatchedRelation, sink: FeedSink) -> EngineResult<ChannelHandle>;
    fn unsubscribe(&self, handle: ChannelHandle);
}

#[derive(Debug)]
pub(crate) enum FeedEvent {
    Change {
        token: u64,
        notification: ChangeNotification,
    },
    Closed {
        relation: RelationName,
        token: u64,
        error: EngineError,
    },
    RetryDue {
        relation: RelationName,
        token: u64,
    },
}

/// Where a channel subscription posts its notifications. Each sink is bound to
/// one connection attempt; events from a replaced attempt are ignored.
#[derive(Debug, Clone)]
pub struct FeedSink {
    relation: RelationName,
    token: u64,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedSink {
    pub(crate) fn new(relation: RelationName, token: u64, events: mpsc::UnboundedSender<FeedEvent>) -> Self {
        Self {
            relation,
            token,
            events,
        }
    }

    /// Returns `false` once the engine is gone.
    pub fn deliver(&self, kind: EventKind, payload: Option<Row>) -> bool {
        let notification = ChangeNotification {
            relation: self.relation.clone(),
            kind,
            payload,
            received_at: Utc::now(),
        };
        self.events
            .send(FeedEvent::Change {
                token: self.token,
                notification,
            })
            .is_ok()
    }

    pub fn close(&self, error: EngineError) {
        let _ = self.events.send(FeedEvent::Closed {
            relation: self.relation.clone(),
            token: self.token,
            error,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[derive(Debug)]
pub(crate) enum LinkEvent {
    Connected,
    Reconnected,
    RetryScheduled(Duration),
    Fatal(EngineError),
    Ignored,
}

struct FeedLink {
    watched: WatchedRelation,
    token: u64,
    handle: Option<ChannelHandle>,
    attempt: u32,
}

/// One upstream subscription per watched relation, reconnected with jittered
/// backoff after transport failures.
pub(crate) struct ChangeFeedClient {
    channel: Arc<dyn ChangeChannel>,
    backoff: Backoff,
    events: mpsc::UnboundedSender<FeedEvent>,
    next_token: u64,
    links: HashMap<RelationName, FeedLink>,
    suspended: bool,
}

impl ChangeFeedClient {
    pub fn new(
        channel: Arc<dyn ChangeChannel>,
        backoff: Backoff,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Self {
        Self {
            channel,
            backoff,
            events,
            next_token: 0,
            links: HashMap::new(),
            suspended: false,
        }
    }

    pub fn watch(&mut self, relation: &RelationName) -> LinkEvent {
        if self.links.contains_key(relation) {
            return LinkEvent::Ignored;
        }
        self.links.insert(
            relation.clone(),
            FeedLink {
                watched: WatchedRelation::new(relation.clone(), EventMask::ALL),
                token: 0,
                handle: None,
                attempt: 0,
            },
        );
        self.connect(relation)
    }

    pub fn unwatch(&mut self, relation: &RelationName) {
        if let Some(link) = self.links.remove(relation) {
            if let Some(handle) = link.handle {
                self.channel.unsubscribe(handle);
            }
            tracing::debug!(relation = %relation, "released change feed subscription");
        }
    }

    pub fn is_live(&self, relation: &RelationName, token: u64) -> bool {
        self.links
            .get(relation)
            .map(|link| link.token == token && link.handle.is_some())
            .unwrap_or(false)
    }

    pub fn on_closed(&mut self, relation: &RelationName, token: u64, error: EngineError) -> LinkEvent {
        let Some(link) = self.links.get_mut(relation) else {
            return LinkEvent::Ignored;
        };
        if link.token != token || link.handle.is_none() {
            return LinkEvent::Ignored;
        }
        link.handle = None;
        if error.is_fatal() {
            return LinkEvent::Fatal(error);
        }
        self.schedule_retry(relation, error)
    }

    pub fn on_retry_due(&mut self, relation: &RelationName, token: u64) -> LinkEvent {
        if self.suspended {
            return LinkEvent::Ignored;
        }
        match self.links.get(relation) {
            Some(link) if link.token == token && link.handle.is_none() => self.connect(relation),
            _ => LinkEvent::Ignored,
        }
    }

    /// Stops reconnecting; used while the session is expired.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Resumes after re-authentication and reconnects every dropped link.
    pub fn resume(&mut self) -> Vec<(RelationName, LinkEvent)> {
        if !self.suspended {
            return Vec::new();
        }
        self.suspended = false;
        let dropped = self
            .links
            .iter()
            .filter(|(_, link)| link.handle.is_none())
            .map(|(relation, _)| relation.clone())
            .collect::<Vec<_>>();
        dropped
            .into_iter()
            .map(|relation| {
                let event = self.connect(&relation);
                (relation, event)
            })
            .collect()
    }

    pub fn release_all(&mut self) {
        for (_, link) in self.links.drain() {
            if let Some(handle) = link.handle {
                self.channel.unsubscribe(handle);
            }
        }
    }

    fn connect(&mut self, relation: &RelationName) -> LinkEvent {
        self.next_token += 1;
        let token = self.next_token;
        let Some(link) = self.links.get_mut(relation) else {
            return LinkEvent::Ignored;
        };
        link.token = token;
        let sink = FeedSink::new(relation.clone(), token, self.events.clone());

        match self.channel.subscribe(&link.watched, sink) {
            Ok(handle) => {
                link.handle = Some(handle);
                let recovered = link.attempt > 0;
                link.attempt = 0;
                if recovered {
                    tracing::info!(relation = %relation, "change feed reconnected");
                    LinkEvent::Reconnected
                } else {
                    tracing::debug!(relation = %relation, handle = %handle, "change feed subscribed");
                    LinkEvent::Connected
                }
            }
            Err(error) if error.is_fatal() => LinkEvent::Fatal(error),
            Err(error) => self.schedule_retry(relation, error),
        }
    }

    fn schedule_retry(&mut self, relation: &RelationName, error: EngineError) -> LinkEvent {
        let Some(link) = self.links.get_mut(relation) else {
            return LinkEvent::Ignored;
        };
        let delay = self.backoff.delay(link.attempt);
        link.attempt = link.attempt.saturating_add(1);
        tracing::warn!(
            relation = %relation,
            attempt = link.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "change feed disconnected; retry scheduled"
        );

        let events = self.events.clone();
        let relation = relation.clone();
        let token = link.token;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(FeedEvent::RetryDue { relation, token });
        });
        LinkEvent::RetryScheduled(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeChannel, ChangeFeedClient, ChannelHandle, FeedEvent, FeedSink, LinkEvent};
    use crate::backoff::Backoff;
    use crate::errors::{EngineError, EngineResult};
    use crate::models::{EventKind, RelationName, WatchedRelation};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        offline: AtomicBool,
        sinks: Mutex<Vec<(ChannelHandle, FeedSink)>>,
        unsubscribed: Mutex<Vec<ChannelHandle>>,
    }

    impl ChangeChannel for RecordingChannel {
        fn subscribe(&self, _relation: &WatchedRelation, sink: FeedSink) -> EngineResult<ChannelHandle> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(EngineError::Transport("offline".to_string()));
            }
            let handle = ChannelHandle::new();
            self.sinks.lock().expect("sinks").push((handle, sink));
            Ok(handle)
        }

        fn unsubscribe(&self, handle: ChannelHandle) {
            self.unsubscribed.lock().expect("unsubscribed").push(handle);
        }
    }

    fn client(channel: Arc<RecordingChannel>) -> (ChangeFeedClient, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        (ChangeFeedClient::new(channel, backoff, tx), rx)
    }

    fn latest_sink(channel: &RecordingChannel) -> FeedSink {
        channel.sinks.lock().expect("sinks").last().expect("sink").1.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_reconnects_after_backoff() {
        let channel = Arc::new(RecordingChannel::default());
        let (mut feed, mut rx) = client(channel.clone());
        let billing = RelationName::new("billing").expect("relation");

        assert!(matches!(feed.watch(&billing), LinkEvent::Connected));
        let first = latest_sink(&channel);
        first.close(EngineError::Transport("socket reset".to_string()));

        let Some(FeedEvent::Closed { relation, token, error }) = rx.recv().await else {
            panic!("expected close");
        };
        assert!(matches!(feed.on_closed(&relation, token, error), LinkEvent::RetryScheduled(_)));

        let Some(FeedEvent::RetryDue { relation, token }) = rx.recv().await else {
            panic!("expected retry");
        };
        assert!(matches!(feed.on_retry_due(&relation, token), LinkEvent::Reconnected));

        let second = latest_sink(&channel);
        assert!(first.deliver(EventKind::Insert, None));
        let Some(FeedEvent::Change { token, notification }) = rx.recv().await else {
            panic!("expected change");
        };
        assert!(!feed.is_live(&notification.relation, token));
        assert!(second.deliver(EventKind::Insert, None));
        let Some(FeedEvent::Change { token, notification }) = rx.recv().await else {
            panic!("expected change");
        };
        assert!(feed.is_live(&notification.relation, token));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_backs_off_again() {
        let channel = Arc::new(RecordingChannel::default());
        let (mut feed, mut rx) = client(channel.clone());
        let logs = RelationName::new("system_logs").expect("relation");
        feed.watch(&logs);

        channel.offline.store(true, Ordering::SeqCst);
        latest_sink(&channel).close(EngineError::Transport("down".to_string()));
        let Some(FeedEvent::Closed { relation, token, error }) = rx.recv().await else {
            panic!("expected close");
        };
        feed.on_closed(&relation, token, error);

        let Some(FeedEvent::RetryDue { relation, token }) = rx.recv().await else {
            panic!("expected retry");
        };
        assert!(matches!(feed.on_retry_due(&relation, token), LinkEvent::RetryScheduled(_)));

        channel.offline.store(false, Ordering::SeqCst);
        let Some(FeedEvent::RetryDue { relation, token }) = rx.recv().await else {
            panic!("expected second retry");
        };
        assert!(matches!(feed.on_retry_due(&relation, token), LinkEvent::Reconnected));
    }

    #[tokio::test]
    async fn session_loss_on_channel_is_fatal() {
        let channel = Arc::new(RecordingChannel::default());
        let (mut feed, mut rx) = client(channel.clone());
        let logs = RelationName::new("system_logs").expect("relation");
        feed.watch(&logs);

        latest_sink(&channel).close(EngineError::SessionExpired("jwt expired".to_string()));
        let Some(FeedEvent::Closed { relation, token, error }) = rx.recv().await else {
            panic!("expected close");
        };
        assert!(matches!(feed.on_closed(&relation, token, error), LinkEvent::Fatal(_)));
    }

    #[tokio::test]
    async fn unwatch_releases_upstream_handle() {
        let channel = Arc::new(RecordingChannel::default());
        let (mut feed, _rx) = client(channel.clone());
        let logs = RelationName::new("system_logs").expect("relation");
        feed.watch(&logs);
        assert!(matches!(feed.watch(&logs), LinkEvent::Ignored));

        feed.unwatch(&logs);
        assert_eq!(channel.unsubscribed.lock().expect("unsubscribed").len(), 1);
        assert!(matches!(feed.watch(&logs), LinkEvent::Connected));
    }
}
