use crate::errors::{EngineError, EngineResult};
use crate::models::{QuerySpec, ViewId};
use crate::session::SessionContext;
use crate::validation::RowBatch;
use crate::view::ViewSubscription;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

pub type QueryFuture = Pin<Box<dyn Future<Output = EngineResult<Vec<Value>>> + Send>>;

/// The remote store's query surface. Implementations fail with `Transport`,
/// `Query` or `SessionExpired`; an empty relation is an empty `Vec`.
pub trait RemoteQuery: Send + Sync {
    fn query(&self, spec: QuerySpec, session: SessionContext) -> QueryFuture;
}

#[derive(Debug)]
pub(crate) struct FetchCompletion {
    pub view_id: ViewId,
    pub generation: u64,
    pub outcome: EngineResult<RowBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Superseded,
    Ready,
    Failed,
}

/// Runs view queries off the event loop and posts tagged completions back to it.
/// Nothing is retried or cancelled here; superseded responses are dropped when
/// they settle.
pub(crate) struct FetchScheduler {
    query: Arc<dyn RemoteQuery>,
    timeout: Duration,
    completions: mpsc::UnboundedSender<FetchCompletion>,
}

impl FetchScheduler {
    pub fn new(
        query: Arc<dyn RemoteQuery>,
        timeout: Duration,
        completions: mpsc::UnboundedSender<FetchCompletion>,
    ) -> Self {
        Self {
            query,
            timeout,
            completions,
        }
    }

    pub fn execute(&self, view: &ViewSubscription, session: SessionContext) {
        let view_id = view.id();
        let generation = view.generation();
        let spec = view.query().clone();
        let validator = view.validator();
        let query = self.query.clone();
        let completions = self.completions.clone();
        let timeout = self.timeout;

        tracing::debug!(view_id = %view_id, generation, relation = %spec.relation, "issuing fetch");
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, query.query(spec, session)).await {
                Ok(Ok(raw)) => Ok(validator.validate_batch(raw)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(EngineError::Transport(format!(
                    "fetch timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            let _ = completions.send(FetchCompletion {
                view_id,
                generation,
                outcome,
            });
        });
    }
}

/// Applies a completion only when its tag matches the view's current generation.
pub(crate) fn settle(view: &mut ViewSubscription, completion: FetchCompletion) -> Settlement {
    if !view.is_current(completion.generation) {
        tracing::debug!(
            view_id = %view.id(),
            generation = completion.generation,
            current = view.generation(),
            "discarding superseded response"
        );
        return Settlement::Superseded;
    }

    match completion.outcome {
        Ok(batch) => {
            view.accept(batch);
            Settlement::Ready
        }
        Err(error) => {
            tracing::warn!(view_id = %view.id(), error = %error, "view refresh failed");
            view.reject(error);
            Settlement::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{settle, FetchCompletion, FetchScheduler, QueryFuture, RemoteQuery, Settlement};
    use crate::errors::EngineError;
    use crate::models::{QuerySpec, ViewId, ViewSpec, ViewState};
    use crate::session::{SessionProvider, StaticSession};
    use crate::validation::{RowBatch, RowValidator};
    use crate::view::ViewSubscription;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    struct NeverResponds;

    impl RemoteQuery for NeverResponds {
        fn query(&self, _spec: QuerySpec, _session: crate::session::SessionContext) -> QueryFuture {
            Box::pin(std::future::pending::<crate::errors::EngineResult<Vec<Value>>>())
        }
    }

    struct Fixed(Vec<Value>);

    impl RemoteQuery for Fixed {
        fn query(&self, _spec: QuerySpec, _session: crate::session::SessionContext) -> QueryFuture {
            let rows = self.0.clone();
            Box::pin(async move { Ok(rows) })
        }
    }

    fn view() -> ViewSubscription {
        let spec = ViewSpec::new("logs", QuerySpec::new("system_logs"));
        let watched = spec.resolve_watch().expect("watch");
        ViewSubscription::new(ViewId::new(), spec, watched, RowValidator::permissive(), Arc::new(|_| {}))
    }

    fn rows(label: &str) -> RowBatch {
        RowBatch {
            rows: vec![json!({ "label": label }).as_object().expect("object").clone()],
            skipped: Vec::new(),
        }
    }

    #[test]
    fn late_response_from_older_generation_is_discarded() {
        let mut view = view();
        let first = view.begin_refresh().expect("first");
        let second = view.begin_refresh().expect("second");

        let newer = FetchCompletion {
            view_id: view.id(),
            generation: second,
            outcome: Ok(rows("b")),
        };
        assert_eq!(settle(&mut view, newer), Settlement::Ready);

        let older = FetchCompletion {
            view_id: view.id(),
            generation: first,
            outcome: Ok(rows("a")),
        };
        assert_eq!(settle(&mut view, older), Settlement::Superseded);
        assert_eq!(view.result().expect("result")[0]["label"], "b");
    }

    #[test]
    fn superseded_failure_does_not_touch_state() {
        let mut view = view();
        let first = view.begin_refresh().expect("first");
        view.begin_refresh();
        let completion = FetchCompletion {
            view_id: view.id(),
            generation: first,
            outcome: Err(EngineError::Transport("reset".to_string())),
        };
        assert_eq!(settle(&mut view, completion), Settlement::Superseded);
        assert_eq!(view.state(), ViewState::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_fetch_completes_as_transport_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = FetchScheduler::new(Arc::new(NeverResponds), Duration::from_secs(10), tx);
        let mut view = view();
        view.begin_refresh();
        let session = StaticSession::signed_in("token").context().expect("session");

        scheduler.execute(&view, session);
        let completion = rx.recv().await.expect("completion");
        assert_eq!(completion.generation, view.generation());
        match completion.outcome {
            Err(EngineError::Transport(message)) => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rows_are_validated_before_settlement() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = FetchScheduler::new(
            Arc::new(Fixed(vec![json!({"id": 1}), json!(42)])),
            Duration::from_secs(10),
            tx,
        );
        let mut view = view();
        view.begin_refresh();
        let session = StaticSession::signed_in("token").context().expect("session");

        scheduler.execute(&view, session);
        let completion = rx.recv().await.expect("completion");
        assert_eq!(settle(&mut view, completion), Settlement::Ready);
        assert_eq!(view.result().expect("rows").len(), 1);
        assert_eq!(view.snapshot().warnings.len(), 1);
    }
}
