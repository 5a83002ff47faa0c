use crate::aggregate::ResultSource;
use crate::errors::EngineResult;
use crate::models::{EventMask, RelationName, Row, ViewId};
use crate::validation::RowValidator;
use crate::view::{ViewRegistration, ViewSubscription};
use std::collections::HashMap;

/// Reference counts of watched relations across live views.
#[derive(Debug, Default)]
pub struct RelationTable {
    counts: HashMap<RelationName, usize>,
}

impl RelationTable {
    /// Returns `true` for the first reference, when the relation must be watched.
    pub fn acquire(&mut self, relation: &RelationName) -> bool {
        let count = self.counts.entry(relation.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns `true` when the last reference goes away.
    pub fn release(&mut self, relation: &RelationName) -> bool {
        let Some(count) = self.counts.get_mut(relation) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(relation);
            return true;
        }
        false
    }

    pub fn count(&self, relation: &RelationName) -> usize {
        self.counts.get(relation).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Activation {
    pub views: Vec<ViewId>,
    /// Relations that gained their first watcher.
    pub acquired: Vec<RelationName>,
}

#[derive(Debug, Default)]
pub struct Deactivation {
    pub views: Vec<ViewId>,
    /// Relations that lost their last watcher.
    pub released: Vec<RelationName>,
}

/// Owns every live view and the shared relation table. Views are created on
/// activation and destroyed on deactivation; nothing else adds or removes them.
#[derive(Default)]
pub struct LifecycleController {
    views: HashMap<ViewId, ViewSubscription>,
    relations: RelationTable,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates every registration before creating any view.
    pub fn activate(&mut self, registrations: Vec<ViewRegistration>) -> EngineResult<Activation> {
        let mut prepared = Vec::with_capacity(registrations.len());
        for registration in registrations {
            registration.spec.query.validate()?;
            let watched = registration.spec.resolve_watch()?;
            let validator = RowValidator::new(registration.spec.query.row_schema.as_ref())?;
            prepared.push(ViewSubscription::new(
                ViewId::new(),
                registration.spec,
                watched,
                validator,
                registration.on_update,
            ));
        }

        let mut activation = Activation::default();
        for view in prepared {
            for watched in view.watched() {
                if self.relations.acquire(&watched.relation) {
                    activation.acquired.push(watched.relation.clone());
                }
            }
            tracing::debug!(view_id = %view.id(), view = view.name(), "view activated");
            activation.views.push(view.id());
            self.views.insert(view.id(), view);
        }
        Ok(activation)
    }

    /// Unknown or already destroyed ids are skipped.
    pub fn deactivate(&mut self, ids: &[ViewId]) -> Deactivation {
        let mut deactivation = Deactivation::default();
        for id in ids {
            let Some(mut view) = self.views.remove(id) else {
                continue;
            };
            view.destroy();
            for watched in view.watched() {
                if self.relations.release(&watched.relation) {
                    deactivation.released.push(watched.relation.clone());
                }
            }
            tracing::debug!(view_id = %id, view = view.name(), "view deactivated");
            deactivation.views.push(*id);
        }
        deactivation
    }

    pub fn view(&self, id: ViewId) -> Option<&ViewSubscription> {
        self.views.get(&id)
    }

    pub fn view_mut(&mut self, id: ViewId) -> Option<&mut ViewSubscription> {
        self.views.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ViewId> {
        self.views.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn relations(&self) -> &RelationTable {
        &self.relations
    }

    /// Views watching `relation` for at least one of `kinds`.
    pub fn views_watching(&self, relation: &RelationName, kinds: EventMask) -> Vec<ViewId> {
        self.views
            .values()
            .filter(|view| {
                view.watched()
                    .iter()
                    .any(|watched| &watched.relation == relation && watched.mask.intersects(kinds))
            })
            .map(ViewSubscription::id)
            .collect()
    }
}

impl ResultSource for LifecycleController {
    fn contains_view(&self, id: ViewId) -> bool {
        self.views.contains_key(&id)
    }

    fn accepted_result(&self, id: ViewId) -> Option<&[Row]> {
        self.views.get(&id).and_then(ViewSubscription::result)
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleController;
    use crate::models::{EventKind, EventMask, QuerySpec, RelationName, ViewSpec, WatchedRelation};
    use crate::view::ViewRegistration;
    use serde_json::json;

    fn registration(name: &str, relation: &str) -> ViewRegistration {
        ViewRegistration::new(ViewSpec::new(name, QuerySpec::new(relation)), |_| {})
    }

    #[test]
    fn shared_relation_is_acquired_once_and_released_last() {
        let mut lifecycle = LifecycleController::new();
        let logs = RelationName::new("system_logs").expect("relation");

        let first = lifecycle
            .activate(vec![registration("logs", "system_logs"), registration("anomalies", "system_logs")])
            .expect("activate");
        assert_eq!(first.acquired, vec![logs.clone()]);
        assert_eq!(lifecycle.relations().count(&logs), 2);

        let partial = lifecycle.deactivate(&first.views[..1]);
        assert!(partial.released.is_empty());
        assert_eq!(lifecycle.relations().count(&logs), 1);

        let rest = lifecycle.deactivate(&first.views);
        assert_eq!(rest.views.len(), 1);
        assert_eq!(rest.released, vec![logs]);
        assert!(lifecycle.relations().is_empty());
        assert!(lifecycle.is_empty());
    }

    #[test]
    fn invalid_registration_creates_nothing() {
        let mut lifecycle = LifecycleController::new();
        let bad = ViewRegistration::new(
            ViewSpec::new("bad", QuerySpec::new("billing").row_schema(json!({"type": 5}))),
            |_| {},
        );
        assert!(lifecycle
            .activate(vec![registration("logs", "system_logs"), bad])
            .is_err());
        assert!(lifecycle.is_empty());
        assert!(lifecycle.relations().is_empty());
    }

    #[test]
    fn views_are_selected_by_relation_and_mask() {
        let mut lifecycle = LifecycleController::new();
        let billing = RelationName::new("billing").expect("relation");
        let inserts_only = ViewRegistration::new(
            ViewSpec::new("new-invoices", QuerySpec::new("billing"))
                .watching(WatchedRelation::new(billing.clone(), EventKind::Insert.into())),
            |_| {},
        );
        let activation = lifecycle
            .activate(vec![inserts_only, registration("billing", "billing")])
            .expect("activate");

        assert_eq!(lifecycle.views_watching(&billing, EventKind::Delete.into()).len(), 1);
        assert_eq!(lifecycle.views_watching(&billing, EventMask::ALL).len(), 2);
        assert!(lifecycle
            .views_watching(&billing, EventKind::Insert.into())
            .contains(&activation.views[0]));
    }
}
