use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// An opaque record returned by the remote store.
pub type Row = serde_json::Map<String, Value>;

pub fn validate_identifier(kind: &str, value: &str) -> EngineResult<()> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(EngineError::Query(format!("invalid {} name '{}'", kind, value)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(Uuid);

impl ViewId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ViewId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelationName(String);

impl RelationName {
    pub fn new(name: &str) -> EngineResult<Self> {
        validate_identifier("relation", name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RelationName {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_identifier("relation", &value)?;
        Ok(Self(value))
    }
}

impl From<RelationName> for String {
    fn from(value: RelationName) -> Self {
        value.0
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Insert => 0b001,
            Self::Update => 0b010,
            Self::Delete => 0b100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<EventKind>", into = "Vec<EventKind>")]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b111);

    pub fn of(kinds: &[EventKind]) -> Self {
        Self(kinds.iter().fold(0, |bits, kind| bits | kind.bit()))
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<EventKind> for EventMask {
    fn from(value: EventKind) -> Self {
        Self(value.bit())
    }
}

impl From<Vec<EventKind>> for EventMask {
    fn from(value: Vec<EventKind>) -> Self {
        Self::of(&value)
    }
}

impl From<EventMask> for Vec<EventKind> {
    fn from(value: EventMask) -> Self {
        [EventKind::Insert, EventKind::Update, EventKind::Delete]
            .into_iter()
            .filter(|kind| value.contains(*kind))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedRelation {
    pub relation: RelationName,
    pub mask: EventMask,
}

impl WatchedRelation {
    pub fn new(relation: RelationName, mask: EventMask) -> Self {
        Self { relation, mask }
    }

    pub fn all(relation: RelationName) -> Self {
        Self::new(relation, EventMask::ALL)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub relation: RelationName,
    pub kind: EventKind,
    pub payload: Option<Row>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    NotNull,
}

impl FilterOp {
    pub fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::NotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// Embeds one row of `relation` under `alias`, matched on
/// `local_column = relation.foreign_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSpec {
    pub relation: String,
    pub local_column: String,
    pub foreign_column: String,
    pub alias: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Query definition handed to the remote store. The engine never interprets it
/// beyond identifier validation and deriving the default watch list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub relation: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub join: Option<JoinSpec>,
    #[serde(default)]
    pub row_schema: Option<Value>,
}

impl QuerySpec {
    pub fn new(relation: &str) -> Self {
        Self {
            relation: relation.to_string(),
            columns: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            join: None,
            row_schema: None,
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(ToString::to_string).collect();
        self
    }

    pub fn filter(mut self, column: &str, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, column: &str, value: Value) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order.push(OrderBy {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.join = Some(join);
        self
    }

    pub fn row_schema(mut self, schema: Value) -> Self {
        self.row_schema = Some(schema);
        self
    }

    pub fn relation_name(&self) -> EngineResult<RelationName> {
        RelationName::new(&self.relation)
    }

    pub fn validate(&self) -> EngineResult<()> {
        validate_identifier("relation", &self.relation)?;
        for column in &self.columns {
            validate_identifier("column", column)?;
        }
        for filter in &self.filters {
            validate_identifier("column", &filter.column)?;
            if filter.op.takes_value() && matches!(filter.value, Value::Array(_) | Value::Object(_)) {
                return Err(EngineError::Query(format!(
                    "filter on '{}' must compare against a scalar",
                    filter.column
                )));
            }
        }
        for order in &self.order {
            validate_identifier("column", &order.column)?;
        }
        if let Some(join) = &self.join {
            validate_identifier("relation", &join.relation)?;
            validate_identifier("column", &join.local_column)?;
            validate_identifier("column", &join.foreign_column)?;
            validate_identifier("alias", &join.alias)?;
            for column in &join.columns {
                validate_identifier("column", column)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSpec {
    pub name: String,
    pub query: QuerySpec,
    #[serde(default)]
    pub watch: Vec<WatchedRelation>,
}

impl ViewSpec {
    pub fn new(name: &str, query: QuerySpec) -> Self {
        Self {
            name: name.to_string(),
            query,
            watch: Vec::new(),
        }
    }

    pub fn watching(mut self, relation: WatchedRelation) -> Self {
        self.watch.push(relation);
        self
    }

    /// Relations this view depends on, one entry per relation with masks merged.
    /// Without an explicit list the query relation and its join are watched.
    pub fn resolve_watch(&self) -> EngineResult<Vec<WatchedRelation>> {
        let requested = if self.watch.is_empty() {
            let mut defaults = vec![WatchedRelation::all(self.query.relation_name()?)];
            if let Some(join) = &self.query.join {
                defaults.push(WatchedRelation::all(RelationName::new(&join.relation)?));
            }
            defaults
        } else {
            self.watch.clone()
        };

        let mut resolved: Vec<WatchedRelation> = Vec::with_capacity(requested.len());
        for watched in requested {
            if watched.mask.is_empty() {
                return Err(EngineError::Query(format!(
                    "view '{}' watches '{}' with an empty event mask",
                    self.name, watched.relation
                )));
            }
            match resolved.iter_mut().find(|entry| entry.relation == watched.relation) {
                Some(entry) => entry.mask = entry.mask.union(watched.mask),
                None => resolved.push(watched),
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewState {
    Idle,
    Loading,
    Ready,
    Failed,
    Destroyed,
}

impl ViewState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }
}

/// What a panel sees on every state change of its view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub view_id: ViewId,
    pub name: String,
    pub state: ViewState,
    pub generation: u64,
    pub result: Option<Vec<Row>>,
    pub error: Option<EngineError>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub notifications_received: u64,
    pub triggers_fired: u64,
    pub fetches_issued: u64,
    pub responses_discarded: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::{EventKind, EventMask, FilterOp, JoinSpec, QuerySpec, RelationName, ViewSpec, WatchedRelation};
    use serde_json::json;

    #[test]
    fn rejects_unsafe_relation_names() {
        assert!(RelationName::new("system_logs").is_ok());
        assert!(RelationName::new("logs; drop table x").is_err());
        assert!(RelationName::new("1logs").is_err());
        assert!(serde_json::from_value::<RelationName>(json!("bad name")).is_err());
    }

    #[test]
    fn event_mask_round_trips_through_kind_list() {
        let mask = EventMask::of(&[EventKind::Insert, EventKind::Delete]);
        assert!(mask.contains(EventKind::Insert));
        assert!(!mask.contains(EventKind::Update));
        let value = serde_json::to_value(mask).expect("serialize mask");
        assert_eq!(value, json!(["insert", "delete"]));
        assert!(EventMask::ALL.intersects(mask));
        assert!(!EventMask::NONE.intersects(mask));
    }

    #[test]
    fn default_watch_covers_query_and_join_relations() {
        let spec = ViewSpec::new(
            "billing",
            QuerySpec::new("billing").join(JoinSpec {
                relation: "patients".to_string(),
                local_column: "patient_id".to_string(),
                foreign_column: "id".to_string(),
                alias: "patients".to_string(),
                columns: vec!["full_name".to_string()],
            }),
        );
        let watched = spec.resolve_watch().expect("resolve");
        let names = watched.iter().map(|entry| entry.relation.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["billing", "patients"]);
    }

    #[test]
    fn duplicate_watch_entries_merge_masks() {
        let billing = RelationName::new("billing").expect("name");
        let spec = ViewSpec::new("billing", QuerySpec::new("billing"))
            .watching(WatchedRelation::new(billing.clone(), EventKind::Insert.into()))
            .watching(WatchedRelation::new(billing, EventKind::Delete.into()));
        let watched = spec.resolve_watch().expect("resolve");
        assert_eq!(watched.len(), 1);
        assert!(watched[0].mask.contains(EventKind::Delete));
        assert!(watched[0].mask.contains(EventKind::Insert));
    }

    #[test]
    fn query_validation_rejects_injection_and_compound_values() {
        let bad_column = QuerySpec::new("billing").order_by("amount desc; --", true);
        assert!(bad_column.validate().is_err());

        let bad_value = QuerySpec::new("billing").filter("status", FilterOp::Eq, json!(["a"]));
        assert!(bad_value.validate().is_err());

        let ok = QuerySpec::new("billing")
            .eq("status", json!("pending"))
            .filter("paid_date", FilterOp::IsNull, json!(null))
            .limit(15);
        assert!(ok.validate().is_ok());
    }
}
