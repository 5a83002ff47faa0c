use crate::errors::{EngineError, EngineResult};
use crate::feed::{ChangeChannel, ChannelHandle, FeedSink};
use crate::fetch::{QueryFuture, RemoteQuery};
use crate::models::{EventKind, FilterOp, QuerySpec, Row, WatchedRelation};
use crate::session::SessionContext;
use rusqlite::hooks::Action;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const HEALTHCARE_SCHEMA: &str = include_str!("schema.sql");
pub const DEMO_SEED: &str = include_str!("seed.sql");

#[derive(Debug)]
struct Listener {
    watched: WatchedRelation,
    sink: FeedSink,
}

type Listeners = HashMap<ChannelHandle, Listener>;

/// Local SQLite database serving both the query surface and the change channel.
/// Mutations are reported through the SQLite update hook.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    listeners: Arc<Mutex<Listeners>>,
    online: Arc<AtomicBool>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// In-memory store with the dashboard relations and demo rows.
    pub fn healthcare_demo() -> EngineResult<Self> {
        let store = Self::open_in_memory()?;
        store.apply_schema(HEALTHCARE_SCHEMA)?;
        store.apply_schema(DEMO_SEED)?;
        Ok(store)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let listeners = Arc::new(Mutex::new(Listeners::new()));
        let online = Arc::new(AtomicBool::new(true));

        let hook_listeners = Arc::clone(&listeners);
        let hook_online = Arc::clone(&online);
        conn.update_hook(Some(move |action: Action, _db: &str, table: &str, rowid: i64| {
            let kind = match action {
                Action::SQLITE_INSERT => EventKind::Insert,
                Action::SQLITE_UPDATE => EventKind::Update,
                Action::SQLITE_DELETE => EventKind::Delete,
                _ => return,
            };
            // Offline stores lose notifications.
            if hook_online.load(Ordering::SeqCst) {
                dispatch(&hook_listeners, table, kind, rowid);
            }
        }));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            listeners,
            online,
        })
    }

    pub fn apply_schema(&self, sql: &str) -> EngineResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Runs one statement with JSON parameters. Booleans bind as integers.
    pub fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<usize> {
        let values = params.iter().map(sql_value).collect::<Vec<_>>();
        let conn = self.lock_conn()?;
        Ok(conn.execute(sql, params_from_iter(values.iter()))?)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Going offline closes every open subscription with a transport error.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online && !online {
            let dropped = match self.listeners.lock() {
                Ok(mut listeners) => listeners.drain().map(|(_, listener)| listener).collect::<Vec<_>>(),
                Err(_) => Vec::new(),
            };
            tracing::warn!(subscriptions = dropped.len(), "store went offline");
            for listener in dropped {
                listener
                    .sink
                    .close(EngineError::Transport("store went offline".to_string()));
            }
        } else if !was_online && online {
            tracing::info!("store back online");
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|listeners| listeners.len()).unwrap_or(0)
    }

    pub fn select(&self, spec: &QuerySpec) -> EngineResult<Vec<Value>> {
        let conn = self.lock_conn()?;
        let (sql, params) = build_select(&conn, spec)?;
        tracing::trace!(sql = %sql, "running view query");
        read_rows(&conn, &sql, &params, spec.join.as_ref().map(|join| join.alias.as_str()))
    }

    fn lock_conn(&self) -> EngineResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Internal("database mutex poisoned".to_string()))
    }
}

impl RemoteQuery for SqliteStore {
    fn query(&self, spec: QuerySpec, session: SessionContext) -> QueryFuture {
        let store = self.clone();
        Box::pin(async move {
            if session.access_token.trim().is_empty() {
                return Err(EngineError::SessionExpired("missing access token".to_string()));
            }
            if !store.is_online() {
                return Err(EngineError::Transport("store is offline".to_string()));
            }
            tokio::task::spawn_blocking(move || store.select(&spec))
                .await
                .map_err(|err| EngineError::Internal(format!("query task failed: {}", err)))?
        })
    }
}

impl ChangeChannel for SqliteStore {
    fn subscribe(&self, relation: &WatchedRelation, sink: FeedSink) -> EngineResult<ChannelHandle> {
        if !self.is_online() {
            return Err(EngineError::Transport("store is offline".to_string()));
        }
        let handle = ChannelHandle::new();
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| EngineError::Internal("listener mutex poisoned".to_string()))?;
        listeners.insert(
            handle,
            Listener {
                watched: relation.clone(),
                sink,
            },
        );
        Ok(handle)
    }

    fn unsubscribe(&self, handle: ChannelHandle) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&handle);
        }
    }
}

fn dispatch(listeners: &Mutex<Listeners>, table: &str, kind: EventKind, rowid: i64) {
    let Ok(mut listeners) = listeners.lock() else {
        return;
    };
    let mut payload = Row::new();
    payload.insert("rowid".to_string(), Value::from(rowid));
    listeners.retain(|_, listener| {
        if listener.sink.is_closed() {
            return false;
        }
        if listener.watched.relation.as_str() != table || !listener.watched.mask.contains(kind) {
            return true;
        }
        listener.sink.deliver(kind, Some(payload.clone()))
    });
}

fn build_select(conn: &Connection, spec: &QuerySpec) -> EngineResult<(String, Vec<SqlValue>)> {
    spec.validate()?;

    let mut projection = if spec.columns.is_empty() {
        vec!["base.*".to_string()]
    } else {
        spec.columns
            .iter()
            .map(|column| format!("base.\"{}\"", column))
            .collect::<Vec<_>>()
    };

    let mut join_clause = String::new();
    if let Some(join) = &spec.join {
        let columns = if join.columns.is_empty() {
            table_columns(conn, &join.relation)?
        } else {
            join.columns.clone()
        };
        // Joined columns come back as "alias.column" and are nested by read_rows.
        for column in &columns {
            projection.push(format!("joined.\"{}\" AS \"{}.{}\"", column, join.alias, column));
        }
        join_clause = format!(
            " LEFT JOIN \"{}\" AS joined ON base.\"{}\" = joined.\"{}\"",
            join.relation, join.local_column, join.foreign_column
        );
    }

    let mut sql = format!(
        "SELECT {} FROM \"{}\" AS base{}",
        projection.join(", "),
        spec.relation,
        join_clause
    );

    let mut params = Vec::new();
    let mut clauses = Vec::new();
    for filter in &spec.filters {
        let column = format!("base.\"{}\"", filter.column);
        let operator = match filter.op {
            FilterOp::IsNull => {
                clauses.push(format!("{} IS NULL", column));
                continue;
            }
            FilterOp::NotNull => {
                clauses.push(format!("{} IS NOT NULL", column));
                continue;
            }
            FilterOp::Eq => "=",
            FilterOp::Neq => "!=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        };
        params.push(sql_value(&filter.value));
        clauses.push(format!("{} {} ?{}", column, operator, params.len()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !spec.order.is_empty() {
        let order = spec
            .order
            .iter()
            .map(|order| {
                format!(
                    "base.\"{}\" {}",
                    order.column,
                    if order.descending { "DESC" } else { "ASC" }
                )
            })
            .collect::<Vec<_>>();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if let Some(limit) = spec.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok((sql, params))
}

fn table_columns(conn: &Connection, relation: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", relation))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(EngineError::Query(format!("unknown relation '{}'", relation)));
    }
    Ok(columns)
}

fn read_rows(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    join_alias: Option<&str>,
) -> EngineResult<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let names = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        let mut embedded = Row::new();
        for (index, name) in names.iter().enumerate() {
            let value = json_value(row.get_ref(index)?);
            match name.split_once('.') {
                Some((_, column)) => {
                    embedded.insert(column.to_string(), value);
                }
                None => {
                    record.insert(name.clone(), value);
                }
            }
        }
        if let Some(alias) = join_alias {
            let nested = if embedded.values().all(Value::is_null) {
                Value::Null
            } else {
                Value::Object(embedded)
            };
            record.insert(alias.to_string(), nested);
        }
        records.push(Value::Object(record));
    }
    Ok(records)
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => Number::from_f64(real).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}
