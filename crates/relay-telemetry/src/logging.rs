//! Run-scoped persistence of warn+ logs.
//!
//! The fmt layer is the live log stream; this store exists so that after a
//! run has failed, its warnings can still be pulled up by `(user_id, run_id)`.
//! Engine code attaches `user_id`/`run_id` to its spans and a `reason` field
//! to failure events, and the layer lifts all three into columns.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// One persisted log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredLog {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object, if any.
    pub detail: Option<String>,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    /// Stable failure reason ("timeout", "cancelled", ...) when the event
    /// carried one.
    pub reason: Option<String>,
}

/// Filter for `RunLogStore::recent`. Empty filter returns the newest lines.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub level: Option<String>,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite-backed store for warn+ logs, indexed by run identity.
pub struct RunLogStore {
    conn: Mutex<Connection>,
}

impl RunLogStore {
    pub fn open(db_path: &Path) -> Result<Self, LogStoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS run_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 logged_at TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 detail TEXT,
                 user_id TEXT,
                 run_id TEXT,
                 reason TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_run_logs_identity ON run_logs(user_id, run_id);
             CREATE INDEX IF NOT EXISTS idx_run_logs_logged_at ON run_logs(logged_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, line: &LogLine) -> Result<(), LogStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO run_logs (logged_at, level, target, message, detail, user_id, run_id, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                line.logged_at,
                line.level,
                line.target,
                line.message,
                line.detail,
                line.user_id,
                line.run_id,
                line.reason,
            ],
        )?;
        Ok(())
    }

    /// Everything logged for one run, oldest first, so the result reads as
    /// the run's timeline.
    pub fn for_run(&self, user_id: &str, run_id: &str) -> Result<Vec<StoredLog>, LogStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, logged_at, level, target, message, detail, user_id, run_id, reason
             FROM run_logs WHERE user_id = ?1 AND run_id = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, run_id], Self::row_to_log)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Newest matching lines first, bounded by `filter.limit` (default 100).
    pub fn recent(&self, filter: &LogFilter) -> Result<Vec<StoredLog>, LogStoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<(&str, &dyn rusqlite::types::ToSql)> = Vec::new();

        if let Some(level) = &filter.level {
            clauses.push("level = :level");
            binds.push((":level", level));
        }
        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = :user_id");
            binds.push((":user_id", user_id));
        }
        if let Some(run_id) = &filter.run_id {
            clauses.push("run_id = :run_id");
            binds.push((":run_id", run_id));
        }
        if let Some(since) = &filter.since {
            clauses.push("logged_at >= :since");
            binds.push((":since", since));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, logged_at, level, target, message, detail, user_id, run_id, reason
             FROM run_logs{where_sql} ORDER BY id DESC LIMIT {}",
            filter.limit.unwrap_or(100)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&binds[..], Self::row_to_log)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn len(&self) -> Result<i64, LogStoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM run_logs", [], |row| row.get(0))
            .map_err(Into::into)
    }

    pub fn is_empty(&self) -> Result<bool, LogStoreError> {
        Ok(self.len()? == 0)
    }

    fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredLog> {
        Ok(StoredLog {
            id: row.get(0)?,
            logged_at: row.get(1)?,
            level: row.get(2)?,
            target: row.get(3)?,
            message: row.get(4)?,
            detail: row.get(5)?,
            user_id: row.get(6)?,
            run_id: row.get(7)?,
            reason: row.get(8)?,
        })
    }
}

struct LogLine {
    logged_at: String,
    level: String,
    target: String,
    message: String,
    detail: Option<String>,
    user_id: Option<String>,
    run_id: Option<String>,
    reason: Option<String>,
}

/// tracing layer feeding warn+ events into a `RunLogStore`.
pub struct RunLogLayer {
    store: Arc<RunLogStore>,
}

impl RunLogLayer {
    pub fn new(store: Arc<RunLogStore>) -> Self {
        Self { store }
    }
}

/// Collects every recorded field into one JSON object; known keys are pulled
/// out of the object afterwards.
#[derive(Default)]
struct JsonVisitor(serde_json::Map<String, serde_json::Value>);

impl JsonVisitor {
    fn take_str(&mut self, key: &str) -> Option<String> {
        self.0.remove(key).map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.0.insert(
            field.name().to_string(),
            serde_json::Value::String(rendered.trim_matches('"').to_string()),
        );
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.0
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Run identity lifted from span attributes, stored in span extensions so
/// child events inherit it.
struct RunScope {
    user_id: Option<String>,
    run_id: Option<String>,
}

impl<S> Layer<S> for RunLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut fields = JsonVisitor::default();
        event.record(&mut fields);

        let message = fields.take_str("message").unwrap_or_default();
        let reason = fields.take_str("reason");
        let mut user_id = fields.take_str("user_id");
        let mut run_id = fields.take_str("run_id");

        // Events inside an instrumented run inherit its identity.
        if user_id.is_none() || run_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(run_scope) = extensions.get::<RunScope>() {
                        if user_id.is_none() {
                            user_id.clone_from(&run_scope.user_id);
                        }
                        if run_id.is_none() {
                            run_id.clone_from(&run_scope.run_id);
                        }
                    }
                }
            }
        }

        let detail = if fields.0.is_empty() {
            None
        } else {
            serde_json::to_string(&fields.0).ok()
        };

        // A failed write must not take the subscriber down with it.
        let _ = self.store.write(&LogLine {
            logged_at: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message,
            detail,
            user_id,
            run_id,
            reason,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = JsonVisitor::default();
        attrs.record(&mut fields);

        let user_id = fields.take_str("user_id");
        let run_id = fields.take_str("run_id");
        if user_id.is_none() && run_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(RunScope { user_id, run_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_store() -> RunLogStore {
        let dir = std::env::temp_dir().join(format!("relay-run-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        RunLogStore::open(&dir.join("logs.db")).unwrap()
    }

    fn line(message: &str, user_id: Option<&str>, run_id: Option<&str>) -> LogLine {
        LogLine {
            logged_at: Utc::now().to_rfc3339(),
            level: "WARN".into(),
            target: "relay_engine::engine".into(),
            message: message.into(),
            detail: None,
            user_id: user_id.map(String::from),
            run_id: run_id.map(String::from),
            reason: None,
        }
    }

    #[test]
    fn run_timeline_is_scoped_and_ordered() {
        let store = temp_store();
        store.write(&line("first", Some("user_a"), Some("run_1"))).unwrap();
        store.write(&line("other run", Some("user_a"), Some("run_2"))).unwrap();
        store.write(&line("other user", Some("user_b"), Some("run_1"))).unwrap();
        store.write(&line("second", Some("user_a"), Some("run_1"))).unwrap();

        let timeline = store.for_run("user_a", "run_1").unwrap();
        let messages: Vec<&str> = timeline.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
    }

    #[test]
    fn recent_filters_by_level_and_user() {
        let store = temp_store();
        let mut error_line = line("model call exhausted retries", Some("user_a"), None);
        error_line.level = "ERROR".into();
        store.write(&error_line).unwrap();
        store.write(&line("slow run", Some("user_a"), None)).unwrap();
        store.write(&line("slow run", Some("user_b"), None)).unwrap();

        let errors = store
            .recent(&LogFilter {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "model call exhausted retries");

        let for_user = store
            .recent(&LogFilter {
                user_id: Some("user_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_user.len(), 2);
    }

    #[test]
    fn recent_is_newest_first_and_bounded() {
        let store = temp_store();
        for i in 0..8 {
            store.write(&line(&format!("warn {i}"), None, None)).unwrap();
        }

        let newest = store
            .recent(&LogFilter {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(newest.len(), 3);
        assert_eq!(newest[0].message, "warn 7");
        assert_eq!(store.len().unwrap(), 8);
    }

    #[test]
    fn recent_since_cuts_older_lines() {
        let store = temp_store();
        let mut old = line("old", None, None);
        old.logged_at = "2026-08-24T00:00:00+00:00".into();
        store.write(&old).unwrap();
        let mut new = line("new", None, None);
        new.logged_at = "2026-08-25T12:00:00+00:00".into();
        store.write(&new).unwrap();

        let results = store
            .recent(&LogFilter {
                since: Some("2026-08-25T00:00:00+00:00".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "new");
    }

    #[test]
    fn layer_persists_warn_events_with_run_identity() {
        let store = Arc::new(temp_store());
        let subscriber =
            tracing_subscriber::registry().with(RunLogLayer::new(Arc::clone(&store)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::warn_span!("run", user_id = "user_a", run_id = "run_1");
            let _guard = span.enter();
            tracing::warn!(reason = "timeout", "run failed");
            tracing::info!("below the persistence threshold");
        });

        let timeline = store.for_run("user_a", "run_1").unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message, "run failed");
        assert_eq!(timeline[0].reason.as_deref(), Some("timeout"));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn extra_event_fields_land_in_detail() {
        let store = Arc::new(temp_store());
        let subscriber =
            tracing_subscriber::registry().with(RunLogLayer::new(Arc::clone(&store)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(user_id = "user_a", tool = "search", attempt = 2u64, "tool timed out");
        });

        let logs = store
            .recent(&LogFilter {
                user_id: Some("user_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(logs.len(), 1);
        let detail: serde_json::Value =
            serde_json::from_str(logs[0].detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail["tool"], "search");
        assert_eq!(detail["attempt"], 2);
    }

    #[test]
    fn stored_log_serde_roundtrip() {
        let log = StoredLog {
            id: 7,
            logged_at: "2026-08-25T12:00:00+00:00".into(),
            level: "WARN".into(),
            target: "relay_engine".into(),
            message: "run failed".into(),
            detail: None,
            user_id: Some("user_a".into()),
            run_id: Some("run_1".into()),
            reason: Some("cancelled".into()),
        };
        let json = serde_json::to_string(&log).unwrap();
        let parsed: StoredLog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.reason.as_deref(), Some("cancelled"));
    }
}
