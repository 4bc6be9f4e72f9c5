//! Warn and error events kept in a SQLite file shared by every process of a
//! deployment. A worker that was killed and reforked leaves its last
//! complaints behind here, tagged with its pid.

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA busy_timeout = 5000;
    CREATE TABLE IF NOT EXISTS incidents (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        at            TEXT NOT NULL,
        level         TEXT NOT NULL,
        target        TEXT NOT NULL,
        message       TEXT NOT NULL,
        fields        TEXT,
        pid           INTEGER NOT NULL,
        connection_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_pid ON incidents(pid, seq);
";

/// Upper bound on rows returned by one read.
pub const MAX_INCIDENTS: u32 = 500;

/// One persisted warn/error event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Incident {
    pub seq: i64,
    /// RFC 3339, UTC.
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<serde_json::Value>,
    pub pid: u32,
    pub connection_id: Option<String>,
}

/// Which incidents to read back. Every field narrows the result.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IncidentFilter {
    pub pid: Option<u32>,
    pub connection_id: Option<String>,
    /// `ERROR` keeps errors only; `WARN` or absent keeps both.
    pub level: Option<String>,
    pub limit: Option<u32>,
}

impl IncidentFilter {
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Default::default()
        }
    }

    fn errors_only(&self) -> bool {
        self.level
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case("error"))
    }

    fn limit(&self) -> u32 {
        self.limit.unwrap_or(50).min(MAX_INCIDENTS)
    }
}

struct NewIncident {
    level: Level,
    target: String,
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
    connection_id: Option<String>,
}

pub struct IncidentLog {
    conn: Mutex<Connection>,
}

impl IncidentLog {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::prepare(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, incident: NewIncident) -> Result<(), rusqlite::Error> {
        let fields = if incident.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&incident.fields).ok()
        };
        self.conn.lock().execute(
            "INSERT INTO incidents (at, level, target, message, fields, pid, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                incident.level.as_str(),
                incident.target,
                incident.message,
                fields,
                std::process::id(),
                incident.connection_id,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT seq, at, level, target, message, fields, pid, connection_id
             FROM incidents
             WHERE (?1 IS NULL OR pid = ?1)
               AND (?2 IS NULL OR connection_id = ?2)
               AND (?3 = 0 OR level = 'ERROR')
             ORDER BY seq DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                filter.pid,
                filter.connection_id,
                filter.errors_only(),
                filter.limit()
            ],
            |row| {
                let fields: Option<String> = row.get(5)?;
                Ok(Incident {
                    seq: row.get(0)?,
                    at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
                    pid: row.get(6)?,
                    connection_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    /// Time of the newest incident recorded by `pid`, if any.
    pub fn last_seen(&self, pid: u32) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .lock()
            .query_row(
                "SELECT at FROM incidents WHERE pid = ?1 ORDER BY seq DESC LIMIT 1",
                [pid],
                |row| row.get(0),
            )
            .optional()
    }
}

/// Layer feeding WARN and ERROR events into an [`IncidentLog`].
pub struct IncidentLayer {
    log: Arc<IncidentLog>,
}

impl IncidentLayer {
    pub fn new(log: Arc<IncidentLog>) -> Self {
        Self { log }
    }
}

/// Set on spans created with a `connection_id` field.
struct ConnectionTag(String);

#[derive(Default)]
struct Collect {
    message: Option<String>,
    connection_id: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Collect {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        match (field.name(), value) {
            ("message", serde_json::Value::String(s)) => self.message = Some(s),
            ("connection_id", serde_json::Value::String(s)) => self.connection_id = Some(s),
            (name, value) => {
                self.fields.insert(name.to_owned(), value);
            }
        }
    }
}

impl Visit for Collect {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collect = Collect::default();
        attrs.record(&mut collect);
        if let (Some(conn), Some(span)) = (collect.connection_id, ctx.span(id)) {
            span.extensions_mut().insert(ConnectionTag(conn));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collect = Collect::default();
        event.record(&mut collect);

        let connection_id = collect.connection_id.or_else(|| {
            ctx.event_scope(event)?.find_map(|span| {
                let extensions = span.extensions();
                let tag = extensions.get::<ConnectionTag>().map(|tag| tag.0.clone());
                tag
            })
        });

        // Never log from inside the subscriber.
        let _ = self.log.append(NewIncident {
            level,
            target: event.metadata().target().to_owned(),
            message: collect.message.unwrap_or_default(),
            fields: collect.fields,
            connection_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Arc<IncidentLog> {
        let log = Arc::new(IncidentLog::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(IncidentLayer::new(log.clone()));
        tracing::subscriber::with_default(subscriber, f);
        log
    }

    #[test]
    fn only_warn_and_error_are_kept() {
        let log = capture(|| {
            tracing::debug!("noise");
            tracing::info!("new client connected");
            tracing::warn!(slot = 2u64, "worker died");
            tracing::error!("listener error");
        });

        let all = log.recent(&IncidentFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "listener error");
        assert_eq!(all[0].level, "ERROR");
        assert_eq!(all[1].message, "worker died");
        assert_eq!(all[1].fields, Some(serde_json::json!({"slot": 2})));
        assert_eq!(all[1].pid, std::process::id());
    }

    #[test]
    fn connection_id_comes_from_enclosing_span() {
        let log = capture(|| {
            let span = tracing::info_span!("handle_frame", connection_id = "conn_abc");
            let _guard = span.enter();
            tracing::error!("message save failed");
        });

        let found = log
            .recent(&IncidentFilter {
                connection_id: Some("conn_abc".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].connection_id.as_deref(), Some("conn_abc"));
    }

    #[test]
    fn event_field_wins_over_span() {
        let log = capture(|| {
            let span = tracing::info_span!("outer", connection_id = "conn_outer");
            let _guard = span.enter();
            tracing::warn!(connection_id = "conn_inner", "send queue full");
        });
        let found = log.recent(&IncidentFilter::default()).unwrap();
        assert_eq!(found[0].connection_id.as_deref(), Some("conn_inner"));
    }

    #[test]
    fn filter_by_pid_level_and_limit() {
        let log = capture(|| {
            for i in 0..5u64 {
                tracing::warn!(i, "slow save");
            }
            tracing::error!("store unavailable");
        });

        let me = std::process::id();
        assert_eq!(log.recent(&IncidentFilter::for_pid(me)).unwrap().len(), 6);
        assert!(log.recent(&IncidentFilter::for_pid(me + 1)).unwrap().is_empty());

        let errors = log
            .recent(&IncidentFilter {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);

        let newest = log
            .recent(&IncidentFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].message, "store unavailable");
    }

    #[test]
    fn limit_is_capped() {
        let filter = IncidentFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filter.limit(), MAX_INCIDENTS);
    }

    #[test]
    fn last_seen_per_pid() {
        let log = capture(|| tracing::warn!("worker died"));
        assert!(log.last_seen(std::process::id()).unwrap().is_some());
        assert!(log.last_seen(1).unwrap().is_none());
    }

    #[test]
    fn file_log_is_shared_between_handles() {
        let dir = std::env::temp_dir().join(format!("mercado-incidents-{}", uuid::Uuid::now_v7()));
        let path = dir.join("logs.db");
        let writer = Arc::new(IncidentLog::open(&path).unwrap());
        let subscriber = tracing_subscriber::registry().with(IncidentLayer::new(writer));
        tracing::subscriber::with_default(subscriber, || tracing::error!("bind failed"));

        let reader = IncidentLog::open(&path).unwrap();
        let found = reader.recent(&IncidentFilter::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "bind failed");
        let _ = std::fs::remove_dir_all(dir);
    }
}
