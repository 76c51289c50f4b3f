//! `SQLite` state store.
//!
//! Keeps the latest connection, writer and item state so an operator (or a
//! restarted agent) can see where every endpoint and writer stood. Each change
//! is optionally forwarded to the event broker.

use async_trait::async_trait;
use chrono::Utc;
use opcpub_core::{
    ConnectionState, EndpointDescriptor, Event, EventBroker, EventEnvelope, ItemState,
    StateReporter, WriterState,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;

/// `SQLite`-backed state reporter.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    broker: Option<EventBroker>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            r"
            -- Latest connection state per endpoint
            CREATE TABLE IF NOT EXISTS connection_state (
                endpoint_key TEXT PRIMARY KEY,
                endpoint_url TEXT NOT NULL,
                status TEXT NOT NULL,
                state_json TEXT NOT NULL,
                changed_at INTEGER NOT NULL
            );

            -- Latest writer state
            CREATE TABLE IF NOT EXISTS writer_state (
                writer TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Latest state of every item feeding a writer
            CREATE TABLE IF NOT EXISTS item_state (
                writer TEXT NOT NULL,
                item_id TEXT NOT NULL,
                is_event INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (writer, item_id)
            );

            CREATE INDEX IF NOT EXISTS idx_connection_state_url ON connection_state(endpoint_url);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            broker: None,
        })
    }

    /// Forward connection and writer state changes to `broker`.
    #[must_use]
    pub fn with_broker(mut self, broker: EventBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Save the connection state of an endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub fn save_connection_state(
        &self,
        endpoint: &EndpointDescriptor,
        state: &ConnectionState,
    ) -> SqliteResult<()> {
        let json = to_json(state)?;
        self.conn.lock().execute(
            r"
            INSERT OR REPLACE INTO connection_state (endpoint_key, endpoint_url, status, state_json, changed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (
                endpoint.key().to_string(),
                &endpoint.url,
                state.status.to_string(),
                json,
                state.changed_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }

    /// Latest connection state recorded for `url`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn connection_state(&self, url: &str) -> SqliteResult<Option<ConnectionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT state_json FROM connection_state
            WHERE endpoint_url = ?1
            ORDER BY changed_at DESC
            LIMIT 1
            ",
        )?;
        let json: Option<String> = stmt.query_row([url], |row| row.get(0)).optional()?;
        json.as_deref().map(from_json).transpose()
    }

    /// Endpoint URLs currently recorded with `status` (e.g., `"NotReachable"`).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn endpoints_with_status(&self, status: &str) -> SqliteResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT endpoint_url FROM connection_state
            WHERE status = ?1
            ORDER BY endpoint_url ASC
            ",
        )?;
        let urls = stmt
            .query_map([status], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(urls)
    }

    /// Save the state of a writer.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub fn save_writer_state(&self, writer: &str, state: &WriterState) -> SqliteResult<()> {
        let json = to_json(state)?;
        self.conn.lock().execute(
            r"
            INSERT OR REPLACE INTO writer_state (writer, state_json, updated_at)
            VALUES (?1, ?2, ?3)
            ",
            (writer, json, Utc::now().timestamp_millis()),
        )?;
        Ok(())
    }

    /// Latest state of `writer`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn writer_state(&self, writer: &str) -> SqliteResult<Option<WriterState>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM writer_state WHERE writer = ?1",
                [writer],
                |row| row.get(0),
            )
            .optional()?;
        json.as_deref().map(from_json).transpose()
    }

    /// Save the state of one item feeding `writer`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub fn save_item_state(
        &self,
        writer: &str,
        item_id: &str,
        is_event: bool,
        state: &ItemState,
    ) -> SqliteResult<()> {
        let json = to_json(state)?;
        self.conn.lock().execute(
            r"
            INSERT OR REPLACE INTO item_state (writer, item_id, is_event, state_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (writer, item_id, is_event, json, Utc::now().timestamp_millis()),
        )?;
        Ok(())
    }

    /// Item states of `writer`, ordered by item id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn item_states(&self, writer: &str) -> SqliteResult<Vec<(String, ItemState)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT item_id, state_json FROM item_state
            WHERE writer = ?1
            ORDER BY item_id ASC
            ",
        )?;
        let rows = stmt
            .query_map([writer], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        rows.into_iter()
            .map(|(item_id, json)| Ok((item_id, from_json(&json)?)))
            .collect()
    }

    async fn forward(&self, event: Event) {
        if let Some(broker) = &self.broker {
            let report = broker.notify_all(EventEnvelope::new(event)).await;
            if report.failed > 0 {
                tracing::debug!(failed = report.failed, "Event handlers failed");
            }
        }
    }
}

#[async_trait]
impl StateReporter for SqliteStateStore {
    async fn on_connection_state_change(
        &self,
        endpoint: &EndpointDescriptor,
        state: &ConnectionState,
    ) {
        tracing::info!(
            endpoint = %endpoint.url,
            status = %state.status,
            last_result = ?state.last_result,
            "Connection state changed"
        );
        if let Err(err) = self.save_connection_state(endpoint, state) {
            tracing::warn!(error = %err, endpoint = %endpoint.url, "Failed to persist connection state");
        }
        self.forward(Event::EndpointStateChanged {
            endpoint_url: endpoint.url.clone(),
            state: state.clone(),
        })
        .await;
    }

    async fn on_writer_state_change(&self, writer: &str, state: &WriterState) {
        tracing::info!(writer, status = ?state.status, gap = ?state.gap, "Writer state changed");
        if let Err(err) = self.save_writer_state(writer, state) {
            tracing::warn!(error = %err, writer, "Failed to persist writer state");
        }
        self.forward(Event::WriterStateChanged {
            writer: writer.to_string(),
            state: state.clone(),
        })
        .await;
    }

    async fn on_variable_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        if let Err(err) = self.save_item_state(writer, item_id, false, state) {
            tracing::warn!(error = %err, writer, item_id, "Failed to persist variable state");
        }
    }

    async fn on_event_field_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        if let Err(err) = self.save_item_state(writer, item_id, true, state) {
            tracing::warn!(error = %err, writer, item_id, "Failed to persist event field state");
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> SqliteResult<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> SqliteResult<T> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcpub_core::{
        ConnectionStatus, CoreResult, EventHandler, EventKind, SequenceGap, WriterStatus,
    };
    use std::sync::Arc;

    #[test]
    fn connection_state_is_replaced_per_endpoint() {
        let store = SqliteStateStore::in_memory().unwrap();
        let endpoint = EndpointDescriptor::new("opc.tcp://plc-1:4840");

        let connecting = ConnectionState::new(ConnectionStatus::Connecting);
        store.save_connection_state(&endpoint, &connecting).unwrap();
        let failed = connecting
            .transition(ConnectionStatus::NotReachable, Some("timeout".into()))
            .unwrap();
        store.save_connection_state(&endpoint, &failed).unwrap();

        let loaded = store
            .connection_state("opc.tcp://plc-1:4840")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ConnectionStatus::NotReachable);
        assert_eq!(loaded.last_result.as_deref(), Some("timeout"));
        assert_eq!(
            store.endpoints_with_status("NotReachable").unwrap(),
            vec!["opc.tcp://plc-1:4840".to_string()]
        );
        assert!(store.endpoints_with_status("Ready").unwrap().is_empty());
        assert!(store.connection_state("opc.tcp://other:4840").unwrap().is_none());
    }

    #[test]
    fn writer_and_item_states_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let now = Utc::now();
        let state = WriterState {
            status: WriterStatus::Publishing,
            last_error: None,
            gap: Some(SequenceGap {
                last_sequence: Some(41),
                disconnected_at: now,
                resumed_at: now,
            }),
        };
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.save_writer_state("line-1", &state).unwrap();
            store
                .save_item_state("line-1", "ns=2;s=T2", false, &ItemState::Good)
                .unwrap();
            store
                .save_item_state(
                    "line-1",
                    "ns=2;s=T1",
                    false,
                    &ItemState::Error {
                        message: "BadNodeIdUnknown".into(),
                    },
                )
                .unwrap();
        }

        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.writer_state("line-1").unwrap(), Some(state));
        let items = store.item_states("line-1").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "ns=2;s=T1");
        assert!(matches!(items[0].1, ItemState::Error { .. }));
        assert_eq!(items[1].1, ItemState::Good);
    }

    #[derive(Default)]
    struct Collector {
        events: parking_lot::Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for Collector {
        async fn handle(&self, envelope: Arc<EventEnvelope>) -> CoreResult<()> {
            self.events.lock().push(envelope.event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn reporter_persists_and_forwards() {
        let broker = EventBroker::new(opcpub_core::EventBrokerConfig::default());
        let collector = Arc::new(Collector::default());
        let _endpoints = broker.register(EventKind::EndpointStateChanged, collector.clone());
        let _writers = broker.register(EventKind::WriterStateChanged, collector.clone());

        let store = SqliteStateStore::in_memory().unwrap().with_broker(broker);
        let endpoint = EndpointDescriptor::new("opc.tcp://plc-1:4840");
        store
            .on_connection_state_change(&endpoint, &ConnectionState::new(ConnectionStatus::Ready))
            .await;
        store
            .on_writer_state_change("line-1", &WriterState::new(WriterStatus::Pending))
            .await;
        store
            .on_event_field_state_change("line-1", "ns=2;s=Alarms", &ItemState::Good)
            .await;

        assert_eq!(
            store.connection_state(&endpoint.url).unwrap().unwrap().status,
            ConnectionStatus::Ready
        );
        assert_eq!(store.item_states("line-1").unwrap().len(), 1);

        let events = collector.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::EndpointStateChanged { endpoint_url, .. } if endpoint_url == &endpoint.url));
        assert!(matches!(&events[1], Event::WriterStateChanged { writer, .. } if writer == "line-1"));
    }
}
