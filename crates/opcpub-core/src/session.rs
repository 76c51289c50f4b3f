//! Session pool.
//!
//! Owns one logical connection per endpoint, shared by reference count.
//!
//! ```text
//!   acquire ──► [quota check + insert] ──► connect (retry/backoff) ──► Ready
//!                        │                          │
//!                        ▼                          ▼ failure
//!              ResourceExhausted             entry removed, granular status
//!
//!   supervisor: idle sweep (no activity or keep-alive within timeout) ─► Disconnected
//!               keep-alive failure ─► Connecting ─► Ready | NotReachable
//! ```
//!
//! The session table is the only structure mutated by concurrent callers; every
//! insert, reference change and removal happens under its lock.

use crate::endpoint::{EndpointDescriptor, EndpointKey};
use crate::error::{CoreError, CoreResult};
use crate::state::{ConnectionState, ConnectionStatus, StateReporter};
use crate::transport::{ConnectRequest, ConnectResponse, ConnectionId, DeviceTransport};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MIN_NONCE_LENGTH: usize = 32;
const MAX_NONCE_LENGTH: usize = 64;

/// Session pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionPoolConfig {
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Lower bound for negotiated session timeouts
    #[serde(with = "crate::duration_millis")]
    pub min_session_timeout: Duration,
    /// Upper bound for negotiated session timeouts
    #[serde(with = "crate::duration_millis")]
    pub max_session_timeout: Duration,
    /// Timeout requested when creating a session
    #[serde(with = "crate::duration_millis")]
    pub default_session_timeout: Duration,
    /// Length of the client nonce in bytes (clamped to 32..=64)
    pub nonce_length: usize,
    /// Connect requests older than this are abandoned
    #[serde(with = "crate::duration_millis")]
    pub max_request_age: Duration,
    /// Connect attempts before giving up with `NotReachable`
    pub connect_attempts: u32,
    /// First reconnect delay
    #[serde(with = "crate::duration_millis")]
    pub initial_backoff: Duration,
    /// Reconnect delay cap
    #[serde(with = "crate::duration_millis")]
    pub max_backoff: Duration,
    /// How often idle sessions are swept
    #[serde(with = "crate::duration_millis")]
    pub sweep_interval: Duration,
    /// How often ready sessions send a keep-alive
    #[serde(with = "crate::duration_millis")]
    pub keep_alive_interval: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            min_session_timeout: Duration::from_secs(10),
            max_session_timeout: Duration::from_secs(3600),
            default_session_timeout: Duration::from_secs(60),
            nonce_length: 32,
            max_request_age: Duration::from_secs(300),
            connect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(10),
        }
    }
}

impl SessionPoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_sessions == 0 {
            return Err(CoreError::Invalid("max_sessions must be positive".into()));
        }
        if self.min_session_timeout > self.max_session_timeout {
            return Err(CoreError::Invalid(
                "min_session_timeout exceeds max_session_timeout".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(CoreError::Invalid("connect_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Clamp a timeout into `[min_session_timeout, max_session_timeout]`.
    #[must_use]
    pub fn clamp_timeout(&self, requested: Duration) -> Duration {
        requested
            .max(self.min_session_timeout)
            .min(self.max_session_timeout)
    }

    fn nonce_length(&self) -> usize {
        self.nonce_length.clamp(MIN_NONCE_LENGTH, MAX_NONCE_LENGTH)
    }
}

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct SessionLink {
    connection: Option<ConnectionId>,
    timeout: Duration,
    client_nonce: Vec<u8>,
    server_nonce: Vec<u8>,
}

/// One authenticated logical connection to an endpoint.
///
/// Owned by the [`SessionPool`]; holders get an `Arc` from `acquire` and give
/// it back with `release`.
pub struct Session {
    id: SessionId,
    endpoint: EndpointDescriptor,
    key: EndpointKey,
    created_at: DateTime<Utc>,
    last_activity: parking_lot::Mutex<Instant>,
    link: parking_lot::Mutex<SessionLink>,
    state: watch::Sender<ConnectionState>,
    refs: AtomicUsize,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.url)
            .field("status", &self.state.borrow().status)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        endpoint: EndpointDescriptor,
        cancel: CancellationToken,
        timeout: Duration,
        client_nonce: Vec<u8>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(ConnectionStatus::Connecting));
        Self {
            id: SessionId(Uuid::new_v4()),
            key: endpoint.key(),
            endpoint,
            created_at: Utc::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            link: parking_lot::Mutex::new(SessionLink {
                connection: None,
                timeout,
                client_nonce,
                server_nonce: Vec::new(),
            }),
            state,
            refs: AtomicUsize::new(1),
            reconnecting: AtomicBool::new(false),
            cancel,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Endpoint this session is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// Pool key of this session.
    #[must_use]
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Negotiated session timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.link.lock().timeout
    }

    /// Client nonce sent on the last connect.
    #[must_use]
    pub fn client_nonce(&self) -> Vec<u8> {
        self.link.lock().client_nonce.clone()
    }

    /// Server nonce received on the last connect.
    #[must_use]
    pub fn server_nonce(&self) -> Vec<u8> {
        self.link.lock().server_nonce.clone()
    }

    /// Current device connection, if established.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        self.link.lock().connection
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of holders.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Record activity, postponing the idle sweep.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns `true` once the session has been detached.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is detached.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Connection handle, or `SessionClosed` if detached or not connected.
    pub fn require_connection(&self) -> CoreResult<ConnectionId> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed(self.id.to_string()));
        }
        self.connection()
            .ok_or_else(|| CoreError::Transient(format!("session {} not connected", self.id)))
    }

    fn attach(&self, response: ConnectResponse, timeout: Duration) {
        let mut link = self.link.lock();
        link.connection = Some(response.connection);
        link.timeout = timeout;
        link.server_nonce = response.server_nonce;
        drop(link);
        self.touch();
    }

    fn take_connection(&self) -> Option<ConnectionId> {
        self.link.lock().connection.take()
    }

    fn update_state(
        &self,
        status: ConnectionStatus,
        last_result: Option<String>,
    ) -> Option<ConnectionState> {
        let mut changed = None;
        self.state.send_if_modified(|current| {
            match current.transition(status, last_result) {
                Some(next) => {
                    *current = next.clone();
                    changed = Some(next);
                    true
                }
                None => false,
            }
        });
        changed
    }
}

struct PoolInner {
    config: SessionPoolConfig,
    transport: Arc<dyn DeviceTransport>,
    reporter: Arc<dyn StateReporter>,
    sessions: Mutex<HashMap<EndpointKey, Arc<Session>>>,
    shutdown: CancellationToken,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Reference-counted pool of device sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create an inert pool; call [`SessionPool::start`] to run the supervisor.
    pub fn new(
        config: SessionPoolConfig,
        transport: Arc<dyn DeviceTransport>,
        reporter: Arc<dyn StateReporter>,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                transport,
                reporter,
                sessions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                supervisor: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &SessionPoolConfig {
        &self.inner.config
    }

    /// Start the background idle sweep and keep-alive supervisor.
    pub fn start(&self) {
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(inner.supervise()));
        tracing::info!(
            max_sessions = self.inner.config.max_sessions,
            "Session pool supervisor started"
        );
    }

    /// Stop the supervisor and close every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Session supervisor terminated abnormally");
            }
        }

        let sessions: Vec<Arc<Session>> = {
            let mut table = self.inner.sessions.lock().await;
            table.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            self.inner.close_session(&session, "pool shutdown").await;
        }
        tracing::info!("Session pool stopped");
    }

    /// Get or create the session for `endpoint`.
    ///
    /// Fails with `ResourceExhausted` when creating a new session would exceed
    /// `max_sessions`; no session is created in that case.
    pub async fn acquire(
        &self,
        endpoint: &EndpointDescriptor,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<Session>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::Closed("session pool"));
        }

        let key = endpoint.key();
        let (session, created) = {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(existing) = sessions.get(&key) {
                existing.refs.fetch_add(1, Ordering::AcqRel);
                (Arc::clone(existing), false)
            } else {
                let limit = self.inner.config.max_sessions;
                if sessions.len() >= limit {
                    tracing::warn!(
                        endpoint = %endpoint.url,
                        limit,
                        "Session quota exhausted"
                    );
                    return Err(CoreError::ResourceExhausted {
                        resource: "sessions",
                        limit,
                    });
                }
                let session = Arc::new(Session::new(
                    endpoint.clone(),
                    self.inner.shutdown.child_token(),
                    self.inner
                        .config
                        .clamp_timeout(self.inner.config.default_session_timeout),
                    self.inner.new_nonce(),
                ));
                sessions.insert(key, Arc::clone(&session));
                (session, true)
            }
        };

        if created {
            tracing::info!(
                session_id = %session.id,
                endpoint = %endpoint.url,
                "Creating session"
            );
            self.inner
                .reporter
                .on_connection_state_change(&session.endpoint, &session.state())
                .await;

            if let Err(err) = self.inner.connect_with_retry(&session, cancel).await {
                self.inner.remove(&session).await;
                session.cancel.cancel();
                self.inner
                    .set_state(&session, err.connection_status(), Some(err.to_string()))
                    .await;
                tracing::warn!(
                    session_id = %session.id,
                    endpoint = %endpoint.url,
                    error = %err,
                    "Session connect failed"
                );
                return Err(err);
            }
            return Ok(session);
        }

        session.touch();
        if let Err(err) = self.wait_settled(&session, cancel).await {
            self.release(&session).await;
            return Err(err);
        }
        Ok(session)
    }

    /// Give back a session obtained from [`SessionPool::acquire`].
    ///
    /// Releasing the last reference detaches the session and frees its slot.
    pub async fn release(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            let previous = session
                .refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                    Some(refs.saturating_sub(1))
                })
                .unwrap_or(0);
            if previous > 1 {
                return;
            }
            if sessions
                .get(&session.key)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.key);
            }
        }
        self.inner.close_session(session, "released").await;
    }

    /// Current connection state of `session`.
    #[must_use]
    pub fn state(&self, session: &Session) -> ConnectionState {
        session.state()
    }

    /// Number of sessions in the pool.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Pooled session for `key`, if any.
    pub async fn get(&self, key: &EndpointKey) -> Option<Arc<Session>> {
        self.inner.sessions.lock().await.get(key).cloned()
    }

    /// Wait until a session created by another caller leaves `Connecting`.
    async fn wait_settled(&self, session: &Session, cancel: &CancellationToken) -> CoreResult<()> {
        let mut states = session.subscribe_state();
        loop {
            if session.is_closed() {
                return Err(error_for_state(
                    session,
                    &states.borrow(),
                    self.inner.config.connect_attempts,
                ));
            }
            if states.borrow_and_update().status != ConnectionStatus::Connecting
                || session.connection().is_some()
            {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = session.closed() => {}
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(CoreError::SessionClosed(session.id.to_string()));
                    }
                }
            }
        }
    }
}

impl PoolInner {
    fn new_nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.config.nonce_length()];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    async fn set_state(
        &self,
        session: &Session,
        status: ConnectionStatus,
        last_result: Option<String>,
    ) {
        if let Some(state) = session.update_state(status, last_result) {
            tracing::debug!(
                session_id = %session.id,
                endpoint = %session.endpoint.url,
                status = %state.status,
                "Session state changed"
            );
            self.reporter
                .on_connection_state_change(&session.endpoint, &state)
                .await;
        }
    }

    async fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(&session.key)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.key);
        }
    }

    async fn close_session(&self, session: &Session, reason: &str) {
        session.cancel.cancel();
        if let Some(connection) = session.take_connection() {
            if let Err(err) = self.transport.close(connection).await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "Failed to close device connection"
                );
            }
        }
        tracing::info!(session_id = %session.id, endpoint = %session.endpoint.url, reason, "Session closed");
        self.set_state(session, ConnectionStatus::Disconnected, Some(reason.to_string()))
            .await;
    }

    /// Connect with exponential backoff on transient failures.
    async fn connect_with_retry(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let issued = Instant::now();
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if issued.elapsed() > self.config.max_request_age {
                return Err(CoreError::Transient(format!(
                    "connect request for {} expired after {:?}",
                    session.endpoint.url, self.config.max_request_age
                )));
            }

            let request = ConnectRequest {
                requested_timeout: session.timeout(),
                client_nonce: session.client_nonce(),
            };
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(CoreError::Cancelled),
                () = session.closed() => Err(CoreError::SessionClosed(session.id.to_string())),
                result = self.transport.connect(&session.endpoint, &request) => result,
            };

            match result {
                Ok(response) => {
                    let timeout = self.config.clamp_timeout(response.revised_timeout);
                    session.attach(response, timeout);
                    tracing::info!(
                        session_id = %session.id,
                        endpoint = %session.endpoint.url,
                        attempt,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Session ready"
                    );
                    self.set_state(session, ConnectionStatus::Ready, None).await;
                    return Ok(());
                }
                Err(err) if err.is_transient_connect_failure() => {
                    if attempt >= self.config.connect_attempts {
                        if let CoreError::ServerBusy(_) = err {
                            return Err(err);
                        }
                        return Err(CoreError::NotReachable {
                            endpoint: session.endpoint.url.clone(),
                            attempts: attempt,
                        });
                    }
                    tracing::warn!(
                        session_id = %session.id,
                        endpoint = %session.endpoint.url,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Connect attempt failed, backing off"
                    );
                    self.set_state(session, ConnectionStatus::Connecting, Some(err.to_string()))
                        .await;
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(CoreError::Cancelled),
                        () = session.closed() => {
                            return Err(CoreError::SessionClosed(session.id.to_string()));
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keep_alive = tokio::time::interval(self.config.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep_idle().await,
                _ = keep_alive.tick() => self.check_connections().await,
            }
        }
        tracing::debug!("Session supervisor stopped");
    }

    async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    async fn sweep_idle(&self) {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<EndpointKey> = sessions
                .iter()
                .filter(|(_, session)| {
                    session.connection().is_some() && session.idle_time() > session.timeout()
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| sessions.remove(key)).collect()
        };

        for session in expired {
            tracing::info!(
                session_id = %session.id,
                idle_ms = u64::try_from(session.idle_time().as_millis()).unwrap_or(u64::MAX),
                "Session idle timeout"
            );
            self.close_session(&session, "idle timeout").await;
        }
    }

    async fn check_connections(self: &Arc<Self>) {
        for session in self.snapshot().await {
            if session.is_closed() || session.reconnecting.load(Ordering::Acquire) {
                continue;
            }
            let status = session.state().status;
            match status {
                ConnectionStatus::Ready => {
                    let Some(connection) = session.connection() else {
                        continue;
                    };
                    match self.transport.keep_alive(connection).await {
                        Ok(()) => session.touch(),
                        Err(err) if err.is_transient_connect_failure() => {
                            tracing::warn!(
                                session_id = %session.id,
                                error = %err,
                                "Keep-alive failed, reconnecting"
                            );
                            self.spawn_reconnect(session, err.to_string());
                        }
                        Err(err) => {
                            self.set_state(&session, err.connection_status(), Some(err.to_string()))
                                .await;
                        }
                    }
                }
                ConnectionStatus::NotReachable | ConnectionStatus::Busy | ConnectionStatus::Error => {
                    self.spawn_reconnect(session, status.to_string());
                }
                _ => {}
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, session: Arc<Session>, reason: String) {
        if session
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect(&session, reason).await;
            session.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect(&self, session: &Session, reason: String) {
        self.set_state(session, ConnectionStatus::Connecting, Some(reason))
            .await;
        if let Some(stale) = session.take_connection() {
            if let Err(err) = self.transport.close(stale).await {
                tracing::debug!(session_id = %session.id, error = %err, "Closing stale connection failed");
            }
        }

        let cancel = session.cancel.clone();
        if let Err(err) = self.connect_with_retry(session, &cancel).await {
            if session.is_closed() {
                return;
            }
            tracing::warn!(
                session_id = %session.id,
                endpoint = %session.endpoint.url,
                error = %err,
                "Reconnect failed"
            );
            self.set_state(session, err.connection_status(), Some(err.to_string()))
                .await;
        }
    }
}

fn error_for_state(session: &Session, state: &ConnectionState, attempts: u32) -> CoreError {
    let detail = state
        .last_result
        .clone()
        .unwrap_or_else(|| state.status.to_string());
    match state.status {
        ConnectionStatus::Busy => CoreError::ServerBusy(detail),
        ConnectionStatus::NoTrust => CoreError::NoTrust(detail),
        ConnectionStatus::CertificateInvalid => CoreError::CertificateInvalid(detail),
        ConnectionStatus::Unauthorized => CoreError::Unauthorized(detail),
        ConnectionStatus::NotReachable => CoreError::NotReachable {
            endpoint: session.endpoint.url.clone(),
            attempts,
        },
        ConnectionStatus::Error => CoreError::Protocol(detail),
        _ => CoreError::SessionClosed(session.id.to_string()),
    }
}
