//! Transport client: the connecting side.
//!
//! One [`TransportClient`] owns at most one physical connection to a remote
//! listener and runs the reconnection state machine:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Connected
//!       ↑             ↑                            │
//!       │             └──────── Retrying ←─────────┤ (failure, retries left)
//!       └──────────────────────────────────────────┘ (failure, exhausted)
//! ```
//!
//! Connect failures, authentication failures and later connection loss all
//! enter the same error path. Every connect cycle has a generation; a
//! scheduled attempt only acts if its generation is still the one held in the
//! next-attempt slot, which `disconnect()` clears.

use crate::auth;
use crate::connection::{
    read_frame, spawn_reader, write_frame, Connection, ConnectionInfo, FrameHandler, WireError,
};
use crate::message::{Frame, PROTOCOL_VERSION};
use crate::transport::{split, BoxReader, BoxStream, TlsProvider};

use async_trait::async_trait;
use buslink_types::config::{OutboundDomainConfig, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Retrying,
}

/// Status of a transport client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub state: ClientState,
    /// Retries made since the last successful connection or reconnect request.
    pub retries: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub connection: Option<ConnectionInfo>,
}

/// Everything a client needs to reach and authenticate with its remote.
#[derive(Clone)]
pub struct ClientSettings {
    /// Owning domain, for logs.
    pub domain: String,
    pub remote: String,
    pub credential: String,
    pub shared_secret: Option<String>,
    pub server_name: Option<String>,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    pub tls: Option<Arc<dyn TlsProvider>>,
}

impl ClientSettings {
    pub fn from_config(
        config: &OutboundDomainConfig,
        handshake_timeout: Duration,
        tls: Option<Arc<dyn TlsProvider>>,
    ) -> Self {
        Self {
            domain: config.name.clone(),
            remote: config.remote.clone(),
            credential: config.credential.clone(),
            shared_secret: config.shared_secret.clone(),
            server_name: config.tls.as_ref().and_then(|t| t.server_name.clone()),
            retry: config.retry,
            handshake_timeout,
            tls,
        }
    }

    fn tls_server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name,
            None => self
                .remote
                .rsplit_once(':')
                .map_or(self.remote.as_str(), |(host, _)| host),
        }
    }
}

struct Attempt {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct ClientInner {
    state: ClientState,
    retries: u32,
    generation: u64,
    /// Present while a connect cycle is live; cleared by `disconnect()`.
    next_attempt: Option<Attempt>,
    connection: Option<Arc<Connection>>,
    last_error: Option<String>,
    connected_since: Option<DateTime<Utc>>,
}

impl ClientInner {
    fn is_current(&self, generation: u64) -> bool {
        self.next_attempt
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }
}

enum AfterFailure {
    Stale,
    Retry { retries: u32 },
    GiveUp { retries: u32 },
}

/// Owns one physical connection to a remote peer.
pub struct TransportClient {
    settings: ClientSettings,
    handler: Weak<dyn FrameHandler>,
    inner: Mutex<ClientInner>,
}

impl TransportClient {
    /// `handler` receives every frame after authentication and is told when
    /// a connection goes away, whether lost or closed locally.
    pub fn new(settings: ClientSettings, handler: Weak<dyn FrameHandler>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            handler,
            inner: Mutex::new(ClientInner {
                state: ClientState::Disconnected,
                retries: 0,
                generation: 0,
                next_attempt: None,
                connection: None,
                last_error: None,
                connected_since: None,
            }),
        })
    }

    pub fn state(&self) -> ClientState {
        self.lock().state
    }

    pub fn status(&self) -> ClientStatus {
        let inner = self.lock();
        ClientStatus {
            state: inner.state,
            retries: inner.retries,
            last_error: inner.last_error.clone(),
            connected_since: inner.connected_since,
            connection: inner.connection.as_ref().map(|c| c.info()),
        }
    }

    /// The live connection, if any.
    pub fn send_context(&self) -> Option<Arc<Connection>> {
        let inner = self.lock();
        match inner.state {
            ClientState::Connected => inner.connection.clone(),
            _ => None,
        }
    }

    /// Start a connect cycle with a fresh retry budget.
    ///
    /// Without `force` this does nothing while a cycle is already live. With
    /// `force` the current connection or pending retry is torn down first.
    pub async fn connect(self: &Arc<Self>, force: bool) {
        let (generation, stale_timer, stale_connection) = {
            let mut inner = self.lock();
            if inner.next_attempt.is_some() && !force {
                debug!(domain = %self.settings.domain, "Connect requested while already active");
                return;
            }
            inner.generation += 1;
            let generation = inner.generation;
            let previous = inner.next_attempt.replace(Attempt {
                generation,
                timer: None,
            });
            inner.retries = 0;
            inner.state = ClientState::Connecting;
            inner.connected_since = None;
            (
                generation,
                previous.and_then(|a| a.timer),
                inner.connection.take(),
            )
        };

        if let Some(timer) = stale_timer {
            timer.abort();
        }
        if let Some(connection) = stale_connection {
            connection.close().await;
            self.notify_closed(&connection).await;
        }

        tokio::spawn(Arc::clone(self).attempt(generation));
    }

    /// Stop connecting and drop the live connection. Idempotent.
    pub async fn disconnect(&self) {
        let (timer, connection) = {
            let mut inner = self.lock();
            let attempt = inner.next_attempt.take();
            inner.generation += 1;
            inner.state = ClientState::Disconnected;
            inner.retries = 0;
            inner.connected_since = None;
            (attempt.and_then(|a| a.timer), inner.connection.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(connection) = connection {
            connection.close().await;
            info!(domain = %self.settings.domain, remote = %self.settings.remote, "Disconnected");
            self.notify_closed(&connection).await;
        }
    }

    async fn attempt(self: Arc<Self>, generation: u64) {
        if !self.transition(generation, ClientState::Connecting) {
            return;
        }
        debug!(domain = %self.settings.domain, remote = %self.settings.remote, "Connecting");
        match self.establish(generation).await {
            Ok((connection, reader)) => self.on_connected(generation, connection, reader).await,
            Err(e) => self.on_failure(generation, e).await,
        }
    }

    /// Connect, upgrade to TLS if configured, and authenticate.
    async fn establish(&self, generation: u64) -> Result<(Arc<Connection>, BoxReader), WireError> {
        let settings = &self.settings;
        let tcp = tokio::time::timeout(
            settings.handshake_timeout,
            TcpStream::connect(settings.remote.as_str()),
        )
        .await
        .map_err(|_| WireError::HandshakeTimeout)??;
        let peer = tcp.peer_addr()?;

        let stream: BoxStream = match &settings.tls {
            Some(tls) => tokio::time::timeout(
                settings.handshake_timeout,
                tls.connect(tcp, settings.tls_server_name()),
            )
            .await
            .map_err(|_| WireError::HandshakeTimeout)??,
            None => Box::new(tcp),
        };

        if !self.transition(generation, ClientState::Authenticating) {
            return Err(WireError::ConnectionClosed);
        }
        let (mut reader, mut writer) = split(stream);

        let nonce = auth::nonce();
        let auth_hmac = settings
            .shared_secret
            .as_deref()
            .map(|secret| auth::sign(secret, &nonce, &settings.credential))
            .unwrap_or_default();
        write_frame(
            &mut writer,
            &Frame::Auth {
                credential: settings.credential.clone(),
                protocol_version: PROTOCOL_VERSION,
                nonce,
                auth_hmac,
            },
        )
        .await?;

        let reply = tokio::time::timeout(settings.handshake_timeout, read_frame(&mut reader))
            .await
            .map_err(|_| WireError::HandshakeTimeout)?;
        match reply {
            Ok(Frame::AuthAccept { domain }) => {
                debug!(domain = %settings.domain, remote_domain = %domain, "Authenticated");
                Ok((Connection::new(peer, writer), reader))
            }
            Ok(Frame::AuthReject { reason }) => Err(WireError::AuthRefused(reason)),
            Ok(other) => Err(WireError::HandshakeFailed(format!(
                "expected auth_accept, got {}",
                other.kind()
            ))),
            Err(WireError::ConnectionClosed) => Err(WireError::AuthRefused(
                "connection closed before acceptance".to_string(),
            )),
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Err(
                WireError::AuthRefused("connection reset before acceptance".to_string()),
            ),
            Err(e) => Err(e),
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        generation: u64,
        connection: Arc<Connection>,
        reader: BoxReader,
    ) {
        let current = {
            let mut inner = self.lock();
            if inner.is_current(generation) {
                inner.state = ClientState::Connected;
                inner.retries = 0;
                inner.last_error = None;
                inner.connected_since = Some(Utc::now());
                inner.connection = Some(Arc::clone(&connection));
                true
            } else {
                false
            }
        };
        if !current {
            connection.close().await;
            return;
        }

        info!(
            domain = %self.settings.domain,
            remote = %self.settings.remote,
            connection = %connection.id(),
            "Connected"
        );
        let session = Arc::new(ClientSession {
            client: Arc::downgrade(self),
            generation,
        });
        spawn_reader(&connection, reader, session);
    }

    /// The shared error path.
    async fn on_failure(self: &Arc<Self>, generation: u64, err: WireError) {
        let (next, stale) = {
            let mut inner = self.lock();
            if !inner.is_current(generation) {
                (AfterFailure::Stale, None)
            } else {
                let stale = inner.connection.take();
                inner.connected_since = None;
                inner.last_error = Some(err.to_string());
                if self.settings.retry.allows(inner.retries) {
                    inner.retries += 1;
                    inner.state = ClientState::Retrying;
                    (
                        AfterFailure::Retry {
                            retries: inner.retries,
                        },
                        stale,
                    )
                } else {
                    inner.state = ClientState::Disconnected;
                    inner.next_attempt = None;
                    (
                        AfterFailure::GiveUp {
                            retries: inner.retries,
                        },
                        stale,
                    )
                }
            }
        };

        if let Some(connection) = stale {
            connection.close().await;
        }

        let settings = &self.settings;
        match next {
            AfterFailure::Stale => {
                debug!(domain = %settings.domain, error = %err, "Ignoring failure of a cancelled attempt");
            }
            AfterFailure::Retry { retries } => {
                match &err {
                    WireError::AuthRefused(reason) => warn!(
                        domain = %settings.domain,
                        remote = %settings.remote,
                        reason = %reason,
                        retry = retries,
                        "Authentication refused; retrying"
                    ),
                    e => warn!(
                        domain = %settings.domain,
                        remote = %settings.remote,
                        error = %e,
                        retry = retries,
                        delay_ms = settings.retry.delay_ms,
                        "Connection failed; retrying"
                    ),
                }
                self.schedule_retry(generation);
            }
            AfterFailure::GiveUp { retries } => match &err {
                WireError::AuthRefused(reason) => error!(
                    domain = %settings.domain,
                    remote = %settings.remote,
                    reason = %reason,
                    retries,
                    "Authentication refused; giving up"
                ),
                e => error!(
                    domain = %settings.domain,
                    remote = %settings.remote,
                    error = %e,
                    retries,
                    "Connection failed; giving up"
                ),
            },
        }
    }

    async fn on_lost(self: &Arc<Self>, generation: u64, connection: &Arc<Connection>, err: WireError) {
        self.notify_closed(connection).await;
        self.on_failure(generation, err).await;
    }

    /// One-shot retry timer for `generation`.
    fn schedule_retry(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(self.settings.retry.delay_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(client) = weak.upgrade() {
                // Detached so that aborting the timer never cuts a handshake.
                tokio::spawn(client.attempt(generation));
            }
        });

        let mut inner = self.lock();
        match inner.next_attempt.as_mut() {
            Some(attempt) if attempt.generation == generation => attempt.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    fn transition(&self, generation: u64, state: ClientState) -> bool {
        let mut inner = self.lock();
        if inner.is_current(generation) {
            inner.state = state;
            true
        } else {
            false
        }
    }

    async fn notify_closed(&self, connection: &Arc<Connection>) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_closed(connection, None).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read-side handler of one established connection.
struct ClientSession {
    client: Weak<TransportClient>,
    generation: u64,
}

#[async_trait]
impl FrameHandler for ClientSession {
    async fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if let Some(handler) = client.handler.upgrade() {
            handler.on_frame(connection, frame).await;
        }
    }

    async fn on_closed(&self, connection: &Arc<Connection>, error: Option<WireError>) {
        if let Some(client) = self.client.upgrade() {
            client
                .on_lost(
                    self.generation,
                    connection,
                    error.unwrap_or(WireError::ConnectionClosed),
                )
                .await;
        }
    }
}
