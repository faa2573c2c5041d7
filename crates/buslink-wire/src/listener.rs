//! Transport listener: the accepting side.
//!
//! A listener binds one address and may serve any number of inbound domains.
//! Each accepted connection authenticates with a credential name, which the
//! process-wide [`CredentialRegistry`] resolves to the domain that owns it.

use crate::auth;
use crate::connection::{read_frame, spawn_reader, write_frame, Connection, WireError};
use crate::inbound::InboundDomain;
use crate::message::{Frame, PROTOCOL_VERSION};
use crate::transport::{split, BoxStream, TlsProvider};

use buslink_types::{BridgeError, BridgeResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Credential → inbound domain, unique across every listener of a process.
#[derive(Default)]
pub struct CredentialRegistry {
    domains: DashMap<String, Arc<InboundDomain>>,
}

impl CredentialRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, domain: Arc<InboundDomain>) -> BridgeResult<()> {
        match self.domains.entry(domain.credential().to_string()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateCredential(
                domain.credential().to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(domain);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, credential: &str) -> Option<Arc<InboundDomain>> {
        self.domains.remove(credential).map(|(_, domain)| domain)
    }

    pub fn get(&self, credential: &str) -> Option<Arc<InboundDomain>> {
        self.domains.get(credential).map(|d| Arc::clone(d.value()))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Observable state of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ListenerStatus {
    Stopped,
    Up { addr: SocketAddr },
    Down { last_error: String },
}

struct ListenerState {
    status: ListenerStatus,
    accept_task: Option<JoinHandle<()>>,
    credentials: BTreeSet<String>,
}

/// Shared, per-process handshake settings.
#[derive(Clone)]
struct Handshake {
    registry: Arc<CredentialRegistry>,
    tls: Option<Arc<dyn TlsProvider>>,
    timeout: Duration,
}

/// One bound, accepting socket.
pub struct Listener {
    name: String,
    bind: String,
    handshake: Handshake,
    state: Mutex<ListenerState>,
}

impl Listener {
    pub fn new(
        name: impl Into<String>,
        bind: impl Into<String>,
        registry: Arc<CredentialRegistry>,
        tls: Option<Arc<dyn TlsProvider>>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bind: bind.into(),
            handshake: Handshake {
                registry,
                tls,
                timeout: handshake_timeout,
            },
            state: Mutex::new(ListenerState {
                status: ListenerStatus::Stopped,
                accept_task: None,
                credentials: BTreeSet::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ListenerStatus {
        self.lock().status.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.lock().status {
            ListenerStatus::Up { addr } => Some(addr),
            _ => None,
        }
    }

    /// Bind and start accepting.
    ///
    /// A bind failure is logged and leaves the listener `Down`; it is not
    /// retried.
    pub async fn start(&self) -> Result<SocketAddr, WireError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let bound = match TcpListener::bind(&self.bind).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(listener = %self.name, bind = %self.bind, error = %e, "Failed to bind listener");
                self.lock().status = ListenerStatus::Down {
                    last_error: e.to_string(),
                };
                return Err(WireError::Io(e));
            }
        };

        info!(listener = %self.name, addr = %addr, "Listening");
        let task = tokio::spawn(accept_loop(
            self.name.clone(),
            listener,
            self.handshake.clone(),
        ));

        let mut state = self.lock();
        if let Some(old) = state.accept_task.replace(task) {
            old.abort();
        }
        state.status = ListenerStatus::Up { addr };
        Ok(addr)
    }

    /// Stop accepting. Established connections are left to their domains.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(task) = state.accept_task.take() {
            task.abort();
            info!(listener = %self.name, "Listener stopped");
        }
        state.status = ListenerStatus::Stopped;
    }

    /// Route a domain's credential to this listener's process.
    pub fn register(&self, domain: Arc<InboundDomain>) -> BridgeResult<()> {
        let credential = domain.credential().to_string();
        self.handshake.registry.register(domain)?;
        self.lock().credentials.insert(credential);
        Ok(())
    }

    pub fn deregister(&self, credential: &str) -> Option<Arc<InboundDomain>> {
        let mut state = self.lock();
        if !state.credentials.remove(credential) {
            warn!(listener = %self.name, credential, "Deregistering unknown credential");
            return None;
        }
        drop(state);
        self.handshake.registry.deregister(credential)
    }

    /// Credentials registered through this listener.
    pub fn credentials(&self) -> Vec<String> {
        self.lock().credentials.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.lock().accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(name: String, listener: TcpListener, handshake: Handshake) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(listener = %name, peer = %addr, "Accepted connection");
                let handshake = handshake.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, addr, &handshake).await {
                        match e {
                            WireError::AuthRefused(reason) => {
                                warn!(peer = %addr, reason = %reason, "Refused connection")
                            }
                            e => debug!(peer = %addr, error = %e, "Inbound handshake ended"),
                        }
                    }
                });
            }
            Err(e) => {
                error!(listener = %name, error = %e, "Accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Authenticate one accepted stream and hand it to its domain.
async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    handshake: &Handshake,
) -> Result<(), WireError> {
    let stream: BoxStream = match &handshake.tls {
        Some(tls) => tokio::time::timeout(handshake.timeout, tls.accept(stream))
            .await
            .map_err(|_| WireError::HandshakeTimeout)??,
        None => Box::new(stream),
    };
    let (mut reader, mut writer) = split(stream);

    let first = tokio::time::timeout(handshake.timeout, read_frame(&mut reader))
        .await
        .map_err(|_| WireError::HandshakeTimeout)??;

    let (credential, protocol_version, nonce, auth_hmac) = match first {
        Frame::Auth {
            credential,
            protocol_version,
            nonce,
            auth_hmac,
        } => (credential, protocol_version, nonce, auth_hmac),
        other => {
            let reason = format!("expected auth, got {}", other.kind());
            reject(&mut writer, &reason).await;
            return Err(WireError::HandshakeFailed(reason));
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        reject(
            &mut writer,
            &format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, protocol_version
            ),
        )
        .await;
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: protocol_version,
        });
    }

    let Some(domain) = handshake.registry.get(&credential) else {
        reject(&mut writer, "unknown credential").await;
        return Err(WireError::AuthRefused(format!(
            "unknown credential '{credential}'"
        )));
    };

    if let Some(secret) = domain.shared_secret() {
        if !auth::verify(secret, &nonce, &credential, &auth_hmac) {
            reject(&mut writer, "authentication failed").await;
            return Err(WireError::AuthRefused(format!(
                "bad signature for credential '{credential}'"
            )));
        }
    }

    write_frame(
        &mut writer,
        &Frame::AuthAccept {
            domain: domain.name().to_string(),
        },
    )
    .await?;
    info!(domain = %domain.name(), peer = %addr, "Peer authenticated");

    let connection = Connection::new(addr, writer);
    domain.register_connection(Arc::clone(&connection)).await;
    spawn_reader(&connection, reader, domain);
    Ok(())
}

async fn reject<W>(writer: &mut W, reason: &str)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = Frame::AuthReject {
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(writer, &frame).await {
        debug!(error = %e, "Failed to send auth rejection");
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(writer).await;
}
