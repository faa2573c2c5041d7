//! Outbound domain: a remote peer we connect to.
//!
//! The domain owns a [`TransportClient`] and mirrors what the peer
//! propagates as local proxy registrations. Registrar calls are made under
//! the domain lock so the registration map and the bus never disagree.

use crate::bus::{BusDispatcher, Registrar};
use crate::client::{ClientSettings, ClientStatus, TransportClient};
use crate::connection::{Connection, FrameHandler, WireError};
use crate::matcher::ServiceMatcher;
use crate::message::Frame;
use crate::relay::ExchangeRelay;
use crate::transport::TlsProvider;

use async_trait::async_trait;
use buslink_types::config::OutboundDomainConfig;
use buslink_types::{
    BridgeError, BridgeResult, ExchangeFault, ExchangeHandle, ExchangePattern, FlowContext,
    NewExchange, PropagationSnapshot, RegistrationHandle, ServiceKey, Step,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

struct RegistrationEntry {
    endpoint_name: String,
    description: Option<String>,
    /// The description comes from a local mapping and is never replaced.
    pinned: bool,
    handle: Option<RegistrationHandle>,
}

struct OutboundState {
    registered: bool,
    entries: BTreeMap<ServiceKey, RegistrationEntry>,
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub upgraded: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added + self.upgraded + self.removed + self.failed == 0
    }
}

/// One mirrored service, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MirroredService {
    pub key: ServiceKey,
    pub endpoint: String,
    pub has_description: bool,
    pub active: bool,
}

/// Status of an outbound domain.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundDomainStatus {
    pub name: String,
    pub remote: String,
    pub client: ClientStatus,
    pub registered: bool,
    pub services: Vec<MirroredService>,
    pub pending_exchanges: usize,
}

/// A configured remote target on the connecting side.
pub struct OutboundDomain {
    config: OutboundDomainConfig,
    matcher: ServiceMatcher,
    registrar: Arc<dyn Registrar>,
    relay: Arc<ExchangeRelay>,
    client: Arc<TransportClient>,
    state: Mutex<OutboundState>,
    weak_self: Weak<OutboundDomain>,
}

impl OutboundDomain {
    pub fn new(
        config: OutboundDomainConfig,
        registrar: Arc<dyn Registrar>,
        dispatcher: Arc<dyn BusDispatcher>,
        handshake_timeout: Duration,
        tls: Option<Arc<dyn TlsProvider>>,
    ) -> BridgeResult<Arc<Self>> {
        let matcher = ServiceMatcher::new(&config.name, config.mappings.clone())?;
        let relay = ExchangeRelay::new(config.name.clone(), dispatcher);
        let settings = ClientSettings::from_config(&config, handshake_timeout, tls);

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler: Weak<dyn FrameHandler> = weak.clone();
            Self {
                config,
                matcher,
                registrar,
                relay,
                client: TransportClient::new(settings, handler),
                state: Mutex::new(OutboundState {
                    registered: false,
                    entries: BTreeMap::new(),
                }),
                weak_self: weak.clone(),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn client(&self) -> &Arc<TransportClient> {
        &self.client
    }

    pub fn relay(&self) -> &Arc<ExchangeRelay> {
        &self.relay
    }

    pub async fn connect(&self, force: bool) {
        self.client.connect(force).await;
    }

    /// Drop the connection. Mirrored registrations stay; exchanges pending
    /// on the connection fail.
    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Activate proxies for every known entry.
    ///
    /// If one fails, the ones activated by this call are withdrawn again
    /// before the error is returned.
    pub fn register(&self) -> BridgeResult<()> {
        let mut state = self.lock();
        if state.registered {
            return Ok(());
        }

        let mut activated = Vec::new();
        let mut failure = None;
        for (key, entry) in state.entries.iter_mut() {
            if entry.handle.is_some() {
                continue;
            }
            match self.registrar.register(
                key,
                &entry.endpoint_name,
                self.proxy(key, &entry.endpoint_name),
                entry.description.as_deref(),
            ) {
                Ok(handle) => {
                    entry.handle = Some(handle);
                    activated.push(key.clone());
                }
                Err(reason) => {
                    failure = Some((key.clone(), reason));
                    break;
                }
            }
        }

        if let Some((key, reason)) = failure {
            for done in activated {
                let handle = state.entries.get_mut(&done).and_then(|e| e.handle.take());
                if let Some(handle) = handle {
                    self.withdraw(&done, &handle);
                }
            }
            warn!(domain = %self.config.name, key = %key, reason = %reason, "Registration failed; rolled back");
            return Err(BridgeError::Registration {
                key: key.to_string(),
                reason,
            });
        }

        state.registered = true;
        info!(domain = %self.config.name, services = state.entries.len(), "Outbound domain registered");
        Ok(())
    }

    /// Withdraw every active proxy; the entries themselves are kept.
    pub fn deregister(&self) {
        let mut state = self.lock();
        state.registered = false;
        for (key, entry) in state.entries.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                self.withdraw(key, &handle);
            }
        }
        info!(domain = %self.config.name, "Outbound domain deregistered");
    }

    /// Disconnect, withdraw every proxy and forget every entry.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.deregister();
        self.lock().entries.clear();
    }

    /// Reconcile the mirrored registrations with what the peer now offers.
    pub fn update_propagated_services(&self, snapshot: &PropagationSnapshot) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut state = self.lock();
        let active = state.registered;

        for (key, description) in snapshot.iter() {
            let mapping = self.matcher.resolve(key);
            if mapping.is_none() && !self.config.accept_all {
                debug!(domain = %self.config.name, key = %key, "No mapping for propagated service; skipped");
                report.skipped += 1;
                continue;
            }

            if let Some(entry) = state.entries.get_mut(key) {
                if entry.pinned || entry.description.is_some() || description.is_none() {
                    continue;
                }
                // One-time upgrade to the richer description.
                entry.description = description.map(str::to_string);
                let Some(handle) = entry.handle.take() else {
                    report.upgraded += 1;
                    continue;
                };
                self.withdraw(key, &handle);
                let result = self.registrar.register(
                    key,
                    &entry.endpoint_name,
                    self.proxy(key, &entry.endpoint_name),
                    entry.description.as_deref(),
                );
                match result {
                    Ok(handle) => {
                        entry.handle = Some(handle);
                        report.upgraded += 1;
                    }
                    Err(reason) => {
                        // Forget the key so the next propagation registers it afresh.
                        report.failed += 1;
                        warn!(domain = %self.config.name, key = %key, reason = %reason, "Re-registration failed; dropped");
                        state.entries.remove(key);
                    }
                }
                continue;
            }

            let endpoint_name = mapping
                .and_then(|m| m.local_endpoint_for(key))
                .unwrap_or_else(|| self.synthetic_endpoint());
            let pinned = mapping.is_some_and(|m| m.description.is_some());
            let description = match mapping.and_then(|m| m.description.clone()) {
                Some(explicit) => Some(explicit),
                None => description.map(str::to_string),
            };

            let handle = if active {
                match self.registrar.register(
                    key,
                    &endpoint_name,
                    self.proxy(key, &endpoint_name),
                    description.as_deref(),
                ) {
                    Ok(handle) => Some(handle),
                    Err(reason) => {
                        report.failed += 1;
                        warn!(domain = %self.config.name, key = %key, reason = %reason, "Registration failed; skipped");
                        continue;
                    }
                }
            } else {
                None
            };

            debug!(domain = %self.config.name, key = %key, endpoint = %endpoint_name, "Mirroring propagated service");
            state.entries.insert(
                key.clone(),
                RegistrationEntry {
                    endpoint_name,
                    description,
                    pinned,
                    handle,
                },
            );
            report.added += 1;
        }

        let vanished: Vec<ServiceKey> = state
            .entries
            .keys()
            .filter(|key| !snapshot.contains(key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(entry) = state.entries.remove(&key) {
                if let Some(handle) = entry.handle {
                    self.withdraw(&key, &handle);
                }
                report.removed += 1;
            }
        }

        if !report.is_noop() {
            info!(
                domain = %self.config.name,
                added = report.added,
                upgraded = report.upgraded,
                removed = report.removed,
                failed = report.failed,
                "Propagation reconciled"
            );
        }
        report
    }

    pub fn status(&self) -> OutboundDomainStatus {
        let (registered, services) = {
            let state = self.lock();
            let services = state
                .entries
                .iter()
                .map(|(key, entry)| MirroredService {
                    key: key.clone(),
                    endpoint: entry.endpoint_name.clone(),
                    has_description: entry.description.is_some(),
                    active: entry.handle.is_some(),
                })
                .collect();
            (state.registered, services)
        };
        OutboundDomainStatus {
            name: self.config.name.clone(),
            remote: self.config.remote.clone(),
            client: self.client.status(),
            registered,
            services,
            pending_exchanges: self.relay.pending_count(),
        }
    }

    async fn invoke(
        &self,
        key: &ServiceKey,
        handle: ExchangeHandle,
        flow: FlowContext,
        operation: &str,
        pattern: ExchangePattern,
        payload: Option<String>,
    ) -> Result<String, ExchangeFault> {
        let connection = self.client.send_context().ok_or_else(|| {
            ExchangeFault::Unavailable(format!("domain '{}' is not connected", self.config.name))
        })?;
        let exchange_id = uuid::Uuid::new_v4().to_string();
        let step = Step::New(NewExchange {
            service: key.clone(),
            operation: operation.to_string(),
            pattern,
            payload,
        });
        self.relay
            .send(&connection, &exchange_id, step, handle, flow)
            .await;
        Ok(exchange_id)
    }

    fn proxy(&self, key: &ServiceKey, endpoint_name: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            key: key.clone(),
            endpoint_name: endpoint_name.to_string(),
            domain: self.weak_self.clone(),
        }
    }

    fn withdraw(&self, key: &ServiceKey, handle: &RegistrationHandle) {
        if let Err(reason) = self.registrar.deregister(handle) {
            warn!(domain = %self.config.name, key = %key, reason = %reason, "Deregistration failed");
        }
    }

    /// Peer endpoint names mean nothing locally.
    fn synthetic_endpoint(&self) -> String {
        format!("{}-{}", self.config.name, uuid::Uuid::new_v4().simple())
    }

    fn lock(&self) -> MutexGuard<'_, OutboundState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FrameHandler for OutboundDomain {
    async fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        match frame {
            Frame::Propagation { services } => {
                self.update_propagated_services(&PropagationSnapshot::from_wire(services));
            }
            frame if frame.exchange_id().is_some() => self.relay.receive(connection, frame),
            other => warn!(
                domain = %self.config.name,
                frame = other.kind(),
                "Unexpected frame on outbound connection; ignored"
            ),
        }
    }

    async fn on_closed(&self, connection: &Arc<Connection>, _error: Option<WireError>) {
        debug!(domain = %self.config.name, connection = %connection.id(), "Outbound connection gone");
        self.relay.fail_connection(connection);
    }
}

/// The local face of one remote service.
///
/// Handed to the [`Registrar`]; the local bus uses it to start exchanges
/// with the peer.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    key: ServiceKey,
    endpoint_name: String,
    domain: Weak<OutboundDomain>,
}

impl ProxyEndpoint {
    /// The remote service, as the peer propagated it.
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Start an exchange with the remote service.
    ///
    /// Returns the wire exchange id; later steps come back through the bus
    /// dispatcher under `handle`.
    pub async fn invoke(
        &self,
        handle: ExchangeHandle,
        flow: FlowContext,
        operation: &str,
        pattern: ExchangePattern,
        payload: Option<String>,
    ) -> Result<String, ExchangeFault> {
        let domain = self
            .domain
            .upgrade()
            .ok_or_else(|| ExchangeFault::Unavailable("domain has shut down".to_string()))?;
        domain
            .invoke(&self.key, handle, flow, operation, pattern, payload)
            .await
    }

    /// Give up on an exchange started through this proxy.
    pub async fn timeout(&self, exchange_id: &str) -> bool {
        match self.domain.upgrade() {
            Some(domain) => domain.relay.timeout(exchange_id).await,
            None => false,
        }
    }
}
