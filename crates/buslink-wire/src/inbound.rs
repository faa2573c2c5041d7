//! Inbound domain: a peer allowed to connect to us.
//!
//! The domain advertises what it offers to every connection authenticated
//! under its credential and relays the exchanges those connections start.
//! All state lives behind one mutex; directory lookups and socket writes
//! happen outside it.
//!
//! Propagation runs under a separate async `broadcast_gate` so that snapshot
//! sends are ordered: a computation that started before `close()` can never
//! land after the EMPTY snapshot that `close()` sends. Cancellation is an
//! epoch counter bumped by `open()` and `close()` and re-checked between
//! directory lookups.

use crate::bus::{BusDispatcher, Directory};
use crate::connection::{Connection, ConnectionId, ConnectionInfo, FrameHandler, WireError};
use crate::message::Frame;
use crate::relay::ExchangeRelay;

use async_trait::async_trait;
use buslink_types::config::InboundDomainConfig;
use buslink_types::{PropagationSnapshot, ServiceKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct InboundState {
    open: bool,
    epoch: u64,
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    last_sent: PropagationSnapshot,
    poll_timer: Option<JoinHandle<()>>,
}

/// Status of an inbound domain.
#[derive(Debug, Clone, Serialize)]
pub struct InboundDomainStatus {
    pub name: String,
    pub credential: String,
    pub open: bool,
    pub connections: Vec<ConnectionInfo>,
    /// Entries in the snapshot last sent to the peer.
    pub propagated: usize,
    pub pending_exchanges: usize,
}

/// A configured peer identity on the accepting side.
pub struct InboundDomain {
    config: InboundDomainConfig,
    directory: Arc<dyn Directory>,
    relay: Arc<ExchangeRelay>,
    state: Mutex<InboundState>,
    broadcast_gate: tokio::sync::Mutex<()>,
}

enum Outgoing {
    Broadcast(PropagationSnapshot, Vec<Arc<Connection>>),
    Unicast(PropagationSnapshot),
}

impl InboundDomain {
    pub fn new(
        config: InboundDomainConfig,
        directory: Arc<dyn Directory>,
        dispatcher: Arc<dyn BusDispatcher>,
    ) -> Arc<Self> {
        let relay = ExchangeRelay::new(config.name.clone(), dispatcher);
        Arc::new(Self {
            config,
            directory,
            relay,
            state: Mutex::new(InboundState {
                open: false,
                epoch: 0,
                connections: BTreeMap::new(),
                last_sent: PropagationSnapshot::empty(),
                poll_timer: None,
            }),
            broadcast_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn credential(&self) -> &str {
        &self.config.credential
    }

    pub fn shared_secret(&self) -> Option<&str> {
        self.config.shared_secret.as_deref()
    }

    pub fn listener(&self) -> &str {
        &self.config.listener
    }

    pub fn relay(&self) -> &Arc<ExchangeRelay> {
        &self.relay
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Start advertising: send the current snapshot to every connection and
    /// start polling if configured.
    pub async fn open(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.lock();
            if state.open {
                return;
            }
            state.open = true;
            state.epoch += 1;
            state.epoch
        };
        info!(domain = %self.config.name, "Inbound domain opened");

        self.propagate(true).await;

        let interval = self.config.polling.interval_ms;
        if interval > 0 {
            self.schedule_poll(epoch, interval);
        }
    }

    /// Stop advertising: cancel polling and send EMPTY to remaining connections.
    pub async fn close(&self) {
        let timer = {
            let mut state = self.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.epoch += 1;
            state.last_sent = PropagationSnapshot::empty();
            state.poll_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let _gate = self.broadcast_gate.lock().await;
        let targets = {
            let state = self.lock();
            if state.open {
                // Reopened while we waited; its own snapshot supersedes ours.
                return;
            }
            state.connections.values().cloned().collect::<Vec<_>>()
        };
        self.broadcast(&PropagationSnapshot::empty(), targets).await;
        info!(domain = %self.config.name, "Inbound domain closed");
    }

    /// Close, then drop every connection and fail their pending exchanges.
    pub async fn shutdown(&self) {
        self.close().await;
        let connections: Vec<_> = {
            let mut state = self.lock();
            std::mem::take(&mut state.connections).into_values().collect()
        };
        for connection in connections {
            connection.close().await;
            self.relay.fail_connection(&connection);
        }
    }

    /// Recompute and send the snapshot to every connection, changed or not.
    pub async fn refresh(&self) {
        if self.is_open() {
            self.propagate(true).await;
        }
    }

    /// Add an authenticated connection.
    ///
    /// While open, the new connection needs the current snapshot: if it
    /// changed everybody gets it, otherwise only the newcomer does.
    pub async fn register_connection(&self, connection: Arc<Connection>) {
        let epoch = {
            let mut state = self.lock();
            state
                .connections
                .insert(connection.id(), Arc::clone(&connection));
            info!(
                domain = %self.config.name,
                connection = %connection.id(),
                peer = %connection.peer(),
                connections = state.connections.len(),
                "Connection registered"
            );
            if !state.open {
                return;
            }
            state.epoch
        };

        let _gate = self.broadcast_gate.lock().await;
        let Some(snapshot) = self.compute_snapshot(epoch).await else {
            return;
        };
        let outgoing = {
            let mut state = self.lock();
            if !(state.open && state.epoch == epoch)
                || !state.connections.contains_key(&connection.id())
            {
                return;
            }
            if snapshot.changed_since(&state.last_sent) {
                state.last_sent = snapshot.clone();
                Outgoing::Broadcast(snapshot, state.connections.values().cloned().collect())
            } else {
                Outgoing::Unicast(state.last_sent.clone())
            }
        };
        match outgoing {
            Outgoing::Broadcast(snapshot, targets) => self.broadcast(&snapshot, targets).await,
            Outgoing::Unicast(snapshot) => {
                if let Err(e) = connection.send(&Frame::propagation(&snapshot)).await {
                    warn!(
                        domain = %self.config.name,
                        connection = %connection.id(),
                        error = %e,
                        "Failed to send propagation"
                    );
                }
            }
        }
    }

    /// Forget a connection. Returns `false` if it was not registered.
    pub fn deregister_connection(&self, id: ConnectionId) -> bool {
        let mut state = self.lock();
        let removed = state.connections.remove(&id).is_some();
        if removed {
            info!(
                domain = %self.config.name,
                connection = %id,
                connections = state.connections.len(),
                "Connection deregistered"
            );
        } else {
            warn!(domain = %self.config.name, connection = %id, "Deregistering unknown connection");
        }
        removed
    }

    pub fn status(&self) -> InboundDomainStatus {
        let state = self.lock();
        InboundDomainStatus {
            name: self.config.name.clone(),
            credential: self.config.credential.clone(),
            open: state.open,
            connections: state.connections.values().map(|c| c.info()).collect(),
            propagated: state.last_sent.len(),
            pending_exchanges: self.relay.pending_count(),
        }
    }

    /// Recompute and send if changed (or `force`), then keep the new baseline.
    async fn propagate(&self, force: bool) {
        let _gate = self.broadcast_gate.lock().await;
        let epoch = {
            let state = self.lock();
            if !state.open {
                return;
            }
            state.epoch
        };

        let Some(snapshot) = self.compute_snapshot(epoch).await else {
            return;
        };

        let targets = {
            let mut state = self.lock();
            if !(state.open && state.epoch == epoch) {
                return;
            }
            if !force && !snapshot.changed_since(&state.last_sent) {
                debug!(domain = %self.config.name, "Propagation unchanged");
                return;
            }
            state.last_sent = snapshot.clone();
            state.connections.values().cloned().collect::<Vec<_>>()
        };
        self.broadcast(&snapshot, targets).await;
    }

    /// Resolve every offer through the directory.
    ///
    /// Returns `None` if the domain was closed or reopened meanwhile.
    async fn compute_snapshot(&self, epoch: u64) -> Option<PropagationSnapshot> {
        let mut services: BTreeMap<ServiceKey, Option<String>> = BTreeMap::new();
        for offer in &self.config.offers {
            if !self.is_current(epoch) {
                debug!(domain = %self.config.name, "Snapshot computation cancelled");
                return None;
            }
            let found = self
                .directory
                .lookup(
                    &offer.interface,
                    offer.service.as_deref(),
                    offer.endpoint.as_deref(),
                )
                .await;

            // One interface-level offer can span several services.
            for endpoint in found {
                let key = ServiceKey {
                    interface: offer.interface.clone(),
                    service: Some(endpoint.service),
                    endpoint: offer.endpoint.clone(),
                };
                let description = services.entry(key).or_insert(None);
                if description.is_none() {
                    *description = endpoint.description;
                }
            }
        }
        if !self.is_current(epoch) {
            debug!(domain = %self.config.name, "Snapshot computation cancelled");
            return None;
        }
        Some(PropagationSnapshot::new(services))
    }

    async fn broadcast(&self, snapshot: &PropagationSnapshot, targets: Vec<Arc<Connection>>) {
        if targets.is_empty() {
            return;
        }
        let frame = Frame::propagation(snapshot);
        debug!(
            domain = %self.config.name,
            services = snapshot.len(),
            connections = targets.len(),
            "Broadcasting propagation"
        );
        let sends = targets.iter().map(|connection| {
            let frame = &frame;
            async move {
                if let Err(e) = connection.send(frame).await {
                    warn!(
                        domain = %self.config.name,
                        connection = %connection.id(),
                        error = %e,
                        "Failed to send propagation"
                    );
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// One-shot poll timer; each tick schedules the next.
    fn schedule_poll(self: &Arc<Self>, epoch: u64, delay_ms: u64) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let Some(domain) = weak.upgrade() else {
                return;
            };
            if domain.is_current(epoch) {
                // The tick runs detached so aborting the timer never cuts a
                // frame write in half.
                tokio::spawn(async move { domain.poll(epoch, delay_ms).await });
            }
        });

        let mut state = self.lock();
        if state.open && state.epoch == epoch {
            state.poll_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    async fn poll(self: Arc<Self>, epoch: u64, delay_ms: u64) {
        self.propagate(false).await;
        let next = self.config.polling.next_delay_ms(delay_ms);
        self.schedule_poll(epoch, next);
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.lock();
        state.open && state.epoch == epoch
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FrameHandler for InboundDomain {
    async fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        if frame.exchange_id().is_some() {
            self.relay.receive(connection, frame);
        } else {
            warn!(
                domain = %self.config.name,
                connection = %connection.id(),
                frame = frame.kind(),
                "Unexpected frame on inbound connection; ignored"
            );
        }
    }

    async fn on_closed(&self, connection: &Arc<Connection>, error: Option<WireError>) {
        match error {
            Some(e) => warn!(
                domain = %self.config.name,
                connection = %connection.id(),
                error = %e,
                "Inbound connection failed"
            ),
            None => info!(
                domain = %self.config.name,
                connection = %connection.id(),
                "Inbound connection closed by peer"
            ),
        }
        self.deregister_connection(connection.id());
        self.relay.fail_connection(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use buslink_types::config::{OfferEntry, PollingPolicy};
    use buslink_types::{ExchangeFault, ExchangeHandle, FlowContext, NewExchange, Step};

    fn config(offers: Vec<OfferEntry>, polling: PollingPolicy) -> InboundDomainConfig {
        InboundDomainConfig {
            name: "partner".into(),
            listener: "main".into(),
            credential: "partner-cred".into(),
            shared_secret: None,
            tls: None,
            polling,
            offers,
        }
    }

    fn offer(interface: &str) -> OfferEntry {
        OfferEntry {
            interface: interface.into(),
            service: None,
            endpoint: None,
        }
    }

    fn no_polling() -> PollingPolicy {
        PollingPolicy {
            interval_ms: 0,
            ..PollingPolicy::default()
        }
    }

    fn domain(directory: &Arc<FakeDirectory>, polling: PollingPolicy) -> Arc<InboundDomain> {
        InboundDomain::new(
            config(vec![offer("Echo")], polling),
            directory.clone(),
            RecordingDispatcher::new(),
        )
    }

    #[tokio::test]
    async fn test_open_groups_by_service() {
        let directory = FakeDirectory::new();
        directory.set(vec![
            endpoint("Echo", "EchoA", "a1", None),
            endpoint("Echo", "EchoA", "a2", Some("<wsdl a/>")),
            endpoint("Echo", "EchoB", "b1", Some("<wsdl b/>")),
            endpoint("Other", "X", "x1", None),
        ]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;

        domain.open().await;
        let frame = next_frame(&mut peer).await;
        let snapshot = match frame {
            Frame::Propagation { services } => PropagationSnapshot::from_wire(services),
            other => panic!("expected propagation, got {other:?}"),
        };
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get(&ServiceKey::service("Echo", "EchoA")),
            Some(Some("<wsdl a/>"))
        );
        assert_eq!(
            snapshot.get(&ServiceKey::service("Echo", "EchoB")),
            Some(Some("<wsdl b/>"))
        );
        assert_eq!(domain.status().propagated, 2);
    }

    #[tokio::test]
    async fn test_unchanged_recompute_sends_nothing() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        let _ = next_frame(&mut peer).await;

        domain.propagate(false).await;
        domain.propagate(false).await;
        assert_silent(&mut peer, 100).await;
    }

    #[tokio::test]
    async fn test_activation_then_deactivation() {
        let directory = FakeDirectory::new();
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        assert!(propagated_keys(&next_frame(&mut peer).await).is_empty());

        directory.add(endpoint("Echo", "EchoA", "a1", None));
        domain.propagate(false).await;
        assert_eq!(
            propagated_keys(&next_frame(&mut peer).await),
            vec![ServiceKey::service("Echo", "EchoA")]
        );

        directory.set(vec![]);
        domain.propagate(false).await;
        assert!(propagated_keys(&next_frame(&mut peer).await).is_empty());
        assert_silent(&mut peer, 100).await;
    }

    #[tokio::test]
    async fn test_description_upgrade_counts_as_change() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        let _ = next_frame(&mut peer).await;

        directory.set(vec![endpoint("Echo", "EchoA", "a1", Some("<wsdl/>"))]);
        domain.propagate(false).await;
        assert!(matches!(next_frame(&mut peer).await, Frame::Propagation { .. }));

        // Text changes alone do not.
        directory.set(vec![endpoint("Echo", "EchoA", "a1", Some("<wsdl v2/>"))]);
        domain.propagate(false).await;
        assert_silent(&mut peer, 100).await;
    }

    #[tokio::test]
    async fn test_new_connection_gets_unicast_when_unchanged() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (first, mut first_peer) = connection_pair().await;
        domain.register_connection(first).await;
        domain.open().await;
        let _ = next_frame(&mut first_peer).await;

        let (second, mut second_peer) = connection_pair().await;
        domain.register_connection(second).await;
        assert_eq!(propagated_keys(&next_frame(&mut second_peer).await).len(), 1);
        assert_silent(&mut first_peer, 100).await;
    }

    #[tokio::test]
    async fn test_new_connection_triggers_broadcast_when_changed() {
        let directory = FakeDirectory::new();
        let domain = domain(&directory, no_polling());
        let (first, mut first_peer) = connection_pair().await;
        domain.register_connection(first).await;
        domain.open().await;
        let _ = next_frame(&mut first_peer).await;

        directory.add(endpoint("Echo", "EchoA", "a1", None));
        let (second, mut second_peer) = connection_pair().await;
        domain.register_connection(second).await;
        assert_eq!(propagated_keys(&next_frame(&mut first_peer).await).len(), 1);
        assert_eq!(propagated_keys(&next_frame(&mut second_peer).await).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_domain_sends_nothing_to_new_connection() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        assert_silent(&mut peer, 100).await;
        assert_eq!(directory.lookups(), 0);
    }

    #[tokio::test]
    async fn test_close_sends_empty() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        let _ = next_frame(&mut peer).await;

        domain.close().await;
        assert!(propagated_keys(&next_frame(&mut peer).await).is_empty());
        assert!(!domain.is_open());
        domain.close().await;
        assert_silent(&mut peer, 100).await;
    }

    #[tokio::test]
    async fn test_close_cancels_inflight_computation() {
        let directory = FakeDirectory::new();
        directory.set(vec![endpoint("Echo", "EchoA", "a1", None)]);
        let domain = domain(&directory, no_polling());
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        let _ = next_frame(&mut peer).await;

        directory.add(endpoint("Echo", "EchoB", "b1", None));
        directory.hold();
        let refreshing = tokio::spawn({
            let domain = Arc::clone(&domain);
            async move { domain.refresh().await }
        });
        directory.wait_entered().await;

        let closing = tokio::spawn({
            let domain = Arc::clone(&domain);
            async move { domain.close().await }
        });
        while domain.is_open() {
            tokio::task::yield_now().await;
        }
        directory.release();
        refreshing.await.unwrap();
        closing.await.unwrap();

        assert!(propagated_keys(&next_frame(&mut peer).await).is_empty());
        assert_silent(&mut peer, 100).await;
    }

    #[tokio::test]
    async fn test_polling_picks_up_changes_and_stops_on_close() {
        let directory = FakeDirectory::new();
        let domain = domain(
            &directory,
            PollingPolicy {
                interval_ms: 20,
                acceleration: 2.0,
                max_interval_ms: 40,
            },
        );
        let (conn, mut peer) = connection_pair().await;
        domain.register_connection(conn).await;
        domain.open().await;
        assert!(propagated_keys(&next_frame(&mut peer).await).is_empty());

        directory.add(endpoint("Echo", "EchoA", "a1", None));
        assert_eq!(propagated_keys(&next_frame(&mut peer).await).len(), 1);

        domain.close().await;
        let _ = next_frame(&mut peer).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let lookups = directory.lookups();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(directory.lookups(), lookups);
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pending_exchanges() {
        let directory = FakeDirectory::new();
        let dispatcher = RecordingDispatcher::new();
        let domain = InboundDomain::new(
            config(vec![offer("Echo")], no_polling()),
            directory,
            dispatcher.clone(),
        );
        let (conn, _peer) = connection_pair().await;
        domain.register_connection(Arc::clone(&conn)).await;

        domain
            .relay()
            .send(
                &conn,
                "ex-1",
                Step::New(NewExchange {
                    service: ServiceKey::service("Echo", "EchoA"),
                    operation: "echo".into(),
                    pattern: buslink_types::ExchangePattern::InOut,
                    payload: None,
                }),
                ExchangeHandle("h".into()),
                FlowContext::new_root(),
            )
            .await;

        domain.on_closed(&conn, None).await;
        assert!(domain.status().connections.is_empty());
        let (delivery, _) = dispatcher.next().await;
        assert!(matches!(
            delivery.step,
            Step::Error(ExchangeFault::Transport(_))
        ));
    }
}
