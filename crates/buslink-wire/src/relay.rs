//! Exchange relay: correlates wire exchange steps with local exchanges.
//!
//! Each domain owns one [`ExchangeRelay`]. When a non-final step leaves the
//! gateway, the local exchange handle and its flow context are parked under
//! the exchange id; the peer's answer takes them back out and the step is
//! handed to the local bus with a [`Replier`] for the next move. At most one
//! entry exists per id, and final steps are never parked.

use crate::bus::BusDispatcher;
use crate::connection::{Connection, ConnectionId};
use crate::message::Frame;

use buslink_types::{
    Delivery, ExchangeFault, ExchangeHandle, FlowContext, NewExchange, Step, StepStatus,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

struct PendingExchange {
    handle: ExchangeHandle,
    flow: FlowContext,
    connection: Arc<Connection>,
}

/// Correlation table plus the glue between wire frames and the local bus.
pub struct ExchangeRelay {
    domain: String,
    dispatcher: Arc<dyn BusDispatcher>,
    pending: Mutex<HashMap<String, PendingExchange>>,
}

impl ExchangeRelay {
    pub fn new(domain: impl Into<String>, dispatcher: Arc<dyn BusDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.into(),
            dispatcher,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Number of exchanges waiting for the peer.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, exchange_id: &str) -> bool {
        self.lock().contains_key(exchange_id)
    }

    /// Handle an exchange frame that arrived on `connection`.
    pub fn receive(self: &Arc<Self>, connection: &Arc<Connection>, frame: Frame) {
        let (id, step, origin) = match frame {
            Frame::ExchangeNew {
                id,
                service,
                flow,
                operation,
                pattern,
                payload,
            } => (
                id,
                Step::New(NewExchange {
                    service,
                    operation,
                    pattern,
                    payload,
                }),
                Some(flow),
            ),
            Frame::ExchangeMiddle {
                id,
                payload,
                status,
            } => (id, Step::Middle { payload, status }, None),
            Frame::ExchangeLast {
                id,
                payload,
                status,
            } => (id, Step::Last { payload, status }, None),
            Frame::ExchangeError { id, info } => (id, Step::Error(ExchangeFault::Remote(info)), None),
            Frame::Timeout { id } => (id, Step::Error(ExchangeFault::Timeout), None),
            other => {
                warn!(
                    domain = %self.domain,
                    frame = other.kind(),
                    "Relay received a non-exchange frame; ignored"
                );
                return;
            }
        };
        self.deliver(connection, id, step, origin);
    }

    fn deliver(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        exchange_id: String,
        step: Step,
        origin: Option<FlowContext>,
    ) {
        let prior = self.lock().remove(&exchange_id);
        let (handle, flow) = match (origin, prior) {
            (Some(origin), prior) => {
                if let Some(prior) = prior {
                    warn!(
                        domain = %self.domain,
                        exchange = %exchange_id,
                        "New exchange reuses a pending id; failing the stale exchange"
                    );
                    self.fail_pending(exchange_id.clone(), prior, "exchange id reused by peer");
                }
                (None, origin.child())
            }
            (None, Some(prior)) => (Some(prior.handle), prior.flow),
            (None, None) => {
                if step == Step::Error(ExchangeFault::Timeout) {
                    debug!(
                        domain = %self.domain,
                        exchange = %exchange_id,
                        "Peer timed out an exchange with no pending step"
                    );
                } else {
                    warn!(
                        domain = %self.domain,
                        exchange = %exchange_id,
                        step = step.name(),
                        "No pending exchange for step; dropped"
                    );
                }
                return;
            }
        };

        let replier = Replier {
            relay: Arc::clone(self),
            connection: Arc::clone(connection),
            exchange_id: exchange_id.clone(),
            flow: flow.clone(),
        };
        self.dispatcher.dispatch(
            Delivery {
                exchange_id,
                handle,
                flow,
                step,
            },
            replier,
        );
    }

    /// Send one step of an exchange over `connection`.
    ///
    /// Non-final steps are parked before the write. If the write of a
    /// non-final step fails, the local side is completed with a transport
    /// error as though the peer had answered with one.
    pub async fn send(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        exchange_id: &str,
        step: Step,
        handle: ExchangeHandle,
        flow: FlowContext,
    ) {
        let expects_reply = step.expects_reply();
        let frame = step_frame(exchange_id, &step, &flow);

        if expects_reply {
            let previous = self.lock().insert(
                exchange_id.to_string(),
                PendingExchange {
                    handle,
                    flow,
                    connection: Arc::clone(connection),
                },
            );
            if let Some(previous) = previous {
                error!(
                    domain = %self.domain,
                    exchange = %exchange_id,
                    "Exchange already had a pending step; failing the replaced one"
                );
                self.fail_pending(exchange_id.to_string(), previous, "exchange step replaced");
            }
        }

        if let Err(e) = connection.send(&frame).await {
            if expects_reply {
                warn!(
                    domain = %self.domain,
                    exchange = %exchange_id,
                    step = step.name(),
                    error = %e,
                    "Failed to send exchange step; failing it locally"
                );
                self.deliver(
                    connection,
                    exchange_id.to_string(),
                    Step::Error(ExchangeFault::Transport(e.to_string())),
                    None,
                );
            } else {
                warn!(
                    domain = %self.domain,
                    exchange = %exchange_id,
                    step = step.name(),
                    error = %e,
                    "Failed to send final exchange step"
                );
            }
        }
    }

    /// Give up waiting on a pending exchange.
    ///
    /// Returns `false` if nothing was pending under `exchange_id`.
    pub async fn timeout(self: &Arc<Self>, exchange_id: &str) -> bool {
        let pending = self.lock().remove(exchange_id);
        match pending {
            Some(p) => {
                self.signal_timeout(&p.connection, exchange_id, p.handle, p.flow)
                    .await;
                true
            }
            None => false,
        }
    }

    async fn signal_timeout(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        exchange_id: &str,
        handle: ExchangeHandle,
        flow: FlowContext,
    ) {
        let frame = Frame::Timeout {
            id: exchange_id.to_string(),
        };
        if let Err(e) = connection.send(&frame).await {
            warn!(
                domain = %self.domain,
                exchange = %exchange_id,
                error = %e,
                "Failed to send timeout"
            );
        }
        let replier = Replier {
            relay: Arc::clone(self),
            connection: Arc::clone(connection),
            exchange_id: exchange_id.to_string(),
            flow: flow.clone(),
        };
        self.dispatcher.dispatch(
            Delivery {
                exchange_id: exchange_id.to_string(),
                handle: Some(handle),
                flow,
                step: Step::Error(ExchangeFault::Timeout),
            },
            replier,
        );
    }

    /// Fail every exchange parked on a connection that went away.
    pub fn fail_connection(self: &Arc<Self>, connection: &Arc<Connection>) -> usize {
        let lost = self.take_for(connection.id());
        let count = lost.len();
        for (exchange_id, pending) in lost {
            self.fail_pending(exchange_id, pending, "connection lost");
        }
        if count > 0 {
            warn!(
                domain = %self.domain,
                connection = %connection.id(),
                count,
                "Failed pending exchanges of a lost connection"
            );
        }
        count
    }

    /// Complete a parked exchange locally with a transport error.
    fn fail_pending(self: &Arc<Self>, exchange_id: String, pending: PendingExchange, reason: &str) {
        let replier = Replier {
            relay: Arc::clone(self),
            connection: Arc::clone(&pending.connection),
            exchange_id: exchange_id.clone(),
            flow: pending.flow.clone(),
        };
        self.dispatcher.dispatch(
            Delivery {
                exchange_id,
                handle: Some(pending.handle),
                flow: pending.flow,
                step: Step::Error(ExchangeFault::Transport(reason.to_string())),
            },
            replier,
        );
    }

    fn take_for(&self, connection: ConnectionId) -> Vec<(String, PendingExchange)> {
        let mut pending = self.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.connection.id() == connection)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingExchange>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn step_frame(exchange_id: &str, step: &Step, flow: &FlowContext) -> Frame {
    let id = exchange_id.to_string();
    match step {
        Step::New(new) => Frame::ExchangeNew {
            id,
            service: new.service.clone(),
            flow: flow.clone(),
            operation: new.operation.clone(),
            pattern: new.pattern,
            payload: new.payload.clone(),
        },
        Step::Middle { payload, status } => Frame::ExchangeMiddle {
            id,
            payload: payload.clone(),
            status: *status,
        },
        Step::Last { payload, status } => Frame::ExchangeLast {
            id,
            payload: payload.clone(),
            status: *status,
        },
        Step::Error(fault) => Frame::error(id, fault),
    }
}

/// Sends the next step of one exchange back to the peer.
///
/// Handed to the bus dispatcher with every delivery; consumed by use.
pub struct Replier {
    relay: Arc<ExchangeRelay>,
    connection: Arc<Connection>,
    exchange_id: String,
    flow: FlowContext,
}

impl Replier {
    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn flow(&self) -> &FlowContext {
        &self.flow
    }

    /// Answer with a non-final step; the peer's next step comes back to `handle`.
    pub async fn send_middle(self, handle: ExchangeHandle, payload: Option<String>, status: StepStatus) {
        self.send(handle, Step::Middle { payload, status }).await;
    }

    /// Complete the exchange.
    pub async fn send_last(self, handle: ExchangeHandle, payload: Option<String>, status: StepStatus) {
        self.send(handle, Step::Last { payload, status }).await;
    }

    /// Complete the exchange with an error.
    pub async fn send_error(self, handle: ExchangeHandle, fault: ExchangeFault) {
        self.send(handle, Step::Error(fault)).await;
    }

    /// Abandon the exchange: notify the peer, then fail `handle` locally.
    pub async fn timeout(self, handle: ExchangeHandle) {
        self.relay
            .signal_timeout(&self.connection, &self.exchange_id, handle, self.flow)
            .await;
    }

    async fn send(self, handle: ExchangeHandle, step: Step) {
        self.relay
            .send(&self.connection, &self.exchange_id, step, handle, self.flow)
            .await;
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("exchange_id", &self.exchange_id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::read_frame;
    use crate::test_support::{closed_connection, connection_pair, RecordingDispatcher};
    use buslink_types::{ExchangePattern, ServiceKey};

    fn new_step() -> Step {
        Step::New(NewExchange {
            service: ServiceKey::service("Echo", "EchoService"),
            operation: "echo".into(),
            pattern: ExchangePattern::InOut,
            payload: Some("<ping/>".into()),
        })
    }

    fn handle(s: &str) -> ExchangeHandle {
        ExchangeHandle(s.to_string())
    }

    #[tokio::test]
    async fn test_new_step_parked_and_reply_restores_context() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, mut peer) = connection_pair().await;
        let flow = FlowContext::new_root();

        relay
            .send(&conn, "ex-1", new_step(), handle("h-1"), flow.clone())
            .await;
        assert!(relay.is_pending("ex-1"));
        match read_frame(&mut peer).await.unwrap() {
            Frame::ExchangeNew { id, flow: sent, .. } => {
                assert_eq!(id, "ex-1");
                assert_eq!(sent, flow);
            }
            other => panic!("Expected ExchangeNew, got {other:?}"),
        }

        relay.receive(
            &conn,
            Frame::ExchangeMiddle {
                id: "ex-1".into(),
                payload: Some("<pong/>".into()),
                status: StepStatus::Active,
            },
        );
        assert_eq!(relay.pending_count(), 0);
        let (delivery, replier) = dispatcher.next().await;
        assert_eq!(delivery.handle, Some(handle("h-1")));
        assert_eq!(delivery.flow, flow);
        assert_eq!(replier.exchange_id(), "ex-1");
        assert!(matches!(delivery.step, Step::Middle { .. }));
    }

    #[tokio::test]
    async fn test_incoming_new_derives_child_flow() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, _peer) = connection_pair().await;
        let origin = FlowContext::new_root();

        relay.receive(
            &conn,
            Frame::ExchangeNew {
                id: "ex-2".into(),
                service: ServiceKey::service("Echo", "EchoService"),
                flow: origin.clone(),
                operation: "echo".into(),
                pattern: ExchangePattern::InOnly,
                payload: None,
            },
        );
        let (delivery, _) = dispatcher.next().await;
        assert!(delivery.handle.is_none());
        assert_eq!(delivery.flow.instance_id, origin.instance_id);
        assert_eq!(delivery.flow.parent_step_id, Some(origin.step_id));
        assert!(matches!(delivery.step, Step::New(_)));
    }

    #[tokio::test]
    async fn test_reused_id_fails_the_pending_exchange() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, _peer) = connection_pair().await;

        relay
            .send(&conn, "ex-1", new_step(), handle("h-1"), FlowContext::new_root())
            .await;
        relay.receive(
            &conn,
            Frame::ExchangeNew {
                id: "ex-1".into(),
                service: ServiceKey::service("Echo", "EchoService"),
                flow: FlowContext::new_root(),
                operation: "echo".into(),
                pattern: ExchangePattern::InOut,
                payload: None,
            },
        );

        let (failed, _) = dispatcher.next().await;
        assert_eq!(failed.handle, Some(handle("h-1")));
        assert!(matches!(failed.step, Step::Error(ExchangeFault::Transport(_))));
        let (incoming, _) = dispatcher.next().await;
        assert!(incoming.handle.is_none());
        assert!(matches!(incoming.step, Step::New(_)));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_replaced_pending_step_is_failed() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, _peer) = connection_pair().await;

        relay
            .send(&conn, "ex-1", new_step(), handle("h-1"), FlowContext::new_root())
            .await;
        relay
            .send(&conn, "ex-1", new_step(), handle("h-2"), FlowContext::new_root())
            .await;

        let (failed, _) = dispatcher.next().await;
        assert_eq!(failed.handle, Some(handle("h-1")));
        assert!(matches!(failed.step, Step::Error(ExchangeFault::Transport(_))));
        assert_eq!(dispatcher.count(), 1);
        assert!(relay.is_pending("ex-1"));
    }

    #[tokio::test]
    async fn test_later_step_without_entry_is_dropped() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, _peer) = connection_pair().await;

        relay.receive(
            &conn,
            Frame::ExchangeLast {
                id: "unknown".into(),
                payload: None,
                status: StepStatus::Done,
            },
        );
        relay.receive(&conn, Frame::Timeout { id: "unknown".into() });
        assert_eq!(dispatcher.count(), 0);
    }

    #[tokio::test]
    async fn test_final_steps_are_not_parked() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, mut peer) = connection_pair().await;

        relay
            .send(
                &conn,
                "ex-3",
                Step::Last {
                    payload: None,
                    status: StepStatus::Done,
                },
                handle("h-3"),
                FlowContext::new_root(),
            )
            .await;
        relay
            .send(
                &conn,
                "ex-4",
                Step::Error(ExchangeFault::Remote("boom".into())),
                handle("h-4"),
                FlowContext::new_root(),
            )
            .await;
        assert_eq!(relay.pending_count(), 0);
        assert!(matches!(
            read_frame(&mut peer).await.unwrap(),
            Frame::ExchangeLast { .. }
        ));
        assert!(matches!(
            read_frame(&mut peer).await.unwrap(),
            Frame::ExchangeError { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_non_final_write_fails_locally() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let conn = closed_connection().await;

        relay
            .send(&conn, "ex-5", new_step(), handle("h-5"), FlowContext::new_root())
            .await;
        assert_eq!(relay.pending_count(), 0);
        let (delivery, _) = dispatcher.next().await;
        assert_eq!(delivery.handle, Some(handle("h-5")));
        assert!(matches!(
            delivery.step,
            Step::Error(ExchangeFault::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_final_write_is_only_logged() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let conn = closed_connection().await;

        relay
            .send(
                &conn,
                "ex-6",
                Step::Last {
                    payload: None,
                    status: StepStatus::Done,
                },
                handle("h-6"),
                FlowContext::new_root(),
            )
            .await;
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_notifies_peer_and_local_side() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, mut peer) = connection_pair().await;

        relay
            .send(&conn, "ex-7", new_step(), handle("h-7"), FlowContext::new_root())
            .await;
        let _ = read_frame(&mut peer).await.unwrap();

        assert!(relay.timeout("ex-7").await);
        assert!(!relay.timeout("ex-7").await);
        assert_eq!(
            read_frame(&mut peer).await.unwrap(),
            Frame::Timeout { id: "ex-7".into() }
        );
        let (delivery, _) = dispatcher.next().await;
        assert_eq!(delivery.handle, Some(handle("h-7")));
        assert_eq!(delivery.step, Step::Error(ExchangeFault::Timeout));
    }

    #[tokio::test]
    async fn test_replier_round_trip() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn, mut peer) = connection_pair().await;

        relay.receive(
            &conn,
            Frame::ExchangeNew {
                id: "ex-8".into(),
                service: ServiceKey::service("Echo", "EchoService"),
                flow: FlowContext::new_root(),
                operation: "echo".into(),
                pattern: ExchangePattern::InOut,
                payload: Some("<ping/>".into()),
            },
        );
        let (_, replier) = dispatcher.next().await;
        replier
            .send_middle(handle("provider-8"), Some("<pong/>".into()), StepStatus::Active)
            .await;
        assert!(relay.is_pending("ex-8"));
        assert!(matches!(
            read_frame(&mut peer).await.unwrap(),
            Frame::ExchangeMiddle { .. }
        ));

        relay.receive(
            &conn,
            Frame::ExchangeLast {
                id: "ex-8".into(),
                payload: None,
                status: StepStatus::Done,
            },
        );
        let (delivery, _) = dispatcher.next().await;
        assert_eq!(delivery.handle, Some(handle("provider-8")));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_connection_completes_pending() {
        let dispatcher = RecordingDispatcher::new();
        let relay = ExchangeRelay::new("d", dispatcher.clone());
        let (conn_a, _peer_a) = connection_pair().await;
        let (conn_b, _peer_b) = connection_pair().await;

        relay
            .send(&conn_a, "a-1", new_step(), handle("ha-1"), FlowContext::new_root())
            .await;
        relay
            .send(&conn_a, "a-2", new_step(), handle("ha-2"), FlowContext::new_root())
            .await;
        relay
            .send(&conn_b, "b-1", new_step(), handle("hb-1"), FlowContext::new_root())
            .await;

        assert_eq!(relay.fail_connection(&conn_a), 2);
        assert_eq!(relay.pending_count(), 1);
        assert!(relay.is_pending("b-1"));
        for _ in 0..2 {
            let (delivery, _) = dispatcher.next().await;
            assert!(matches!(
                delivery.step,
                Step::Error(ExchangeFault::Transport(_))
            ));
        }
    }
}
