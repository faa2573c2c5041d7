//! In-memory collaborators and socket helpers shared by the unit tests.

use crate::bus::{BusDispatcher, Directory, Registrar};
use crate::connection::{read_frame, Connection};
use crate::message::Frame;
use crate::outbound::ProxyEndpoint;
use crate::relay::Replier;
use crate::transport::{split, BoxReader, BoxStream};

use async_trait::async_trait;
use buslink_types::{Delivery, LocalEndpoint, RegistrationHandle, ServiceKey};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Records every dispatched step.
pub(crate) struct RecordingDispatcher {
    tx: mpsc::UnboundedSender<(Delivery, Replier)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Delivery, Replier)>>,
    count: AtomicUsize,
}

impl RecordingDispatcher {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            count: AtomicUsize::new(0),
        })
    }

    pub(crate) async fn next(&self) -> (Delivery, Replier) {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no delivery in time")
            .expect("dispatcher channel closed")
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl BusDispatcher for RecordingDispatcher {
    fn dispatch(&self, delivery: Delivery, replier: Replier) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send((delivery, replier));
    }
}

/// A directory whose contents tests change at will.
///
/// `hold()` makes the next lookups park until `release()`.
#[derive(Default)]
pub(crate) struct FakeDirectory {
    endpoints: Mutex<Vec<LocalEndpoint>>,
    lookups: AtomicUsize,
    held: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl FakeDirectory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set(&self, endpoints: Vec<LocalEndpoint>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }

    pub(crate) fn add(&self, endpoint: LocalEndpoint) {
        self.endpoints.lock().unwrap().push(endpoint);
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn hold(&self) {
        *self.held.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub(crate) async fn wait_entered(&self) {
        tokio::time::timeout(WAIT, self.entered.notified())
            .await
            .expect("lookup never started");
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = self.held.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn lookup(
        &self,
        interface: &str,
        service: Option<&str>,
        endpoint: Option<&str>,
    ) -> Vec<LocalEndpoint> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let gate = self.held.lock().unwrap().clone();
        if let Some(gate) = gate {
            let released = gate.notified();
            self.entered.notify_one();
            released.await;
        }
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.interface == interface)
            .filter(|e| service.map_or(true, |s| e.service == s))
            .filter(|e| endpoint.map_or(true, |n| e.endpoint == n))
            .cloned()
            .collect()
    }
}

pub(crate) fn endpoint(interface: &str, service: &str, name: &str, description: Option<&str>) -> LocalEndpoint {
    LocalEndpoint {
        interface: interface.to_string(),
        service: service.to_string(),
        endpoint: name.to_string(),
        description: description.map(str::to_string),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegistrarEvent {
    Register {
        key: ServiceKey,
        endpoint: String,
        description: Option<String>,
    },
    Deregister {
        key: ServiceKey,
    },
}

/// Records registrations; can be told to refuse particular keys.
#[derive(Default)]
pub(crate) struct FakeRegistrar {
    events: Mutex<Vec<RegistrarEvent>>,
    active: Mutex<HashMap<String, (ServiceKey, ProxyEndpoint)>>,
    refuse: Mutex<HashSet<ServiceKey>>,
    next: AtomicUsize,
}

impl FakeRegistrar {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn refuse(&self, key: ServiceKey) {
        self.refuse.lock().unwrap().insert(key);
    }

    pub(crate) fn allow_all(&self) {
        self.refuse.lock().unwrap().clear();
    }

    pub(crate) fn events(&self) -> Vec<RegistrarEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub(crate) fn active_keys(&self) -> HashSet<ServiceKey> {
        self.active
            .lock()
            .unwrap()
            .values()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn proxy(&self, key: &ServiceKey) -> Option<ProxyEndpoint> {
        self.active
            .lock()
            .unwrap()
            .values()
            .find(|(k, _)| k == key)
            .map(|(_, proxy)| proxy.clone())
    }
}

impl Registrar for FakeRegistrar {
    fn register(
        &self,
        key: &ServiceKey,
        endpoint_name: &str,
        proxy: ProxyEndpoint,
        description: Option<&str>,
    ) -> Result<RegistrationHandle, String> {
        if self.refuse.lock().unwrap().contains(key) {
            return Err(format!("refused {key}"));
        }
        let handle = format!("reg-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.active
            .lock()
            .unwrap()
            .insert(handle.clone(), (key.clone(), proxy));
        self.events.lock().unwrap().push(RegistrarEvent::Register {
            key: key.clone(),
            endpoint: endpoint_name.to_string(),
            description: description.map(str::to_string),
        });
        Ok(RegistrationHandle(handle))
    }

    fn deregister(&self, handle: &RegistrationHandle) -> Result<(), String> {
        let (key, _) = self
            .active
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or_else(|| format!("unknown registration {}", handle.0))?;
        self.events
            .lock()
            .unwrap()
            .push(RegistrarEvent::Deregister { key });
        Ok(())
    }
}

/// Two ends of a loopback TCP socket.
pub(crate) async fn stream_pair() -> (BoxStream, BoxStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (Box::new(client.unwrap()), Box::new(server.unwrap().0))
}

/// A connection plus a reader on the far end that sees what it sends.
pub(crate) async fn connection_pair() -> (Arc<Connection>, BoxReader) {
    let (near, far) = stream_pair().await;
    let (_near_reader, near_writer) = split(near);
    let (far_reader, _far_writer) = split(far);
    let conn = Connection::new("127.0.0.1:1".parse().unwrap(), near_writer);
    (conn, far_reader)
}

/// A connection that refuses every write.
pub(crate) async fn closed_connection() -> Arc<Connection> {
    let (conn, _far) = connection_pair().await;
    conn.close().await;
    conn
}

/// Read the next frame or fail the test.
pub(crate) async fn next_frame(reader: &mut BoxReader) -> Frame {
    tokio::time::timeout(WAIT, read_frame(reader))
        .await
        .expect("no frame in time")
        .expect("read failed")
}

/// Assert nothing arrives within `ms`.
pub(crate) async fn assert_silent(reader: &mut BoxReader, ms: u64) {
    if let Ok(result) = tokio::time::timeout(Duration::from_millis(ms), read_frame(reader)).await {
        panic!("unexpected frame: {result:?}");
    }
}

/// Keys carried by a propagation frame.
pub(crate) fn propagated_keys(frame: &Frame) -> Vec<ServiceKey> {
    match frame {
        Frame::Propagation { services } => services.iter().map(|s| s.key.clone()).collect(),
        other => panic!("expected propagation, got {other:?}"),
    }
}
