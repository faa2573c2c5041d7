//! In-process message bus.
//!
//! `LocalBus` is the smallest bus the gateway can run against: a static table
//! of hosted endpoints answered by a [`ServiceProvider`], plus a table of the
//! proxy endpoints mirrored from remote peers. It implements all three
//! collaborator traits, so a gateway process can bridge two buses without an
//! external bus runtime.

use async_trait::async_trait;
use buslink_types::config::LocalServiceConfig;
use buslink_types::{
    Delivery, ExchangeFault, ExchangeHandle, ExchangePattern, FlowContext, LocalEndpoint,
    NewExchange, RegistrationHandle, ServiceKey, Step, StepStatus,
};
use buslink_wire::{BusDispatcher, Directory, ProxyEndpoint, Registrar, Replier};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Answers exchanges addressed to endpoints hosted by a [`LocalBus`].
pub trait ServiceProvider: Send + Sync + 'static {
    /// Handle one request. `Ok(None)` answers without a payload; `Err` is
    /// reported to the caller as a remote fault.
    fn handle(
        &self,
        endpoint: &LocalEndpoint,
        operation: &str,
        payload: Option<String>,
    ) -> Result<Option<String>, String>;
}

/// Answers every request with its own payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProvider;

impl ServiceProvider for EchoProvider {
    fn handle(
        &self,
        _endpoint: &LocalEndpoint,
        _operation: &str,
        payload: Option<String>,
    ) -> Result<Option<String>, String> {
        Ok(payload)
    }
}

/// A proxy endpoint currently active on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub key: ServiceKey,
    pub endpoint: String,
    pub description: Option<String>,
}

struct ProxyRegistration {
    proxy: ProxyEndpoint,
    description: Option<String>,
}

type CallOutcome = Result<Option<String>, ExchangeFault>;

/// A self-contained bus hosting a fixed set of endpoints.
pub struct LocalBus {
    services: RwLock<Vec<LocalEndpoint>>,
    provider: Arc<dyn ServiceProvider>,
    proxies: DashMap<RegistrationHandle, ProxyRegistration>,
    calls: DashMap<ExchangeHandle, oneshot::Sender<CallOutcome>>,
    next_id: AtomicU64,
    weak_self: Weak<LocalBus>,
}

impl LocalBus {
    pub fn new(services: Vec<LocalEndpoint>, provider: Arc<dyn ServiceProvider>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            services: RwLock::new(services),
            provider,
            proxies: DashMap::new(),
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    /// Host the configured services, answering with [`EchoProvider`].
    pub fn from_config(services: &[LocalServiceConfig]) -> Arc<Self> {
        let endpoints = services
            .iter()
            .map(|s| LocalEndpoint {
                interface: s.interface.clone(),
                service: s.service.clone(),
                endpoint: s.endpoint.clone(),
                description: s.description.clone(),
            })
            .collect();
        Self::new(endpoints, Arc::new(EchoProvider))
    }

    /// Start hosting an endpoint. Inbound domains see it on their next refresh.
    pub fn add_service(&self, endpoint: LocalEndpoint) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.retain(|s| {
            !(s.interface == endpoint.interface
                && s.service == endpoint.service
                && s.endpoint == endpoint.endpoint)
        });
        services.push(endpoint);
    }

    /// Stop hosting an endpoint. Returns whether it was hosted.
    pub fn remove_service(&self, interface: &str, service: &str, endpoint: &str) -> bool {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let before = services.len();
        services.retain(|s| {
            !(s.interface == interface && s.service == service && s.endpoint == endpoint)
        });
        services.len() != before
    }

    pub fn services(&self) -> Vec<LocalEndpoint> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Proxy endpoints mirrored from remote peers.
    pub fn proxies(&self) -> Vec<ProxyInfo> {
        let mut proxies: Vec<ProxyInfo> = self
            .proxies
            .iter()
            .map(|r| ProxyInfo {
                key: r.proxy.key().clone(),
                endpoint: r.proxy.endpoint_name().to_string(),
                description: r.description.clone(),
            })
            .collect();
        proxies.sort_by(|a, b| a.key.cmp(&b.key));
        proxies
    }

    /// Invoke the remote service mirrored under `key` and wait for its answer.
    ///
    /// Returns the response payload for request-response patterns and
    /// `None` once one-way exchanges are acknowledged. If `timeout` elapses
    /// first, the peer is told and `Timeout` is returned.
    pub async fn call(
        &self,
        key: &ServiceKey,
        operation: &str,
        pattern: ExchangePattern,
        payload: Option<String>,
        timeout: Duration,
    ) -> CallOutcome {
        let proxy = self
            .proxy_for(key)
            .ok_or_else(|| ExchangeFault::Unavailable(format!("no proxy endpoint for {key}")))?;

        let handle = self.next_handle();
        let (tx, rx) = oneshot::channel();
        self.calls.insert(handle.clone(), tx);

        let exchange_id = match proxy
            .invoke(handle.clone(), FlowContext::new_root(), operation, pattern, payload)
            .await
        {
            Ok(id) => id,
            Err(fault) => {
                self.calls.remove(&handle);
                return Err(fault);
            }
        };
        debug!(key = %key, exchange = %exchange_id, "Call started");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExchangeFault::Transport("exchange abandoned".to_string())),
            Err(_) => {
                self.calls.remove(&handle);
                proxy.timeout(&exchange_id).await;
                Err(ExchangeFault::Timeout)
            }
        }
    }

    fn proxy_for(&self, key: &ServiceKey) -> Option<ProxyEndpoint> {
        self.proxies
            .iter()
            .find(|r| r.proxy.key() == key)
            .map(|r| r.proxy.clone())
    }

    fn find_endpoint(&self, key: &ServiceKey) -> Option<LocalEndpoint> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| key.covers(&ServiceKey::endpoint(&s.interface, &s.service, &s.endpoint)))
            .cloned()
    }

    fn next_handle(&self) -> ExchangeHandle {
        ExchangeHandle(format!(
            "local-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn complete(&self, handle: &ExchangeHandle, outcome: CallOutcome) -> bool {
        match self.calls.remove(handle) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    async fn deliver(&self, delivery: Delivery, replier: Replier) {
        let Delivery {
            exchange_id,
            handle,
            step,
            ..
        } = delivery;

        match (step, handle) {
            (Step::New(new), _) => self.serve(&exchange_id, new, replier).await,
            (step, None) => {
                warn!(exchange = %exchange_id, step = step.name(), "Follow-up step without a handle; dropped");
            }
            (Step::Middle { payload, status }, Some(handle)) => {
                if self.complete(&handle, step_outcome(payload, status)) {
                    replier.send_last(handle, None, StepStatus::Done).await;
                } else {
                    debug!(exchange = %exchange_id, "Response for an abandoned call");
                    replier
                        .send_error(handle, ExchangeFault::Unavailable("caller gone".into()))
                        .await;
                }
            }
            (Step::Last { payload, status }, Some(handle)) => {
                if !self.complete(&handle, step_outcome(payload, status)) {
                    debug!(exchange = %exchange_id, "Exchange completed");
                }
            }
            (Step::Error(fault), Some(handle)) => {
                if !self.complete(&handle, Err(fault.clone())) {
                    debug!(exchange = %exchange_id, fault = %fault, "Exchange failed");
                }
            }
        }
    }

    /// Answer a new exchange from a hosted endpoint.
    async fn serve(&self, exchange_id: &str, new: NewExchange, replier: Replier) {
        let handle = self.next_handle();
        let Some(endpoint) = self.find_endpoint(&new.service) else {
            warn!(exchange = %exchange_id, service = %new.service, "No local endpoint for exchange");
            let fault = ExchangeFault::Remote(format!("no endpoint for {}", new.service));
            replier.send_error(handle, fault).await;
            return;
        };
        match self.provider.handle(&endpoint, &new.operation, new.payload) {
            Ok(out) if new.pattern.expects_response() => {
                replier.send_middle(handle, out, StepStatus::Active).await
            }
            Ok(_) => replier.send_last(handle, None, StepStatus::Done).await,
            Err(reason) => {
                replier
                    .send_error(handle, ExchangeFault::Remote(reason))
                    .await
            }
        }
    }
}

fn step_outcome(payload: Option<String>, status: StepStatus) -> CallOutcome {
    match status {
        StepStatus::Fault => Err(ExchangeFault::Remote(payload.unwrap_or_default())),
        StepStatus::Active | StepStatus::Done => Ok(payload),
    }
}

#[async_trait]
impl Directory for LocalBus {
    async fn lookup(
        &self,
        interface: &str,
        service: Option<&str>,
        endpoint: Option<&str>,
    ) -> Vec<LocalEndpoint> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.interface == interface)
            .filter(|s| service.map_or(true, |name| s.service == name))
            .filter(|s| endpoint.map_or(true, |name| s.endpoint == name))
            .cloned()
            .collect()
    }
}

impl Registrar for LocalBus {
    fn register(
        &self,
        key: &ServiceKey,
        endpoint_name: &str,
        proxy: ProxyEndpoint,
        description: Option<&str>,
    ) -> Result<RegistrationHandle, String> {
        if self
            .proxies
            .iter()
            .any(|r| r.proxy.endpoint_name() == endpoint_name)
        {
            return Err(format!("endpoint name '{endpoint_name}' is already in use"));
        }
        let handle = RegistrationHandle(format!(
            "proxy-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        info!(key = %key, endpoint = %endpoint_name, "Proxy endpoint activated");
        self.proxies.insert(
            handle.clone(),
            ProxyRegistration {
                proxy,
                description: description.map(str::to_string),
            },
        );
        Ok(handle)
    }

    fn deregister(&self, handle: &RegistrationHandle) -> Result<(), String> {
        match self.proxies.remove(handle) {
            Some((_, registration)) => {
                info!(
                    key = %registration.proxy.key(),
                    endpoint = %registration.proxy.endpoint_name(),
                    "Proxy endpoint withdrawn"
                );
                Ok(())
            }
            None => Err(format!("unknown registration '{}'", handle.0)),
        }
    }
}

impl BusDispatcher for LocalBus {
    fn dispatch(&self, delivery: Delivery, replier: Replier) {
        let Some(bus) = self.weak_self.upgrade() else {
            warn!(exchange = %delivery.exchange_id, "Bus has shut down; delivery dropped");
            return;
        };
        tokio::spawn(async move { bus.deliver(delivery, replier).await });
    }
}
