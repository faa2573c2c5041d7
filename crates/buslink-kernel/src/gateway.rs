//! Gateway assembly: listeners, inbound and outbound domains from one config.
//!
//! Domains are started independently: a listener that fails to bind or an
//! outbound domain whose proxies cannot be registered is logged and reported,
//! and every other domain still starts.

use crate::error::GatewayResult;
use crate::local_bus::LocalBus;
use crate::supervisor::Supervisor;

use buslink_types::config::GatewayConfig;
use buslink_types::{BridgeError, BridgeResult};
use buslink_wire::{
    BusDispatcher, CredentialRegistry, Directory, InboundDomain, InboundDomainStatus, Listener,
    ListenerStatus, OutboundDomain, OutboundDomainStatus, Registrar, TlsProvider,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// What the gateway needs from the bus it is embedded in.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn Directory>,
    pub registrar: Arc<dyn Registrar>,
    pub dispatcher: Arc<dyn BusDispatcher>,
    /// Required only when some domain is configured with TLS material.
    pub tls: Option<Arc<dyn TlsProvider>>,
}

impl Collaborators {
    /// Use an in-process [`LocalBus`] for all three bus roles.
    pub fn local(bus: &Arc<LocalBus>) -> Self {
        Self {
            directory: bus.clone(),
            registrar: bus.clone(),
            dispatcher: bus.clone(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// A component that did not come up.
#[derive(Debug, Clone, Serialize)]
pub struct StartFailure {
    pub component: String,
    pub error: String,
}

/// Outcome of [`Gateway::start`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub listeners_up: usize,
    pub inbound_open: usize,
    pub outbound_registered: usize,
    pub failures: Vec<StartFailure>,
}

impl StartReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, component: String, error: impl ToString) {
        self.failures.push(StartFailure {
            component,
            error: error.to_string(),
        });
    }
}

/// One listener, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    pub name: String,
    pub status: ListenerStatus,
    pub credentials: Vec<String>,
}

/// Aggregated status of every component.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub listeners: Vec<ListenerReport>,
    pub inbound: Vec<InboundDomainStatus>,
    pub outbound: Vec<OutboundDomainStatus>,
}

/// A running set of listeners and domains.
pub struct Gateway {
    registry: Arc<CredentialRegistry>,
    listeners: Vec<Arc<Listener>>,
    inbound: Vec<Arc<InboundDomain>>,
    outbound: Vec<Arc<OutboundDomain>>,
    connect_on_start: Vec<bool>,
    supervisor: Supervisor,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Validate `config` and create every component. Nothing is bound or
    /// connected until [`Gateway::start`].
    pub fn build(config: &GatewayConfig, collaborators: Collaborators) -> GatewayResult<Self> {
        config.validate()?;
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);
        let registry = CredentialRegistry::new();

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            // One TLS domain makes the whole listener TLS.
            let needs_tls = config
                .inbound
                .iter()
                .any(|d| d.listener == listener.name && d.tls.is_some());
            let tls = tls_for(&listener.name, needs_tls, &collaborators)?;
            listeners.push(Listener::new(
                listener.name.clone(),
                listener.bind.clone(),
                Arc::clone(&registry),
                tls,
                handshake_timeout,
            ));
        }

        let mut inbound = Vec::with_capacity(config.inbound.len());
        for domain_config in &config.inbound {
            let listener = listeners
                .iter()
                .find(|l| l.name() == domain_config.listener)
                .ok_or_else(|| BridgeError::UnknownListener {
                    domain: domain_config.name.clone(),
                    listener: domain_config.listener.clone(),
                })?;
            let domain = InboundDomain::new(
                domain_config.clone(),
                Arc::clone(&collaborators.directory),
                Arc::clone(&collaborators.dispatcher),
            );
            listener.register(Arc::clone(&domain))?;
            inbound.push(domain);
        }

        let mut outbound = Vec::with_capacity(config.outbound.len());
        let mut connect_on_start = Vec::with_capacity(config.outbound.len());
        for domain_config in &config.outbound {
            let tls = tls_for(&domain_config.name, domain_config.tls.is_some(), &collaborators)?;
            connect_on_start.push(domain_config.connect_on_start);
            outbound.push(OutboundDomain::new(
                domain_config.clone(),
                Arc::clone(&collaborators.registrar),
                Arc::clone(&collaborators.dispatcher),
                handshake_timeout,
                tls,
            )?);
        }

        Ok(Self {
            registry,
            listeners,
            inbound,
            outbound,
            connect_on_start,
            supervisor: Supervisor::new(),
        })
    }

    /// Bind listeners, open inbound domains, register and connect outbound
    /// domains. Failures are isolated per component and reported.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();

        for listener in &self.listeners {
            match listener.start().await {
                Ok(_) => report.listeners_up += 1,
                Err(e) => report.fail(format!("listener '{}'", listener.name()), e),
            }
        }

        for domain in &self.inbound {
            domain.open().await;
            report.inbound_open += 1;
        }

        for (domain, connect) in self.outbound.iter().zip(&self.connect_on_start) {
            if let Err(e) = domain.register() {
                error!(domain = %domain.name(), error = %e, "Outbound domain failed to start");
                report.fail(format!("outbound domain '{}'", domain.name()), e);
                continue;
            }
            report.outbound_registered += 1;
            if *connect {
                domain.connect(false).await;
            }
        }

        info!(
            listeners = report.listeners_up,
            inbound = report.inbound_open,
            outbound = report.outbound_registered,
            failures = report.failures.len(),
            "Gateway started"
        );
        report
    }

    /// Stop everything: outbound domains withdraw their proxies, inbound
    /// domains send a final empty propagation, listeners stop accepting.
    pub async fn shutdown(&self) {
        for domain in &self.outbound {
            domain.shutdown().await;
        }
        for domain in &self.inbound {
            domain.shutdown().await;
        }
        for listener in &self.listeners {
            listener.stop();
        }
        self.supervisor.shutdown();
        info!("Gateway stopped");
    }

    /// Ask for a shutdown from anywhere; [`Gateway::wait_for_shutdown`] returns.
    pub fn request_shutdown(&self) {
        self.supervisor.shutdown();
    }

    pub async fn wait_for_shutdown(&self) {
        self.supervisor.wait().await;
    }

    /// Re-advertise an inbound domain's services to its peers.
    pub async fn refresh(&self, domain: &str) -> BridgeResult<()> {
        let domain = self
            .inbound(domain)
            .ok_or_else(|| BridgeError::NotFound(format!("inbound domain '{domain}'")))?;
        domain.refresh().await;
        Ok(())
    }

    /// Tear down and re-establish an outbound domain's connection with a
    /// fresh retry budget.
    pub async fn reconnect(&self, domain: &str) -> BridgeResult<()> {
        let domain = self
            .outbound(domain)
            .ok_or_else(|| BridgeError::NotFound(format!("outbound domain '{domain}'")))?;
        domain.connect(true).await;
        Ok(())
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            listeners: self
                .listeners
                .iter()
                .map(|l| ListenerReport {
                    name: l.name().to_string(),
                    status: l.status(),
                    credentials: l.credentials(),
                })
                .collect(),
            inbound: self.inbound.iter().map(|d| d.status()).collect(),
            outbound: self.outbound.iter().map(|d| d.status()).collect(),
        }
    }

    pub fn listener(&self, name: &str) -> Option<&Arc<Listener>> {
        self.listeners.iter().find(|l| l.name() == name)
    }

    pub fn inbound(&self, name: &str) -> Option<&Arc<InboundDomain>> {
        self.inbound.iter().find(|d| d.name() == name)
    }

    pub fn outbound(&self, name: &str) -> Option<&Arc<OutboundDomain>> {
        self.outbound.iter().find(|d| d.name() == name)
    }

    /// Number of credentials accepted across all listeners.
    pub fn credential_count(&self) -> usize {
        self.registry.len()
    }
}

fn tls_for(
    owner: &str,
    needed: bool,
    collaborators: &Collaborators,
) -> BridgeResult<Option<Arc<dyn TlsProvider>>> {
    if !needed {
        return Ok(None);
    }
    collaborators.tls.clone().map(Some).ok_or_else(|| {
        BridgeError::Config(format!(
            "'{owner}' is configured for TLS but no TLS provider is installed"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buslink_types::config::{
        InboundDomainConfig, ListenerConfig, OfferEntry, OutboundDomainConfig, PollingPolicy,
        RetryPolicy, TlsMaterial,
    };
    use buslink_types::{LocalEndpoint, PropagationSnapshot, RegistrationHandle, ServiceKey};
    use buslink_wire::ProxyEndpoint;
    use std::collections::BTreeMap;

    fn listener(name: &str, bind: &str) -> ListenerConfig {
        ListenerConfig {
            name: name.into(),
            bind: bind.into(),
        }
    }

    fn inbound(name: &str, listener: &str, credential: &str) -> InboundDomainConfig {
        InboundDomainConfig {
            name: name.into(),
            listener: listener.into(),
            credential: credential.into(),
            shared_secret: None,
            tls: None,
            polling: PollingPolicy {
                interval_ms: 0,
                ..PollingPolicy::default()
            },
            offers: vec![OfferEntry {
                interface: "Echo".into(),
                service: None,
                endpoint: None,
            }],
        }
    }

    fn outbound(name: &str, remote: &str) -> OutboundDomainConfig {
        OutboundDomainConfig {
            name: name.into(),
            remote: remote.into(),
            credential: "cred".into(),
            shared_secret: None,
            tls: None,
            retry: RetryPolicy {
                max_attempts: 0,
                delay_ms: 10,
            },
            accept_all: true,
            mappings: Vec::new(),
            connect_on_start: false,
        }
    }

    fn bus() -> Arc<LocalBus> {
        LocalBus::new(
            vec![LocalEndpoint {
                interface: "Echo".into(),
                service: "EchoService".into(),
                endpoint: "main".into(),
                description: None,
            }],
            Arc::new(crate::local_bus::EchoProvider),
        )
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = GatewayConfig {
            inbound: vec![inbound("a", "missing", "c")],
            ..GatewayConfig::default()
        };
        assert!(Gateway::build(&config, Collaborators::local(&bus())).is_err());
    }

    #[test]
    fn test_tls_without_provider_rejected() {
        let mut domain = outbound("central", "127.0.0.1:9");
        domain.tls = Some(TlsMaterial::default());
        let config = GatewayConfig {
            outbound: vec![domain],
            ..GatewayConfig::default()
        };
        let err = Gateway::build(&config, Collaborators::local(&bus())).unwrap_err();
        assert!(err.to_string().contains("TLS"));
    }

    #[tokio::test]
    async fn test_unknown_domain_is_not_found() {
        let gateway = Gateway::build(&GatewayConfig::default(), Collaborators::local(&bus())).unwrap();
        assert!(matches!(
            gateway.refresh("nope").await,
            Err(BridgeError::NotFound(_))
        ));
        assert!(matches!(
            gateway.reconnect("nope").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_stop_other_domains() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_addr = taken.local_addr().unwrap().to_string();

        let config = GatewayConfig {
            listeners: vec![listener("busy", &taken_addr), listener("free", "127.0.0.1:0")],
            inbound: vec![inbound("a", "busy", "cred-a"), inbound("b", "free", "cred-b")],
            ..GatewayConfig::default()
        };
        let gateway = Gateway::build(&config, Collaborators::local(&bus())).unwrap();
        assert_eq!(gateway.credential_count(), 2);

        let report = gateway.start().await;
        assert_eq!(report.listeners_up, 1);
        assert_eq!(report.inbound_open, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].component.contains("busy"));

        assert!(matches!(
            gateway.listener("busy").unwrap().status(),
            ListenerStatus::Down { .. }
        ));
        assert!(gateway.listener("free").unwrap().local_addr().is_some());
        assert!(gateway.inbound("b").unwrap().is_open());
        gateway.shutdown().await;
        assert!(!gateway.inbound("b").unwrap().is_open());
    }

    struct RefusingRegistrar;

    impl Registrar for RefusingRegistrar {
        fn register(
            &self,
            _key: &ServiceKey,
            _endpoint_name: &str,
            _proxy: ProxyEndpoint,
            _description: Option<&str>,
        ) -> Result<RegistrationHandle, String> {
            Err("registrar offline".into())
        }

        fn deregister(&self, _handle: &RegistrationHandle) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_outbound_domains_start_independently() {
        let config = GatewayConfig {
            outbound: vec![outbound("one", "127.0.0.1:9"), outbound("two", "127.0.0.1:9")],
            ..GatewayConfig::default()
        };
        let mut collaborators = Collaborators::local(&bus());
        collaborators.registrar = Arc::new(RefusingRegistrar);
        let gateway = Gateway::build(&config, collaborators).unwrap();

        let mut services = BTreeMap::new();
        services.insert(ServiceKey::interface("Echo"), None);
        gateway
            .outbound("one")
            .unwrap()
            .update_propagated_services(&PropagationSnapshot::new(services));

        let report = gateway.start().await;
        assert!(!report.is_clean());
        assert_eq!(report.outbound_registered, 1);
        assert!(report.failures[0].component.contains("one"));

        let status = gateway.status();
        let registered: Vec<bool> = status.outbound.iter().map(|d| d.registered).collect();
        assert_eq!(registered, vec![false, true]);
        gateway.shutdown().await;
    }

    #[test]
    fn test_status_serializes() {
        let config = GatewayConfig {
            listeners: vec![listener("main", "127.0.0.1:0")],
            inbound: vec![inbound("a", "main", "cred-a")],
            ..GatewayConfig::default()
        };
        let gateway = Gateway::build(&config, Collaborators::local(&bus())).unwrap();
        let json = serde_json::to_value(gateway.status()).unwrap();
        assert_eq!(json["listeners"][0]["status"]["state"], "stopped");
        assert_eq!(json["listeners"][0]["credentials"][0], "cred-a");
        assert_eq!(json["inbound"][0]["open"], false);
    }
}
