//! Gateway configuration.
//!
//! Everything here is plain data deserialized from TOML. [`GatewayConfig::validate`]
//! rejects inconsistent setups before any socket is bound, so the runtime
//! never has to second-guess its configuration.

use crate::error::{BridgeError, BridgeResult};
use crate::service::ServiceKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default handshake timeout (milliseconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Root configuration for one gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// How long either side waits for the peer during authentication.
    pub handshake_timeout_ms: u64,
    /// Accepting sockets.
    pub listeners: Vec<ListenerConfig>,
    /// Peers allowed to connect to us.
    pub inbound: Vec<InboundDomainConfig>,
    /// Peers we connect to.
    pub outbound: Vec<OutboundDomainConfig>,
    /// Services hosted by the built-in in-process bus.
    pub local_services: Vec<LocalServiceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            listeners: Vec::new(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            local_services: Vec::new(),
        }
    }
}

/// A bound, accepting socket shared by any number of inbound domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    /// `host:port` to bind.
    pub bind: String,
}

/// References to TLS material; loading it is the embedder's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsMaterial {
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub trust: Option<PathBuf>,
    /// Name to verify on the server certificate (outbound only).
    pub server_name: Option<String>,
}

/// Reconnection policy for an outbound domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// `< 0` retries forever, `0` never retries, `> 0` bounds the retries.
    pub max_attempts: i32,
    /// Fixed delay between attempts (milliseconds).
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: -1,
            delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Whether another retry is allowed after `retries` have been made.
    pub fn allows(&self, retries: u32) -> bool {
        match self.max_attempts {
            n if n < 0 => true,
            0 => false,
            n => retries < n as u32,
        }
    }
}

/// Propagation polling policy for an inbound domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingPolicy {
    /// First delay between polls (milliseconds); `0` disables polling.
    pub interval_ms: u64,
    /// Growth factor applied to the delay after each poll.
    pub acceleration: f64,
    /// Steady-state delay (milliseconds).
    pub max_interval_ms: u64,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            acceleration: 2.0,
            max_interval_ms: 60_000,
        }
    }
}

impl PollingPolicy {
    /// Delay to use after a poll that waited `current` milliseconds.
    ///
    /// Grows by `acceleration` toward `max_interval_ms`, or jumps straight to
    /// it when the factor does not accelerate.
    pub fn next_delay_ms(&self, current: u64) -> u64 {
        if self.acceleration > 1.0 {
            let grown = (current as f64 * self.acceleration).ceil() as u64;
            grown.max(current).min(self.max_interval_ms)
        } else {
            self.max_interval_ms
        }
    }
}

/// One `interface[,service[,endpoint]]` entry an inbound domain offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferEntry {
    pub interface: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl OfferEntry {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            interface: self.interface.clone(),
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Configuration of one inbound domain: a peer allowed to connect to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundDomainConfig {
    pub name: String,
    /// Listener this domain accepts connections on.
    pub listener: String,
    /// Credential name the peer presents.
    pub credential: String,
    /// Optional pre-shared secret for HMAC authentication.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub polling: PollingPolicy,
    /// What this domain advertises to its peer.
    #[serde(default)]
    pub offers: Vec<OfferEntry>,
}

/// An explicit local mapping for a service propagated by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub interface: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Endpoint name to register locally instead of a generated one.
    ///
    /// On a mapping that leaves the service or endpoint open, the levels the
    /// propagated key fills in are appended, so each covered key still gets
    /// its own name.
    #[serde(default)]
    pub local_endpoint: Option<String>,
    /// Description that always wins over the propagated one.
    #[serde(default)]
    pub description: Option<String>,
}

impl ServiceMapping {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            interface: self.interface.clone(),
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Local endpoint name for `key`, a key this mapping covers.
    pub fn local_endpoint_for(&self, key: &ServiceKey) -> Option<String> {
        let base = self.local_endpoint.as_ref()?;
        let mut name = base.clone();
        if self.service.is_none() {
            if let Some(service) = &key.service {
                name.push('-');
                name.push_str(service);
            }
        }
        if self.endpoint.is_none() {
            if let Some(endpoint) = &key.endpoint {
                name.push('-');
                name.push_str(endpoint);
            }
        }
        Some(name)
    }
}

/// Configuration of one outbound domain: a peer we connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundDomainConfig {
    pub name: String,
    /// `host:port` of the remote listener.
    pub remote: String,
    /// Credential name we present.
    pub credential: String,
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Register every propagated service, not only the mapped ones.
    #[serde(default = "default_true")]
    pub accept_all: bool,
    #[serde(default)]
    pub mappings: Vec<ServiceMapping>,
    /// Connect as soon as the gateway starts.
    #[serde(default = "default_true")]
    pub connect_on_start: bool,
}

fn default_true() -> bool {
    true
}

/// A service hosted by the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServiceConfig {
    pub interface: String,
    pub service: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl GatewayConfig {
    /// Reject inconsistent configurations.
    pub fn validate(&self) -> BridgeResult<()> {
        let mut names = HashSet::new();

        let mut listener_names = HashSet::new();
        for listener in &self.listeners {
            require_name("listener", &listener.name)?;
            if !listener_names.insert(listener.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "Duplicate listener name: {}",
                    listener.name
                )));
            }
            if listener.bind.parse::<SocketAddr>().is_err() {
                return Err(BridgeError::InvalidAddress {
                    name: listener.name.clone(),
                    address: listener.bind.clone(),
                });
            }
        }

        let mut credentials = HashSet::new();
        for domain in &self.inbound {
            require_name("inbound domain", &domain.name)?;
            if !names.insert(domain.name.as_str()) {
                return Err(BridgeError::DuplicateDomain(domain.name.clone()));
            }
            if domain.credential.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "Domain '{}' has an empty credential",
                    domain.name
                )));
            }
            if !credentials.insert(domain.credential.as_str()) {
                return Err(BridgeError::DuplicateCredential(domain.credential.clone()));
            }
            if !listener_names.contains(domain.listener.as_str()) {
                return Err(BridgeError::UnknownListener {
                    domain: domain.name.clone(),
                    listener: domain.listener.clone(),
                });
            }
            validate_polling(&domain.name, &domain.polling)?;
            unique_keys(&domain.name, domain.offers.iter().map(OfferEntry::key))?;
        }

        for domain in &self.outbound {
            require_name("outbound domain", &domain.name)?;
            if !names.insert(domain.name.as_str()) {
                return Err(BridgeError::DuplicateDomain(domain.name.clone()));
            }
            if domain.credential.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "Domain '{}' has an empty credential",
                    domain.name
                )));
            }
            validate_remote(&domain.name, &domain.remote)?;
            if domain.retry.max_attempts != 0 && domain.retry.delay_ms == 0 {
                return Err(BridgeError::InvalidRetry {
                    domain: domain.name.clone(),
                    reason: "delay_ms must be positive when retries are enabled".to_string(),
                });
            }
            validate_mappings(&domain.name, &domain.mappings)?;
        }

        Ok(())
    }
}

fn require_name(what: &str, name: &str) -> BridgeResult<()> {
    if name.trim().is_empty() {
        return Err(BridgeError::Config(format!("A {what} has an empty name")));
    }
    Ok(())
}

fn validate_remote(domain: &str, remote: &str) -> BridgeResult<()> {
    let invalid = || BridgeError::InvalidAddress {
        name: domain.to_string(),
        address: remote.to_string(),
    };
    let (host, port) = remote.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok(())
}

fn validate_polling(domain: &str, polling: &PollingPolicy) -> BridgeResult<()> {
    if polling.interval_ms == 0 {
        return Ok(());
    }
    if !polling.acceleration.is_finite() || polling.acceleration < 0.0 {
        return Err(BridgeError::InvalidPolling {
            domain: domain.to_string(),
            reason: format!("acceleration {} is not usable", polling.acceleration),
        });
    }
    if polling.max_interval_ms < polling.interval_ms {
        return Err(BridgeError::InvalidPolling {
            domain: domain.to_string(),
            reason: format!(
                "max_interval_ms ({}) is below interval_ms ({})",
                polling.max_interval_ms, polling.interval_ms
            ),
        });
    }
    Ok(())
}

fn unique_keys(domain: &str, keys: impl Iterator<Item = ServiceKey>) -> BridgeResult<()> {
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            return Err(BridgeError::DuplicateKey {
                domain: domain.to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Mapping keys must be unique and hierarchical.
///
/// An endpoint without a service would tie with a service-level entry for
/// the same interface, so it is rejected.
pub fn validate_mappings(domain: &str, mappings: &[ServiceMapping]) -> BridgeResult<()> {
    for mapping in mappings {
        if mapping.service.is_none() && mapping.endpoint.is_some() {
            return Err(BridgeError::AmbiguousMapping {
                domain: domain.to_string(),
                key: mapping.key().to_string(),
                reason: "an endpoint requires a service".to_string(),
            });
        }
    }
    unique_keys(domain, mappings.iter().map(ServiceMapping::key))
}
