//! Collaborators the gateway needs from the local message bus.

use crate::outbound::ProxyEndpoint;
use crate::relay::Replier;

use async_trait::async_trait;
use buslink_types::{Delivery, LocalEndpoint, RegistrationHandle, ServiceKey};

/// Looks up live local endpoints.
///
/// Lookups may be slow; the gateway never holds a domain lock across one.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Endpoints implementing `interface`, narrowed by `service` and
    /// `endpoint` when given.
    async fn lookup(
        &self,
        interface: &str,
        service: Option<&str>,
        endpoint: Option<&str>,
    ) -> Vec<LocalEndpoint>;
}

/// Activates locally addressable proxy endpoints for remote services.
pub trait Registrar: Send + Sync + 'static {
    /// Make `proxy` reachable on the local bus under `endpoint_name`.
    fn register(
        &self,
        key: &ServiceKey,
        endpoint_name: &str,
        proxy: ProxyEndpoint,
        description: Option<&str>,
    ) -> Result<RegistrationHandle, String>;

    /// Withdraw a previously registered proxy.
    fn deregister(&self, handle: &RegistrationHandle) -> Result<(), String>;
}

/// Delivers exchange steps to local parties.
pub trait BusDispatcher: Send + Sync + 'static {
    /// Hand `delivery` to the local bus without blocking.
    ///
    /// `replier` sends the next step of the exchange back over the connection
    /// the delivery arrived on.
    fn dispatch(&self, delivery: Delivery, replier: Replier);
}
