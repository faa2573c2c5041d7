//! Buslink wire protocol and peer sessions.
//!
//! Bridges two message-bus domains over framed TCP (optionally TLS)
//! connections so that services on one side can be invoked from the other.
//!
//! ## Architecture
//!
//! - **Frame**: JSON-framed protocol messages (auth, propagation, exchange steps)
//! - **Listener**: accepting side; authenticates connections by credential
//! - **TransportClient**: connecting side with a reconnection state machine
//! - **InboundDomain**: advertises local services to a connected peer
//! - **OutboundDomain**: mirrors a peer's services as local proxies
//! - **ExchangeRelay**: correlates exchange steps across the wire
//! - **ServiceMatcher**: most-specific lookup of configured service mappings

pub mod auth;
pub mod bus;
pub mod client;
pub mod connection;
pub mod inbound;
pub mod listener;
pub mod matcher;
pub mod message;
pub mod outbound;
pub mod relay;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use bus::{BusDispatcher, Directory, Registrar};
pub use client::{ClientSettings, ClientState, ClientStatus, TransportClient};
pub use connection::{Connection, ConnectionId, ConnectionInfo, FrameHandler, WireError};
pub use inbound::{InboundDomain, InboundDomainStatus};
pub use listener::{CredentialRegistry, Listener, ListenerStatus};
pub use matcher::ServiceMatcher;
pub use message::{Frame, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use outbound::{
    MirroredService, OutboundDomain, OutboundDomainStatus, ProxyEndpoint, ReconcileReport,
};
pub use relay::{ExchangeRelay, Replier};
pub use transport::{BoxStream, TlsProvider};
