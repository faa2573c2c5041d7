//! Gateway runtime for Buslink.
//!
//! Loads the configuration, assembles listeners and domains around the
//! collaborators of a local bus, and supervises their lifetime. An
//! in-process [`LocalBus`] is provided for running a gateway without an
//! external bus.

pub mod config;
pub mod error;
pub mod gateway;
pub mod local_bus;
pub mod supervisor;

pub use error::{GatewayError, GatewayResult};
pub use gateway::{Collaborators, Gateway, GatewayStatus, StartReport};
pub use local_bus::{EchoProvider, LocalBus, ServiceProvider};
