//! Core types for Buslink.
//!
//! This crate defines the data shared by the wire protocol, the domains and
//! the gateway assembly: service keys and propagation snapshots, exchange
//! steps and faults, configuration, and setup errors. It contains no I/O.

pub mod config;
pub mod error;
pub mod exchange;
pub mod service;

pub use error::{BridgeError, BridgeResult};
pub use exchange::{
    Delivery, ExchangeFault, ExchangeHandle, ExchangePattern, FlowContext, LocalEndpoint,
    NewExchange, RegistrationHandle, Step, StepStatus,
};
pub use service::{PropagatedService, PropagationSnapshot, ServiceKey};
