//! Exchange steps, flow correlation, and terminal faults.

use crate::service::ServiceKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque handle naming an exchange on the local bus.
///
/// The gateway never interprets it; it only hands it back to the bus
/// dispatcher together with the step that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeHandle(pub String);

impl fmt::Display for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by a registrar when a proxy endpoint is activated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationHandle(pub String);

/// Correlation data threaded through an exchange for distributed tracing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContext {
    /// Identifies the whole end-to-end flow.
    pub instance_id: String,
    /// Identifies this hop of the flow.
    pub step_id: String,
    /// The hop that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
}

impl FlowContext {
    /// Start a brand new flow.
    pub fn new_root() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            step_id: uuid::Uuid::new_v4().to_string(),
            parent_step_id: None,
        }
    }

    /// A new hop in the same flow, caused by this one.
    pub fn child(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            step_id: uuid::Uuid::new_v4().to_string(),
            parent_step_id: Some(self.step_id.clone()),
        }
    }
}

/// Message exchange pattern of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    InOnly,
    RobustInOnly,
    InOut,
    InOptionalOut,
}

impl ExchangePattern {
    /// Whether the provider is expected to answer with a payload.
    pub fn expects_response(self) -> bool {
        matches!(self, Self::InOut | Self::InOptionalOut)
    }
}

/// Status carried by a middle or last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The exchange continues.
    Active,
    /// The exchange completed normally.
    Done,
    /// The payload is a business fault.
    Fault,
}

/// Terminal outcome of an exchange that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExchangeFault {
    /// The peer reported an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The frame could not be written or the connection was lost.
    #[error("transport error: {0}")]
    Transport(String),
    /// No live connection to carry the exchange.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The exchange timed out.
    #[error("exchange timed out")]
    Timeout,
    /// The payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// First step of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExchange {
    pub service: ServiceKey,
    pub operation: String,
    pub pattern: ExchangePattern,
    pub payload: Option<String>,
}

/// One step of an exchange, as seen by the local bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    New(NewExchange),
    Middle {
        payload: Option<String>,
        status: StepStatus,
    },
    Last {
        payload: Option<String>,
        status: StepStatus,
    },
    Error(ExchangeFault),
}

impl Step {
    /// Non-final steps expect the peer to answer with a further step.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Step::New(_) | Step::Middle { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::New(_) => "new",
            Step::Middle { .. } => "middle",
            Step::Last { .. } => "last",
            Step::Error(_) => "error",
        }
    }
}

/// A step handed to the local bus.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Wire-level exchange id.
    pub exchange_id: String,
    /// The local exchange this step continues; `None` for a new exchange.
    pub handle: Option<ExchangeHandle>,
    /// Flow context restored or derived for this step.
    pub flow: FlowContext,
    pub step: Step,
}

/// A live endpoint found in the local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpoint {
    pub interface: String,
    pub service: String,
    pub endpoint: String,
    /// Description document, when the endpoint publishes one.
    #[serde(default)]
    pub description: Option<String>,
}
