//! Wire protocol frame types.
//!
//! All communication between Buslink peers uses JSON-framed messages over a
//! stream. Each frame is prefixed with a 4-byte big-endian length header.

use buslink_types::{
    ExchangeFault, ExchangePattern, FlowContext, PropagatedService, PropagationSnapshot,
    ServiceKey, StepStatus,
};
use serde::{Deserialize, Serialize};

/// A wire protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the connecting side.
    Auth {
        /// Credential name identifying the inbound domain.
        credential: String,
        /// Protocol version of the sender.
        protocol_version: u32,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + credential), empty without a secret.
        #[serde(default)]
        auth_hmac: String,
    },
    /// The credential was accepted.
    AuthAccept {
        /// Name of the inbound domain that took the connection.
        domain: String,
    },
    /// The credential was refused; the connection closes next.
    AuthReject { reason: String },
    /// Everything the sender currently offers.
    Propagation { services: Vec<PropagatedService> },
    /// First step of an exchange.
    ExchangeNew {
        id: String,
        service: ServiceKey,
        flow: FlowContext,
        operation: String,
        pattern: ExchangePattern,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    /// A non-final follow-up step.
    ExchangeMiddle {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
        status: StepStatus,
    },
    /// The final step of an exchange.
    ExchangeLast {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
        status: StepStatus,
    },
    /// The exchange failed; final.
    ExchangeError { id: String, info: String },
    /// The sender gave up waiting; final.
    Timeout { id: String },
}

impl Frame {
    /// Build a propagation frame from a snapshot.
    pub fn propagation(snapshot: &PropagationSnapshot) -> Self {
        Frame::Propagation {
            services: snapshot.to_wire(),
        }
    }

    /// Exchange id, for exchange frames.
    pub fn exchange_id(&self) -> Option<&str> {
        match self {
            Frame::ExchangeNew { id, .. }
            | Frame::ExchangeMiddle { id, .. }
            | Frame::ExchangeLast { id, .. }
            | Frame::ExchangeError { id, .. }
            | Frame::Timeout { id } => Some(id),
            _ => None,
        }
    }

    /// Error frame carrying a fault.
    pub fn error(id: impl Into<String>, fault: &ExchangeFault) -> Self {
        Frame::ExchangeError {
            id: id.into(),
            info: fault.to_string(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthAccept { .. } => "auth_accept",
            Frame::AuthReject { .. } => "auth_reject",
            Frame::Propagation { .. } => "propagation",
            Frame::ExchangeNew { .. } => "exchange_new",
            Frame::ExchangeMiddle { .. } => "exchange_middle",
            Frame::ExchangeLast { .. } => "exchange_last",
            Frame::ExchangeError { .. } => "exchange_error",
            Frame::Timeout { .. } => "timeout",
        }
    }
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a frame.
pub fn decode_frame(body: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(body)
}
