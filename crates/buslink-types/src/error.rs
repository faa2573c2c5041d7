//! Setup-time error types for Buslink.

use thiserror::Error;

/// Errors raised while configuring or assembling the gateway.
///
/// Runtime transport and exchange failures never surface as this type; they
/// are logged and turned into state changes or terminal exchange outcomes.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A generic configuration problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two domains share a name.
    #[error("Duplicate domain name: {0}")]
    DuplicateDomain(String),

    /// Two inbound domains share a credential.
    #[error("Credential '{0}' is already registered")]
    DuplicateCredential(String),

    /// Two entries of one domain have the same service key.
    #[error("Domain '{domain}' lists service key '{key}' more than once")]
    DuplicateKey {
        /// The offending domain.
        domain: String,
        /// The repeated key.
        key: String,
    },

    /// A mapping whose precedence cannot be decided.
    #[error("Domain '{domain}' has an ambiguous mapping '{key}': {reason}")]
    AmbiguousMapping {
        /// The offending domain.
        domain: String,
        /// The mapping key.
        key: String,
        /// Why it is ambiguous.
        reason: String,
    },

    /// An inbound domain names a listener that does not exist.
    #[error("Domain '{domain}' refers to unknown listener '{listener}'")]
    UnknownListener {
        /// The offending domain.
        domain: String,
        /// The missing listener.
        listener: String,
    },

    /// A listener, domain, or remote address is unusable.
    #[error("Invalid address for '{name}': {address}")]
    InvalidAddress {
        /// Owner of the address.
        name: String,
        /// The address as written.
        address: String,
    },

    /// Retry policy values are inconsistent.
    #[error("Invalid retry policy for '{domain}': {reason}")]
    InvalidRetry {
        /// The offending domain.
        domain: String,
        /// What is wrong.
        reason: String,
    },

    /// Polling policy values are inconsistent.
    #[error("Invalid polling policy for '{domain}': {reason}")]
    InvalidPolling {
        /// The offending domain.
        domain: String,
        /// What is wrong.
        reason: String,
    },

    /// The registrar refused to activate a proxy endpoint.
    #[error("Registration of '{key}' failed: {reason}")]
    Registration {
        /// The service key being registered.
        key: String,
        /// The registrar's reason.
        reason: String,
    },

    /// A named domain or listener does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
