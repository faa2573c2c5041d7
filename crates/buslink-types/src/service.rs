//! Service identities and propagation snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifies one propagated service.
///
/// A missing `service` or `endpoint` acts as a wildcard when matching
/// against configured mappings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Interface (port type) name.
    pub interface: String,
    /// Concrete service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Endpoint name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ServiceKey {
    /// Key naming an interface only.
    pub fn interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            service: None,
            endpoint: None,
        }
    }

    /// Key naming an interface and a concrete service.
    pub fn service(interface: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            service: Some(service.into()),
            endpoint: None,
        }
    }

    /// Key naming all three levels.
    pub fn endpoint(
        interface: impl Into<String>,
        service: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            service: Some(service.into()),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Number of concrete levels (1 to 3).
    pub fn specificity(&self) -> u8 {
        1 + u8::from(self.service.is_some()) + u8::from(self.endpoint.is_some())
    }

    /// Whether this key, read as a pattern, covers `other`.
    ///
    /// Absent levels in `self` match anything; present levels must be equal.
    pub fn covers(&self, other: &ServiceKey) -> bool {
        self.interface == other.interface
            && self
                .service
                .as_ref()
                .map_or(true, |s| other.service.as_ref() == Some(s))
            && self
                .endpoint
                .as_ref()
                .map_or(true, |e| other.endpoint.as_ref() == Some(e))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interface)?;
        if let Some(service) = &self.service {
            write!(f, "/{service}")?;
        }
        if let Some(endpoint) = &self.endpoint {
            write!(f, "/{endpoint}")?;
        }
        Ok(())
    }
}

/// One entry of a snapshot as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagatedService {
    #[serde(flatten)]
    pub key: ServiceKey,
    /// Description document, if one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Everything offered across one peer relationship at one instant.
///
/// Cheap to clone; the map is shared and never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropagationSnapshot {
    services: Arc<BTreeMap<ServiceKey, Option<String>>>,
}

impl PropagationSnapshot {
    /// The "nothing offered" sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(services: BTreeMap<ServiceKey, Option<String>>) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.services.contains_key(key)
    }

    /// Description for `key`: `None` if absent, `Some(None)` if present without one.
    pub fn get(&self, key: &ServiceKey) -> Option<Option<&str>> {
        self.services.get(key).map(|d| d.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServiceKey, Option<&str>)> {
        self.services.iter().map(|(k, d)| (k, d.as_deref()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.services.keys()
    }

    /// Whether this snapshot is worth sending given that `previous` was sent.
    ///
    /// A new key, a key whose description went from absent to present, or a
    /// key that disappeared all count. A description that merely changes
    /// text or goes away does not.
    pub fn changed_since(&self, previous: &PropagationSnapshot) -> bool {
        let grown = self.services.iter().any(|(key, desc)| match previous.services.get(key) {
            None => true,
            Some(None) => desc.is_some(),
            Some(Some(_)) => false,
        });
        grown
            || previous
                .services
                .keys()
                .any(|key| !self.services.contains_key(key))
    }

    /// Wire form, ordered by key.
    pub fn to_wire(&self) -> Vec<PropagatedService> {
        self.services
            .iter()
            .map(|(key, description)| PropagatedService {
                key: key.clone(),
                description: description.clone(),
            })
            .collect()
    }

    /// Rebuild from wire form. Later duplicates replace earlier ones.
    pub fn from_wire(services: Vec<PropagatedService>) -> Self {
        Self::new(
            services
                .into_iter()
                .map(|s| (s.key, s.description))
                .collect(),
        )
    }
}

impl FromIterator<(ServiceKey, Option<String>)> for PropagationSnapshot {
    fn from_iter<I: IntoIterator<Item = (ServiceKey, Option<String>)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
