//! Resolves propagated service keys to configured local mappings.

use buslink_types::config::{validate_mappings, ServiceMapping};
use buslink_types::{BridgeResult, ServiceKey};

/// Most-specific-match lookup over an outbound domain's mappings.
#[derive(Debug, Clone, Default)]
pub struct ServiceMatcher {
    /// Sorted by descending specificity, then by key.
    mappings: Vec<ServiceMapping>,
}

impl ServiceMatcher {
    /// Build a matcher, rejecting duplicate or ambiguous keys.
    pub fn new(domain: &str, mappings: Vec<ServiceMapping>) -> BridgeResult<Self> {
        validate_mappings(domain, &mappings)?;
        let mut mappings = mappings;
        mappings.sort_by(|a, b| {
            let (ka, kb) = (a.key(), b.key());
            kb.specificity().cmp(&ka.specificity()).then(ka.cmp(&kb))
        });
        Ok(Self { mappings })
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// The most specific mapping covering `key`, if any.
    ///
    /// Keys are hierarchical, so at most one mapping of each specificity can
    /// cover a given key.
    pub fn resolve(&self, key: &ServiceKey) -> Option<&ServiceMapping> {
        self.mappings.iter().find(|m| m.key().covers(key))
    }
}
