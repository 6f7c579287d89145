//! In-memory canonical-name resolver

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::DirectoryStore;
use crate::types::Domain;

/// Read-only registry resolving a request host to the canonical name of an
/// owned domain. Built once at startup; lock-free reads thereafter.
pub struct DomainRegistry {
    domains: Vec<Domain>,
    by_name: HashMap<String, usize>,
}

impl DomainRegistry {
    /// Load all domains from the store. Fails when the table is empty so a
    /// misconfigured deployment dies at init instead of 403-ing every UA.
    pub async fn load(store: &dyn DirectoryStore) -> Result<Arc<Self>> {
        let registry = Self::from_domains(store.list_domains().await?)?;
        info!(count = registry.domains.len(), "domain registry loaded");
        Ok(registry)
    }

    /// Build a registry from already-loaded records. Used by tests and by
    /// callers that assemble domains outside the store.
    pub fn from_domains(domains: Vec<Domain>) -> Result<Arc<Self>> {
        if domains.is_empty() {
            return Err(Error::NoDomains);
        }

        let mut by_name = HashMap::with_capacity(domains.len());
        let mut seen_aliases: HashMap<String, String> = HashMap::new();
        for (idx, domain) in domains.iter().enumerate() {
            let key = domain.name.to_ascii_lowercase();
            if by_name.insert(key, idx).is_some() {
                warn!(name = %domain.name, "duplicate domain name ignored");
            }
            for alias in &domain.aliases {
                let alias_key = alias.to_ascii_lowercase();
                if let Some(owner) = seen_aliases.get(&alias_key) {
                    warn!(alias = %alias, owner = %owner, claimant = %domain.name,
                        "alias already claimed, duplicate ignored");
                } else {
                    seen_aliases.insert(alias_key, domain.name.clone());
                }
            }
        }
        Ok(Arc::new(Self { domains, by_name }))
    }

    /// Resolve a host to the canonical domain name, case-insensitively.
    /// Direct name match wins; aliases are scanned linearly afterwards.
    pub fn canonicalise(&self, host: &str) -> Option<&Domain> {
        let needle = host.to_ascii_lowercase();
        if let Some(&idx) = self.by_name.get(&needle) {
            return Some(&self.domains[idx]);
        }
        self.domains.iter().find(|domain| {
            domain
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(host))
        })
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }
}
