//! Precedence chains of directory sources.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use xavyo_directory::UserRegistry;

use crate::context::is_default_tenant;

/// A directory source and the id it is configured under.
#[derive(Clone)]
pub struct RegisteredSource {
    id: String,
    registry: Arc<dyn UserRegistry>,
}

impl fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl RegisteredSource {
    pub fn new(id: impl Into<String>, registry: Arc<dyn UserRegistry>) -> Self {
        Self {
            id: id.into(),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<dyn UserRegistry> {
        &self.registry
    }
}

/// Sources in precedence order, shared by all tenants unless a tenant has
/// its own chain.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    chain: Vec<RegisteredSource>,
    tenant_chains: HashMap<String, Vec<RegisteredSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source to the shared chain.
    #[must_use]
    pub fn with_source(mut self, id: impl Into<String>, registry: Arc<dyn UserRegistry>) -> Self {
        self.chain.push(RegisteredSource::new(id, registry));
        self
    }

    /// Append a source to the chain of one tenant.
    #[must_use]
    pub fn with_tenant_source(
        mut self,
        tenant: impl Into<String>,
        id: impl Into<String>,
        registry: Arc<dyn UserRegistry>,
    ) -> Self {
        self.tenant_chains
            .entry(tenant.into())
            .or_default()
            .push(RegisteredSource::new(id, registry));
        self
    }

    fn chain_for(&self, tenant: &str) -> (&[RegisteredSource], bool) {
        match self.tenant_chains.get(tenant) {
            Some(chain) => (chain, true),
            None => (&self.chain, false),
        }
    }

    /// Whether `source` takes part in synchronizing `tenant`.
    ///
    /// Tenant-aware sources decide by their scope. Other shared sources
    /// serve only the default tenant.
    pub fn is_active(&self, source: &RegisteredSource, tenant: &str) -> bool {
        let registry = source.registry();
        if let Some(scope) = registry.capabilities().tenant_scope {
            return scope.is_active_for(tenant);
        }
        let (_, own_chain) = self.chain_for(tenant);
        (own_chain || is_default_tenant(tenant)) && registry.is_active()
    }

    /// Active sources of `tenant`, highest precedence first.
    pub fn active_chain(&self, tenant: &str) -> Vec<RegisteredSource> {
        let (chain, _) = self.chain_for(tenant);
        chain
            .iter()
            .filter(|source| self.is_active(source, tenant))
            .cloned()
            .collect()
    }

    /// Ids of the active sources of `tenant`.
    pub fn active_ids(&self, tenant: &str) -> BTreeSet<String> {
        self.active_chain(tenant)
            .into_iter()
            .map(|source| source.id)
            .collect()
    }

    /// Look up a source of `tenant` by id, active or not.
    pub fn get(&self, tenant: &str, id: &str) -> Option<&RegisteredSource> {
        let (chain, _) = self.chain_for(tenant);
        chain.iter().find(|source| source.id == id)
    }
}
