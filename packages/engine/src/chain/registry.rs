//! Chain-id → adapter registry.
//!
//! Built once at startup and passed explicitly; there is no global
//! registry. An unregistered chain id is a fatal error for the job that
//! needed it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::adapter::ChainAdapter;
use crate::error::EngineError;

/// Immutable-after-construction adapter registry.
#[derive(Default)]
pub struct ChainRegistry {
    adapters: HashMap<i64, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own chain id. Replaces any previous
    /// adapter for that chain.
    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain_id(), adapter);
    }

    /// Resolve the adapter for a chain.
    pub fn get(&self, chain_id: i64) -> Result<Arc<dyn ChainAdapter>, EngineError> {
        self.adapters
            .get(&chain_id)
            .cloned()
            .ok_or(EngineError::UnsupportedChain(chain_id))
    }

    /// Whether the chain is supported.
    pub fn supports(&self, chain_id: i64) -> bool {
        self.adapters.contains_key(&chain_id)
    }

    /// Registered chain ids.
    pub fn chain_ids(&self) -> Vec<i64> {
        self.adapters.keys().copied().collect()
    }
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("chains", &self.chain_ids())
            .finish()
    }
}
