use std::sync::Arc;

use crate::engine::catalog::OwnerCatalog;
use crate::engine::lock::LockManager;
use crate::scm::ScmProvider;
use crate::script::ScriptEngine;

/// Process-wide state shared by the CLI, the webhook server and the periodic sweep.
pub struct EngineContext {
    pub provider: Arc<dyn ScmProvider>,
    pub scripts: ScriptEngine,
    locks: LockManager,
    catalog: Option<Arc<dyn OwnerCatalog>>,
}

impl EngineContext {
    pub fn new(provider: Arc<dyn ScmProvider>) -> Self {
        Self {
            provider,
            scripts: ScriptEngine::new(),
            locks: LockManager::default(),
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn OwnerCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn catalog(&self) -> Option<&dyn OwnerCatalog> {
        self.catalog.as_deref()
    }
}
