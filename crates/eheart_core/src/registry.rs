//! Name-to-factory lookup used when a session asks for a model by name.

use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::model::Model;
use crate::models;

pub type ModelFactory = fn() -> Box<dyn Model>;

/// Registered model constructors. Built once at startup and shared read-only
/// between sessions.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the models shipped with this crate.
    pub fn with_builtin_models() -> Self {
        let mut registry = Self::new();
        registry.register(models::exp_decay::NAME, models::exp_decay::create);
        registry.register(
            models::fitzhugh_nagumo::NAME,
            models::fitzhugh_nagumo::create,
        );
        registry.register(models::cell_ring::NAME, models::cell_ring::create);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: ModelFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> EngineResult<Box<dyn Model>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
