//! Dialect lookup by URL scheme.

use std::collections::BTreeMap;
use std::sync::Arc;

use dqlite_core::{Error, Result};

use crate::dialect::{Dialect, DqliteAioDialect, DqliteDialect};
use crate::url::DatabaseUrl;

type Factory = Arc<dyn Fn() -> Arc<dyn Dialect> + Send + Sync>;

/// Maps dialect names (`backend` or `backend.driver`) to dialects.
#[derive(Clone, Default)]
pub struct DialectRegistry {
    factories: BTreeMap<String, Factory>,
}

impl DialectRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `dqlite` and `dqlite.aio`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dqlite", || Arc::new(DqliteDialect));
        registry.register("dqlite.aio", || Arc::new(DqliteAioDialect));
        registry
    }

    /// Register or replace a dialect.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Dialect> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(dialect = %name, "Registering dialect");
        self.factories.insert(name, Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Dialect registered under `name`.
    #[allow(clippy::result_large_err)]
    pub fn load(&self, name: &str) -> Result<Arc<dyn Dialect>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                Error::config(format!(
                    "Can't load plugin: dialect {:?} is not registered",
                    name
                ))
            })
    }

    /// Dialect for a URL: `dqlite` for `dqlite://`, `dqlite.aio` for
    /// `dqlite+aio://`.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, url: &DatabaseUrl) -> Result<Arc<dyn Dialect>> {
        self.load(&url.dialect_name())
    }
}

impl std::fmt::Debug for DialectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectRegistry")
            .field("dialects", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
