//! Named bean registry consulted while routes are built.
//!
//! Lookups that a route definition depends on fail with
//! [`ConfigError::RegistryMiss`], so a missing bean stops `add_route` rather
//! than surfacing per exchange.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use sy_idempotent::IdempotentRepository;

use crate::aggregation::AggregationStrategyRef;
use crate::dataformat::{DataFormatFactoryRef, DataFormatRef};
use crate::error::ConfigError;

#[derive(Default)]
pub struct Registry {
    beans: DashMap<String, Arc<dyn Any + Send + Sync>>,
    data_formats: DashMap<String, DataFormatRef>,
    data_format_factories: DashMap<String, DataFormatFactoryRef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind any cloneable value, typically an `Arc` of a capability.
    pub fn bind<T>(&self, name: impl Into<String>, bean: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.beans.insert(name.into(), Arc::new(bean));
    }

    /// The bean bound under `name`, if it has type `T`.
    pub fn lookup<T>(&self, name: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.beans
            .get(name)
            .and_then(|bean| bean.value().downcast_ref::<T>().cloned())
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.beans.remove(name).is_some()
    }

    pub fn lookup_aggregation_strategy(&self, name: &str) -> Result<AggregationStrategyRef, ConfigError> {
        self.lookup::<AggregationStrategyRef>(name)
            .ok_or_else(|| ConfigError::registry_miss("AggregationStrategy", name))
    }

    pub fn bind_idempotent_repository(&self, name: impl Into<String>, repository: Arc<dyn IdempotentRepository>) {
        self.bind(name, repository);
    }

    pub fn lookup_idempotent_repository(&self, name: &str) -> Result<Arc<dyn IdempotentRepository>, ConfigError> {
        self.lookup::<Arc<dyn IdempotentRepository>>(name)
            .ok_or_else(|| ConfigError::registry_miss("IdempotentRepository", name))
    }

    /// Bind a shared data format instance.
    pub fn bind_data_format(&self, name: impl Into<String>, format: DataFormatRef) {
        self.data_formats.insert(name.into(), format);
    }

    pub fn bind_data_format_factory(&self, name: impl Into<String>, factory: DataFormatFactoryRef) {
        self.data_format_factories.insert(name.into(), factory);
    }

    /// The shared instance when one is bound, otherwise a new one from the factory.
    pub fn resolve_data_format(&self, name: &str) -> Option<DataFormatRef> {
        if let Some(format) = self.data_formats.get(name) {
            return Some(format.value().clone());
        }
        self.create_data_format(name)
    }

    /// Always a fresh instance from the factory.
    pub fn create_data_format(&self, name: &str) -> Option<DataFormatRef> {
        self.data_format_factories
            .get(name)
            .map(|factory| factory.value().create())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::UseLatestAggregationStrategy;
    use crate::dataformat::JsonDataFormat;
    use sy_idempotent::MemoryIdempotentRepository;

    #[test]
    fn test_typed_lookup() {
        let registry = Registry::new();
        registry.bind("latest", Arc::new(UseLatestAggregationStrategy) as AggregationStrategyRef);
        registry.bind("answer", 42u32);

        assert!(registry.lookup_aggregation_strategy("latest").is_ok());
        assert_eq!(registry.lookup::<u32>("answer"), Some(42));
        assert_eq!(registry.lookup::<String>("answer"), None);
        assert_eq!(
            registry.lookup_aggregation_strategy("missing").err(),
            Some(ConfigError::registry_miss("AggregationStrategy", "missing"))
        );
    }

    #[test]
    fn test_idempotent_repository_lookup() {
        let registry = Registry::new();
        registry.bind_idempotent_repository("repo", Arc::new(MemoryIdempotentRepository::default()));
        assert!(registry.lookup_idempotent_repository("repo").is_ok());
        assert!(registry.lookup_idempotent_repository("other").is_err());
    }

    #[test]
    fn test_data_format_singleton_vs_factory() {
        let registry = Registry::new();
        let shared: DataFormatRef = Arc::new(JsonDataFormat::default());
        registry.bind_data_format("json", shared.clone());
        registry.bind_data_format_factory("json", Arc::new(JsonDataFormat::default()));

        let resolved = registry.resolve_data_format("json").unwrap();
        assert!(Arc::ptr_eq(&resolved, &shared));

        let created = registry.create_data_format("json").unwrap();
        assert!(!Arc::ptr_eq(&created, &shared));
        let again = registry.create_data_format("json").unwrap();
        assert!(!Arc::ptr_eq(&created, &again));

        registry.bind_data_format_factory("pretty", Arc::new(JsonDataFormat { pretty: true }));
        assert!(registry.resolve_data_format("pretty").is_some());
        assert!(registry.resolve_data_format("xml").is_none());
    }
}
