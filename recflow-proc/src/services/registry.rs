//! Service implementations by kind
//!
//! Services are compiled in. A service row names its `kind`; the registry maps that
//! kind to a factory.

use recflow_common::config::RecflowConfig;
use recflow_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

use super::aggregation::{self, AggregationService};
use super::normalization::{self, NormalizationService};
use super::MetadataService;
use crate::models::ServiceInfo;

pub type ServiceFactory =
    Arc<dyn Fn(&ServiceInfo, &RecflowConfig) -> Result<Box<dyn MetadataService>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the normalization and aggregation services
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(normalization::KIND, |info, _config| {
            Ok(Box::new(NormalizationService::new(info.name.clone())) as Box<dyn MetadataService>)
        });
        registry.register(aggregation::KIND, |info, config| {
            let service = AggregationService::new(info.name.clone(), config.matching.clone())?;
            Ok(Box::new(service) as Box<dyn MetadataService>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ServiceInfo, &RecflowConfig) -> Result<Box<dyn MetadataService>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn create(&self, info: &ServiceInfo, config: &RecflowConfig) -> Result<Box<dyn MetadataService>> {
        let factory = self
            .factories
            .get(&info.kind)
            .ok_or_else(|| Error::Config(format!("No service implementation for kind '{}'", info.kind)))?;
        factory(info, config)
    }
}
