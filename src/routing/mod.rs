use crate::{config::Config, error::ConfigError};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

pub mod ruleset;
pub mod service;

pub use ruleset::{ErrorPolicy, Ruleset};
pub use service::{Endpoint, Service, ServiceDirectory};

/// Immutable routing data in force for newly created sessions.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    pub directory: ServiceDirectory,
    rulesets: HashMap<String, Arc<Ruleset>>,
}

impl RoutingSnapshot {
    pub fn new(directory: ServiceDirectory, rulesets: Vec<Ruleset>) -> Self {
        Self {
            directory,
            rulesets: rulesets
                .into_iter()
                .map(|r| (r.service_key.clone(), Arc::new(r)))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let directory = ServiceDirectory::from_config(&config.services)?;
        let rulesets = config
            .rulesets
            .iter()
            .map(Ruleset::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(directory, rulesets))
    }

    pub fn ruleset(&self, service_key: &str) -> Option<Arc<Ruleset>> {
        self.rulesets.get(service_key).cloned()
    }

    pub fn ruleset_count(&self) -> usize {
        self.rulesets.len()
    }
}

/// Holder swapped wholesale on reconfiguration.
#[derive(Debug, Default)]
pub struct RoutingStore {
    current: RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingStore {
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.read().clone()
    }

    pub fn replace(&self, snapshot: RoutingSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
