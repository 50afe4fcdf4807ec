use crate::{
    config::ServiceConfig,
    error::ConfigError,
    sip::{message, Interface},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// A physical application server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uri: rsip::Uri,
    /// Loose route toward this endpoint, prepended to outgoing INVITEs.
    pub route: rsip::UriWithParams,
}

impl Endpoint {
    pub fn parse(alias: &str, uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            alias: alias.to_string(),
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = uri.trim();
        let lower = trimmed.to_ascii_lowercase();
        if !(lower.starts_with("sip:") || lower.starts_with("sips:")) {
            return Err(invalid("only sip: and sips: URIs are supported"));
        }
        let parsed = rsip::Uri::try_from(trimmed).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            route: message::loose_route(parsed.clone()),
            uri: parsed,
        })
    }
}

/// A named application service with round-robin endpoint selection.
#[derive(Debug)]
pub struct Service {
    pub alias: String,
    pub external: bool,
    pub endpoints: Vec<Endpoint>,
    cursor: Mutex<usize>,
}

impl Service {
    pub fn new(alias: impl Into<String>, external: bool, endpoints: Vec<Endpoint>) -> Self {
        Self {
            alias: alias.into(),
            external,
            endpoints,
            cursor: Mutex::new(0),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        if config.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints(config.alias.clone()));
        }
        let endpoints = config
            .endpoints
            .iter()
            .map(|uri| Endpoint::parse(&config.alias, uri))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(config.alias.clone(), config.external, endpoints))
    }

    /// Next endpoint in round-robin order, wrapping after the last one.
    pub fn next_endpoint(&self) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let endpoint = self.endpoints[*cursor % self.endpoints.len()].clone();
        *cursor = (*cursor + 1) % self.endpoints.len();
        Some(endpoint)
    }

    pub fn interface(&self) -> Interface {
        if self.external {
            Interface::External
        } else {
            Interface::Internal
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceDirectory {
    pub fn from_config(configs: &[ServiceConfig]) -> Result<Self, ConfigError> {
        let mut services = HashMap::new();
        for config in configs {
            let service = Service::from_config(config)?;
            if services
                .insert(config.alias.clone(), Arc::new(service))
                .is_some()
            {
                return Err(ConfigError::DuplicateService(config.alias.clone()));
            }
        }
        Ok(Self { services })
    }

    pub fn insert(&mut self, service: Service) {
        self.services
            .insert(service.alias.clone(), Arc::new(service));
    }

    pub fn get(&self, alias: &str) -> Option<Arc<Service>> {
        self.services.get(alias).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(n: usize) -> Service {
        let endpoints = (0..n)
            .map(|i| Endpoint::parse("as", &format!("sip:10.0.0.{}:5070", i + 1)).unwrap())
            .collect();
        Service::new("as", false, endpoints)
    }

    #[test]
    fn test_round_robin_visits_each_endpoint_once() {
        let svc = service(3);
        let picked: Vec<_> = (0..3).map(|_| svc.next_endpoint().unwrap()).collect();
        for endpoint in &svc.endpoints {
            assert_eq!(picked.iter().filter(|e| *e == endpoint).count(), 1);
        }
        assert_eq!(svc.next_endpoint().unwrap(), svc.endpoints[0]);
    }

    #[test]
    fn test_round_robin_is_shared_across_threads() {
        let svc = Arc::new(service(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let svc = svc.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| svc.next_endpoint().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<Endpoint> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        for endpoint in &svc.endpoints {
            assert_eq!(all.iter().filter(|e| *e == endpoint).count(), 100);
        }
    }

    #[test]
    fn test_endpoint_route_is_loose() {
        let endpoint = Endpoint::parse("as", "sip:as1.local:5070").unwrap();
        assert!(endpoint.route.uri.params.contains(&rsip::Param::Lr));
        assert_eq!(endpoint.route.to_string(), "<sip:as1.local:5070;lr>");
        let already = Endpoint::parse("as", "sip:as1.local:5070;lr").unwrap();
        assert_eq!(already.route, endpoint.route);
        assert!(Endpoint::parse("as", "tel:+123").is_err());
    }

    #[test]
    fn test_interface_follows_externality() {
        assert_eq!(service(1).interface(), Interface::Internal);
        let external = Service::new("ext", true, vec![]);
        assert_eq!(external.interface(), Interface::External);
        assert!(external.next_endpoint().is_none());
    }
}
