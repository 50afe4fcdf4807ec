use crate::error::ConfigError;
use crate::routing::{Endpoint, ErrorPolicy};
use crate::sip::message;
use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Parser, Debug)]
#[command(version = crate::version::VERSION, long_version = crate::version::LONG_VERSION)]
pub struct Cli {
    #[clap(long, default_value = "sipbroker.toml")]
    pub conf: Option<String>,
    /// Validate the configuration, print a summary and exit
    #[clap(long)]
    pub check: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub rulesets: Vec<RulesetConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: String,
    pub hostname: String,
    pub port: u16,
    pub imscf_host: String,
    pub imscf_port: u16,
    pub queue_max_size: usize,
    pub initial_threads: usize,
    pub max_threads: usize,
    pub keepalive_secs: u64,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    pub alias: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RulesetConfig {
    pub service_key: String,
    #[serde(default)]
    pub default_error_handling: ErrorPolicy,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub skip_codes: Vec<u16>,
    #[serde(default)]
    pub stop_codes: Vec<u16>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: "udp".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 5060,
            imscf_host: "127.0.0.1".to_string(),
            imscf_port: 5080,
            queue_max_size: 1000,
            initial_threads: 4,
            max_threads: 16,
            keepalive_secs: 60,
            log_level: Some("info".to_string()),
            log_file: None,
        }
    }
}

impl BrokerConfig {
    /// Contact header value the broker puts on every message it originates.
    pub fn contact(&self) -> String {
        format!(
            "<sip:{}:{};transport={}>",
            self.hostname, self.port, self.transport
        )
    }

    /// Route toward the IM-SCF when an incoming INVITE carries no further route.
    pub fn imscf_route(&self) -> Result<rsip::UriWithParams, ConfigError> {
        let uri = rsip::Uri::try_from(format!("sip:{}:{}", self.imscf_host, self.imscf_port))
            .map_err(|e| ConfigError::Broker(format!("invalid IM-SCF address: {}", e)))?;
        Ok(message::loose_route(uri))
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.initial_threads == 0 || broker.max_threads == 0 {
            return Err(ConfigError::Pool("thread counts must be positive".to_string()));
        }
        if broker.max_threads < broker.initial_threads {
            return Err(ConfigError::Pool(format!(
                "max_threads {} is below initial_threads {}",
                broker.max_threads, broker.initial_threads
            )));
        }
        if broker.queue_max_size == 0 {
            return Err(ConfigError::Pool("queue_max_size must be positive".to_string()));
        }
        if broker.hostname.is_empty() || broker.imscf_host.is_empty() {
            return Err(ConfigError::Broker(
                "hostname and imscf_host are required".to_string(),
            ));
        }
        broker.imscf_route()?;

        let mut aliases = HashSet::new();
        for service in &self.services {
            if !aliases.insert(service.alias.as_str()) {
                return Err(ConfigError::DuplicateService(service.alias.clone()));
            }
            if service.endpoints.is_empty() {
                return Err(ConfigError::NoEndpoints(service.alias.clone()));
            }
            for uri in &service.endpoints {
                Endpoint::parse(&service.alias, uri)?;
            }
        }

        let mut keys = HashSet::new();
        for ruleset in &self.rulesets {
            if !keys.insert(ruleset.service_key.as_str()) {
                return Err(ConfigError::DuplicateRuleset(ruleset.service_key.clone()));
            }
            if ruleset.services.is_empty() {
                return Err(ConfigError::EmptyRuleset(ruleset.service_key.clone()));
            }
            if let Some(alias) = ruleset
                .services
                .iter()
                .find(|alias| !aliases.contains(alias.as_str()))
            {
                return Err(ConfigError::UnknownService {
                    service_key: ruleset.service_key.clone(),
                    alias: alias.clone(),
                });
            }
            for &code in ruleset.skip_codes.iter().chain(ruleset.stop_codes.iter()) {
                if !(300..=699).contains(&code) {
                    return Err(ConfigError::InvalidCode {
                        service_key: ruleset.service_key.clone(),
                        code,
                    });
                }
            }
            if let Some(&code) = ruleset
                .skip_codes
                .iter()
                .find(|code| ruleset.stop_codes.contains(code))
            {
                return Err(ConfigError::ConflictingCode {
                    service_key: ruleset.service_key.clone(),
                    code,
                });
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "broker {} contact {} imscf {}:{}",
            crate::version::VERSION,
            self.broker.contact(),
            self.broker.imscf_host,
            self.broker.imscf_port
        )];
        for service in &self.services {
            lines.push(format!(
                "service {} external={} endpoints={}",
                service.alias,
                service.external,
                service.endpoints.len()
            ));
        }
        for ruleset in &self.rulesets {
            lines.push(format!(
                "ruleset {} -> {} default={:?}",
                ruleset.service_key,
                ruleset.services.join(" -> "),
                ruleset.default_error_handling
            ));
        }
        lines.join("\n")
    }
}
