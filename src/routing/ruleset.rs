use crate::{config::RulesetConfig, error::ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do when a leg answers with a final error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Splice the failing leg out and continue with its successor.
    Skip,
    /// Abort the chain and report the error upstream.
    #[default]
    Stop,
}

/// Chain template for one service key.
#[derive(Debug, Clone)]
pub struct Ruleset {
    pub service_key: String,
    pub services: Vec<String>,
    policies: HashMap<u16, ErrorPolicy>,
    pub default_policy: ErrorPolicy,
}

impl Ruleset {
    pub fn new(
        service_key: impl Into<String>,
        services: Vec<String>,
        default_policy: ErrorPolicy,
    ) -> Self {
        Self {
            service_key: service_key.into(),
            services,
            policies: HashMap::new(),
            default_policy,
        }
    }

    pub fn with_policy(mut self, code: u16, policy: ErrorPolicy) -> Self {
        self.policies.insert(code, policy);
        self
    }

    pub fn from_config(config: &RulesetConfig) -> Result<Self, ConfigError> {
        if config.services.is_empty() {
            return Err(ConfigError::EmptyRuleset(config.service_key.clone()));
        }
        let mut ruleset = Self::new(
            config.service_key.clone(),
            config.services.clone(),
            config.default_error_handling,
        );
        for (codes, policy) in [
            (&config.skip_codes, ErrorPolicy::Skip),
            (&config.stop_codes, ErrorPolicy::Stop),
        ] {
            for &code in codes {
                if !(300..=699).contains(&code) {
                    return Err(ConfigError::InvalidCode {
                        service_key: config.service_key.clone(),
                        code,
                    });
                }
                if let Some(previous) = ruleset.policies.insert(code, policy) {
                    if previous != policy {
                        return Err(ConfigError::ConflictingCode {
                            service_key: config.service_key.clone(),
                            code,
                        });
                    }
                }
            }
        }
        Ok(ruleset)
    }

    pub fn policy_for(&self, code: u16) -> ErrorPolicy {
        self.policies
            .get(&code)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Aliases following template slot `position`.
    pub fn services_after(&self, position: usize) -> &[String] {
        self.services.get(position + 1..).unwrap_or(&[])
    }
}
