use thiserror::Error;

/// Failure to construct or hand a message to the signaling stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to send {what}: {reason}")]
    Send { what: String, reason: String },
    #[error("cannot build {what}: {reason}")]
    Build { what: String, reason: String },
}

impl TransportError {
    pub fn send(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Send {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn build(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Build {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("service `{0}` is declared more than once")]
    DuplicateService(String),
    #[error("service `{0}` has no endpoints")]
    NoEndpoints(String),
    #[error("service `{alias}` has an invalid endpoint `{uri}`: {reason}")]
    InvalidEndpoint {
        alias: String,
        uri: String,
        reason: String,
    },
    #[error("ruleset `{0}` is declared more than once")]
    DuplicateRuleset(String),
    #[error("ruleset `{0}` does not chain any service")]
    EmptyRuleset(String),
    #[error("ruleset `{service_key}` references unknown service `{alias}`")]
    UnknownService { service_key: String, alias: String },
    #[error("ruleset `{service_key}` lists code {code} as both skip and stop")]
    ConflictingCode { service_key: String, code: u16 },
    #[error("ruleset `{service_key}` lists code {code}, only final error codes 300-699 are allowed")]
    InvalidCode { service_key: String, code: u16 },
    #[error("invalid worker pool settings: {0}")]
    Pool(String),
    #[error("invalid broker settings: {0}")]
    Broker(String),
}

/// Errors raised while a session processes an event.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected {what} in state {state}")]
    UnexpectedMessage { state: &'static str, what: String },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BrokerError {
    pub fn unexpected(state: &'static str, what: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            state,
            what: what.into(),
        }
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
