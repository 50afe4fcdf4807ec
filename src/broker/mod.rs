use crate::{
    config::Config,
    error::ConfigError,
    metrics::{UsageCounters, UsageSnapshot},
    routing::{RoutingSnapshot, RoutingStore},
    scheduler::{PoolConfig, WorkerPool},
    sip::{SignalingTransport, TransportEvent},
};
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod context;
pub mod dispatch;
pub mod registry;
pub mod session;

pub use context::{BrokerContext, BrokerContextRef};
pub use registry::{SessionKey, SessionRegistry};
pub use session::{Session, SessionBody};

#[cfg(test)]
mod tests;

pub struct BrokerBuilder {
    config: Option<Config>,
    transport: Option<Arc<dyn SignalingTransport>>,
    cancel_token: Option<CancellationToken>,
}

/// Service broker core: classifies transport events into sessions and runs
/// them on the worker pool.
pub struct Broker {
    inner: BrokerContextRef,
    cancel_token: CancellationToken,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            transport: None,
            cancel_token: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Signaling stack the broker sends through.
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Result<Broker> {
        let config = self.config.unwrap_or_default();
        let transport = self
            .transport
            .ok_or_else(|| anyhow!("a signaling transport is required"))?;
        let imscf_route = config.broker.imscf_route()?;
        let routing = RoutingSnapshot::from_config(&config)?;
        let pool = WorkerPool::new(PoolConfig::from(&config.broker))?;
        info!(
            services = routing.directory.len(),
            rulesets = routing.ruleset_count(),
            contact = %config.broker.contact(),
            "broker ready"
        );
        let inner = Arc::new(BrokerContext {
            transport,
            contact: config.broker.contact(),
            imscf_route,
            routing: RoutingStore::new(routing),
            registry: SessionRegistry::new(),
            counters: UsageCounters::new(),
            pool,
        });
        Ok(Broker {
            inner,
            cancel_token: self.cancel_token.unwrap_or_default(),
        })
    }
}

impl Broker {
    /// Entry point for every event the signaling stack delivers.
    pub fn on_event(&self, event: TransportEvent) {
        dispatch::dispatch(&self.inner, event)
    }

    /// Swaps in the routing data of `config`. Sessions already running keep
    /// the ruleset they started with.
    pub fn reload(&self, config: &Config) -> Result<(), ConfigError> {
        let snapshot = RoutingSnapshot::from_config(config)?;
        info!(
            services = snapshot.directory.len(),
            rulesets = snapshot.ruleset_count(),
            "routing reloaded"
        );
        self.inner.routing.replace(snapshot);
        Ok(())
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.inner.counters.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.inner.registry.get(key)
    }

    pub fn context(&self) -> &BrokerContextRef {
        &self.inner
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn stop(&self) {
        info!("stopping broker");
        self.cancel_token.cancel();
    }

    /// Logs the usage counters every `report_interval` until stopped.
    pub async fn serve(&self, report_interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(report_interval);
        ticker.tick().await;
        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    info!("broker stopped, {} sessions still registered", self.session_count());
                    return Ok(());
                }
                _ = ticker.tick() => {
                    info!(sessions = self.session_count(), "usage: {}", self.usage());
                }
            }
        }
    }
}
