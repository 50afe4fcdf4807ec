use crate::config::BrokerConfig;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool saturated ({capacity} jobs outstanding)")]
    Saturated { capacity: usize },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_threads: usize,
    pub max_threads: usize,
    pub queue_max_size: usize,
    pub keepalive: Duration,
}

impl From<&BrokerConfig> for PoolConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            initial_threads: config.initial_threads,
            max_threads: config.max_threads,
            queue_max_size: config.queue_max_size,
            keepalive: Duration::from_secs(config.keepalive_secs),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        (&BrokerConfig::default()).into()
    }
}

/// Bounded pool running session drain routines on the blocking threads of a
/// dedicated tokio runtime. At most `max_threads` jobs run at once and at most
/// `max_threads + queue_max_size` are admitted; anything beyond is rejected.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
}

struct Admission(Arc<AtomicUsize>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> anyhow::Result<Self> {
        if config.max_threads == 0 || config.initial_threads == 0 {
            return Err(anyhow::anyhow!("worker pool needs at least one thread"));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.initial_threads)
            .max_blocking_threads(config.max_threads)
            .thread_keep_alive(config.keepalive)
            .thread_name("sipbroker-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let capacity = config.max_threads + config.queue_max_size;
        info!(
            initial_threads = config.initial_threads,
            max_threads = config.max_threads,
            capacity,
            "worker pool started"
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity,
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let previous = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if previous >= self.capacity {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Saturated {
                capacity: self.capacity,
            });
        }
        let admission = Admission(self.outstanding.clone());
        self.handle.spawn_blocking(move || {
            let _admission = admission;
            job();
        });
        Ok(())
    }

    /// Jobs admitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
