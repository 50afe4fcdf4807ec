pub mod auxiliary;
pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestration;
pub mod ping;
pub mod routing;
pub mod scheduler;
pub mod sip;
pub mod version;

pub use broker::{Broker, BrokerBuilder};
