pub mod mailbox;
pub mod pool;

pub use mailbox::{Delivery, Mailbox, MailboxState, Rejected};
pub use pool::{PoolConfig, PoolError, WorkerPool};

#[cfg(test)]
mod tests;
