pub mod chain;
pub mod context;
pub mod fsm;
pub mod leg;

pub use chain::Chain;
pub use context::{SessionContext, SessionState};
pub use fsm::Fsm;
pub use leg::{ImScfSide, Leg, LegId, LegKind, LegState, Outbound};
