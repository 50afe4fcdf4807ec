pub mod message;
pub mod transport;

pub use message::MessageExt;
pub use transport::{
    CorrelationToken, DialogEvent, DialogId, Interface, OutgoingDialog, RequestEvent,
    ResponseEvent, SignalingTransport, TimeoutEvent, TransactionId, TransactionRole,
    TransportEvent,
};
