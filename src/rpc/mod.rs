pub mod connection_manager;
pub mod error;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "testkit"))]
pub mod mock;

pub use connection_manager::{ConnectionHealth, ConnectionManager, RetrySettings};
pub use error::RpcError;
pub use registry::{SubscriptionKind, SubscriptionState};
pub use transport::{
    AccountUpdate, LogsUpdate, ProgramAccountFilter, RpcTransport, SolanaTransport,
    TransportSubscription,
};
