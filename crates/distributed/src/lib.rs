//! Foreman relay: forwards query lifecycle signals and result streams from
//! executors to the coordinator node that owns each query.
//!
//! Architecture role:
//! - [`forwarding`] decides whether a message must leave this node
//! - [`control`] forwards one-shot lifecycle notifications
//! - [`results`] multiplexes result chunks onto one stream per query and
//!   correlates acknowledgments back to each chunk's sender
//! - [`grpc`] exposes the relay as tonic services
//!
//! Key modules:
//! - [`channel`]
//! - [`control`]
//! - [`forwarding`]
//! - [`grpc`]
//! - [`maestro`]
//! - [`results`]
//! - [`sender`]

pub mod channel;
pub mod control;
pub mod forwarding;
pub mod grpc;
pub mod maestro;
pub mod results;
pub mod sender;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelProvider, ForemanChannel, GrpcChannelProvider};
pub use control::{ControlSignalForwarder, SignalKind};
pub use forwarding::{EndpointProvider, must_forward};
pub use grpc::RelayServices;
pub use maestro::MaestroForwarder;
pub use results::ResultsRelay;
pub use sender::{OneShotResponseSender, ResponseSender};
