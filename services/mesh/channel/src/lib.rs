//! # Mesh Channel
//!
//! Point-to-point message channels between overlay nodes. The [`MessageChannelService`] owns all
//! outgoing channels of a node, notifies listeners about their lifecycle, dispatches incoming
//! requests to handlers or to the forwarding service, and runs periodic health checks that mark
//! silent channels as broken.
//!
//! Channels are created by [`transport::TransportProvider`]s; a TCP and an in-process transport
//! are included.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod handler;
pub mod health;
pub mod listener;
pub mod service;
pub mod stats;
pub mod transport;

pub use callbacks::ListenerId;
pub use channel::{describe, BrokenChannelListener, ChannelCore, ChannelState, MessageChannel};
pub use config::CommunicationConfig;
pub use endpoint::{EndpointHandler, ForwardingService};
pub use error::ChannelError;
pub use filter::ConnectionFilter;
pub use handler::{NetworkRequestHandler, RequestHandlerRegistry};
pub use health::{HealthCheckOutcome, HealthState};
pub use listener::{ChannelLifecycleListener, TrafficListener};
pub use service::MessageChannelService;
pub use stats::TrafficCounters;
pub use transport::TransportProvider;
