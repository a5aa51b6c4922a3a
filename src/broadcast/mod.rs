//! Broadcast Channel
//!
//! The one-to-many channel brokers announce themselves over. The
//! endpoint is an abstraction so discovery works the same over UDP
//! multicast and over the in-process bus used by tests and single
//! process multi-node setups.

mod endpoint;
mod group;

pub use endpoint::{
    BroadcastEndpoint, BroadcastEndpointFactory, LocalBroadcastBus, LocalBroadcastEndpoint,
    UdpBroadcastEndpoint, UdpBroadcastEndpointFactory,
};
pub use group::BroadcastGroup;
