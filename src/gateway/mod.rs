//! The HTTP surface: server façade, gateway endpoints and request forwarding.

pub mod forwarder;
pub mod handlers;
pub mod server;

pub use forwarder::{ForwardOutcome, Forwarder};
pub use server::{GatewayServer, GatewayState};
