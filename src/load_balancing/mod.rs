//! Instance registry and load balancing for backend services.

pub mod instance;
pub mod router;
pub mod strategies;

pub use instance::{InstanceHealth, InstanceSnapshot, ServiceInstance};
pub use router::{PendingRequest, ServiceRouter, ServiceSnapshot};
pub use strategies::LoadBalancingStrategy;
