//! Path prefix to backend service resolution.

pub mod router;

pub use router::{Route, RouteTable};
