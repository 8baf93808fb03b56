//! Volume Types
//!
//! Type registry, extra specs and QoS resolution.

pub mod qos;
pub mod registry;

pub use qos::*;
pub use registry::*;
