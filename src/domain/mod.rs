//! Domain layer - Core records and port definitions
//!
//! This module defines the canonical resource records, the request context
//! threaded through every lifecycle call, and the driver traits (ports) that
//! backend adapters implement, following hexagonal architecture principles.

pub mod context;
pub mod host;
pub mod model;
pub mod ports;

pub use context::*;
pub use host::*;
pub use model::*;
pub use ports::*;
