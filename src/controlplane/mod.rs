//! Volume Lifecycle Control Plane
//!
//! Coordinates lifecycle requests against backend drivers while keeping the
//! volume, snapshot, attachment and backup state machines consistent.

pub mod api;
pub mod backends;
pub mod locks;
pub mod manager;
pub mod quota;
pub mod store;
pub mod transitions;

pub use api::*;
pub use backends::*;
pub use locks::*;
pub use manager::*;
pub use quota::*;
pub use store::*;
pub use transitions::*;
