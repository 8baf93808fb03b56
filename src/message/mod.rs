//! User Messages
//!
//! Stable catalog of actions and details plus the store of message records
//! produced when a lifecycle operation fails.

pub mod api;
pub mod catalog;

pub use api::*;
pub use catalog::*;
