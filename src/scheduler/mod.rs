//! Scheduler / Backend Selector
//!
//! Filter scheduler over pool state reported by drivers, plus backup host
//! selection.

pub mod backend_state;
pub mod backup;
pub mod extra_specs_ops;
pub mod filters;
pub mod selector;
pub mod weighers;

pub use backend_state::{BackendStateManager, PoolState};
pub use backup::{BackupService, BackupServiceRegistry};
pub use filters::{BackendFilter, RequestSpec};
pub use selector::{FilterScheduler, WeighedBackend, WeigherMultipliers};
pub use weighers::BackendWeigher;
