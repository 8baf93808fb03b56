//! Cinder Core - Volume Lifecycle Orchestration
//!
//! The lifecycle and state-machine layer of a block storage service: routes
//! create / attach / detach / extend / delete / snapshot / backup / restore
//! requests to backend drivers, keeps resource statuses consistent, and turns
//! driver failures into user-facing messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              REST API (axum)                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                           Lifecycle Manager                                  │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  State Machines │  │ Resource Locks  │  │   Message Catalog / API     │  │
//! │  │  (transitions)  │  │ (ordered, async)│  │   (action + detail codes)   │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Filter Scheduler│  │  Volume Types   │  │   Manage Existing /         │  │
//! │  │ (filter, weigh) │  │  + QoS resolver │  │   Manageable listing        │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Driver Ports                                        │
//! │  ┌───────────────────────────────────┐  ┌───────────────────────────────┐   │
//! │  │          VolumeDriver             │  │         BackupDriver          │   │
//! │  └───────────────────────────────────┘  └───────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Lifecycle manager, locks, store, state machines and API
//! - [`scheduler`]: Backend filtering and weighing, backup host selection
//! - [`volume_types`]: Volume types, extra specs and QoS specs
//! - [`manageable`]: Manage-existing validation and manageable listings
//! - [`message`]: User message catalog and store
//! - [`domain`]: Resource records, request context and driver traits
//! - [`config`]: Service configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod manageable;
pub mod message;
pub mod metrics;
pub mod scheduler;
pub mod volume_types;

// Re-export commonly used types
pub use config::ServiceConfig;

pub use controlplane::{
    ApiServer, ApiServerConfig, DriverRegistry, LifecycleManager, ManagerSettings,
    ResourceLocks, ResourceStore, RestRouter, VolumeOperation,
};

pub use domain::{
    Attachment, Backup, BackupDriver, OperationContext, Snapshot, Volume, VolumeDriver,
    VolumeStatus,
};

pub use error::{Error, ErrorKind, Result};

pub use message::{Action, Detail, Message, MessageApi, ResourceType};

pub use scheduler::{FilterScheduler, RequestSpec};

pub use volume_types::{QosSpecs, VolumeType, VolumeTypeRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
