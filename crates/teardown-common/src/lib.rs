//! Common types for cluster teardown: resource identity, convergence
//! trackers, retry policies, and errors

#![deny(missing_docs)]

pub mod error;
pub mod error_tracker;
pub mod pending;
pub mod resource;
pub mod retry;

pub use error::Error;
pub use error_tracker::ErrorTracker;
pub use pending::PendingItemTracker;
pub use resource::{FilterSet, ListFilter, ResourceDescriptor, ResourceSet, TagFilter};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default interval between stage polls
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Default budget for draining and deleting cluster-resident volumes
pub const DEFAULT_VOLUME_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Status value providers report for objects already being deleted
pub const STATUS_DELETING: &str = "Deleting";
