//! # spotter-id
//!
//! Validated name types for the cloud resources the spot manager touches.
//!
//! ## Design Principles
//!
//! - Names are assigned by the cloud provider or the operator; we never mint them
//! - All names are validated once at the boundary and are immutable afterwards
//! - Names are typed so an ASG name can't be passed where a launch configuration
//!   name is expected
//!
//! ## Formats
//!
//! - `AsgName`: 1-255 characters, no control characters
//! - `LaunchConfigName`: 1-255 characters, no control characters
//! - `InstanceId`: `i-` followed by lowercase hex, e.g. `i-0abc123def4567890`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
