//! fleet-core: shared vocabulary for the fleet provisioning engine.
//!
//! Every other crate in the workspace speaks in these types: the status
//! returned by a step invocation, the locality constraint between
//! experiment groups, and the string-keyed component parameters read
//! through typed accessors.

pub mod component;
pub mod config;
pub mod duration;
pub mod types;

pub use component::{ExperimentComponent, ParameterError, params};
pub use config::FleetConfig;
pub use duration::parse_duration;
pub use types::*;
