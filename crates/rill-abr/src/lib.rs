#![forbid(unsafe_code)]

//! Bitrate-profile bookkeeping and adaptation decisions.
//!
//! The collector registers the master manifest's variants here and consults
//! the controller at two points in the fetch loop: after a failed video
//! fragment download (`check_for_ramp_down`) and after a successful cycle
//! (`check_for_profile_change`). Throughput estimation is EWMA-based and
//! protocol-agnostic.

mod controller;
mod estimator;
mod types;

pub use controller::AbrController;
pub use estimator::ThroughputEstimator;
pub use types::{AbrOptions, ProfileEntry, ProfileRegistry, ThroughputSample};
