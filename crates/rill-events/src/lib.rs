#![forbid(unsafe_code)]

//! Event bus and event taxonomy for the rill streaming client.

mod bus;
mod event;

pub use bus::EventBus;
pub use event::{CollectorState, MediaMetadata, StreamEvent, TuneFailureKind};
