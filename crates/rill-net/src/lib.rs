#![forbid(unsafe_code)]

//! HTTP transport seam for the rill streaming client.
//!
//! The collector core never talks to `reqwest` directly; it goes through the
//! [`Transport`] trait so tests can substitute an in-memory implementation and
//! embedders can bring their own stack.

mod client;
mod error;
mod retry;
mod traits;
mod types;

pub use client::HttpTransport;
pub use error::{NetError, NetResult};
pub use retry::RetryPolicy;
pub use traits::{SharedTransport, Transport};
pub use types::{ByteRange, FetchRequest, FetchResponse, NetOptions, ResourceKind, TrackHint};
