#![forbid(unsafe_code)]

//! DRM session management and AES-128-CBC segment decryption.
//!
//! The [`DrmManager`] is the process-wide coordinator: it maps metadata
//! digests to sessions, drives license acquisition through the [`Licenser`]
//! back-end (immediately, lazily, or deferred), and owns the single pending
//! deferred-acquisition record. Sessions decrypt independently of each other;
//! a fragment decrypt blocks until its session's key material arrives or the
//! acquisition wait times out.

mod error;
mod manager;
mod metadata;
mod session;

pub use error::{DrmError, DrmResult};
pub use manager::{defer_jitter, DeferredLicense, DrmManager, Licenser};
pub use metadata::{DrmMetadata, MetadataHash};
pub use session::{DrmSession, KeyMaterial, MAX_LICENSE_ACQ_WAIT_TIME};
