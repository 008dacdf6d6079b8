use thiserror::Error;

pub type DrmResult<T> = Result<T, DrmError>;

#[derive(Debug, Error, Clone)]
pub enum DrmError {
    /// Key material did not arrive within the acquisition wait window.
    #[error("key acquisition timed out")]
    KeyAcquisitionTimeout,

    #[error("decrypt failed: {0}")]
    DecryptFailed(String),

    #[error("license acquisition failed: {0}")]
    LicenseFailed(String),

    #[error("invalid DRM metadata: {0}")]
    InvalidMetadata(String),

    /// Key wait aborted by shutdown or re-tune.
    #[error("key wait cancelled")]
    Cancelled,
}
