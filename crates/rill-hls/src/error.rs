use rill_events::TuneFailureKind;
use thiserror::Error;

pub type HlsResult<T> = Result<T, HlsError>;

/// Collector errors. Variants marked fatal transition the presentation to a
/// failed state; the rest are retried or logged at their call sites.
#[derive(Debug, Error)]
pub enum HlsError {
    /// Buffer does not start with `#EXTM3U`, unknown PLAYLIST-TYPE, or an
    /// unsupported encryption METHOD. Fatal.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Manifest download retries exhausted. Fatal.
    #[error("manifest request failed (status {status:?})")]
    ManifestRequestFailed { status: Option<u16> },

    /// Playlist downloaded but unusable (e.g. zero duration). Fatal.
    #[error("manifest content error: {0}")]
    ManifestContentError(String),

    /// Consecutive fragment download failures crossed the threshold. Fatal.
    #[error("fragment download failure (status {status:?})")]
    FragmentDownloadFailure { status: Option<u16> },

    /// Init segment could not be fetched. Fatal.
    #[error("init fragment download failure")]
    InitFragmentDownloadFailure,

    /// License did not arrive in time. Non-fatal; downloads continue.
    #[error("license acquisition timeout")]
    LicenseTimeout,

    /// Consecutive decrypt failures crossed the threshold. Fatal.
    #[error("DRM decrypt failed")]
    DrmDecryptFailed,

    /// A/V tracks could not be aligned at init. Fatal.
    #[error("tracks synchronization error: {0}")]
    TracksSynchronizationError(String),

    /// Seek target beyond VOD duration.
    #[error("seek position {target_s} beyond duration {duration_s}")]
    SeekRangeError { target_s: f64, duration_s: f64 },

    #[error(transparent)]
    Net(#[from] rill_net::NetError),

    #[error(transparent)]
    Drm(#[from] rill_drm::DrmError),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl HlsError {
    /// Event-taxonomy kind for fatal errors; `None` for non-fatal ones.
    #[must_use]
    pub fn tune_failure_kind(&self) -> Option<TuneFailureKind> {
        match self {
            Self::InvalidManifest(_) => Some(TuneFailureKind::InvalidManifest),
            Self::ManifestRequestFailed { .. } => Some(TuneFailureKind::ManifestRequestFailed),
            Self::ManifestContentError(_) => Some(TuneFailureKind::ManifestContentError),
            Self::FragmentDownloadFailure { .. } => Some(TuneFailureKind::FragmentDownloadFailure),
            Self::InitFragmentDownloadFailure => {
                Some(TuneFailureKind::InitFragmentDownloadFailure)
            }
            Self::DrmDecryptFailed => Some(TuneFailureKind::DrmDecryptFailed),
            Self::TracksSynchronizationError(_) => Some(TuneFailureKind::TracksSynchronization),
            Self::SeekRangeError { .. } => Some(TuneFailureKind::SeekRange),
            Self::LicenseTimeout | Self::Net(_) | Self::Drm(_) | Self::InvalidUrl(_) => None,
        }
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::ManifestRequestFailed { status } | Self::FragmentDownloadFailure { status } => {
                *status
            }
            Self::Net(e) => e.http_status(),
            _ => None,
        }
    }
}
