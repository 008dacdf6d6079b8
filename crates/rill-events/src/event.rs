/// Coarse lifecycle state of the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Tuning,
    Collecting,
    Completed,
    Failed,
}

/// Why a tune failed. Mirrors the collector's fatal error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TuneFailureKind {
    InvalidManifest,
    ManifestRequestFailed,
    ManifestContentError,
    FragmentDownloadFailure,
    InitFragmentDownloadFailure,
    DrmDecryptFailed,
    TracksSynchronization,
    SeekRange,
}

/// Presentation-level metadata published once playlists are indexed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaMetadata {
    pub duration_s: f64,
    pub is_live: bool,
    pub languages: Vec<String>,
    pub bitrates_bps: Vec<u64>,
    pub has_drm: bool,
    pub has_iframe_track: bool,
}

/// Events emitted by the collector.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// Active variant changed (initial selection included).
    BitrateChanged {
        bandwidth_bps: u64,
        width: u32,
        height: u32,
    },
    /// Presentation metadata is known.
    Metadata(MediaMetadata),
    /// A subscribed in-playlist tag was observed while indexing.
    TimedMetadata {
        position_ms: u64,
        name: String,
        content: String,
    },
    /// A track finished (re)indexing its playlist.
    PlaylistIndexed { track: &'static str },
    /// First encrypted fragment decrypted successfully.
    FirstFragmentDecrypted,
    /// Live window slid; seconds culled from the head since last refresh.
    CullingUpdated { culled_s: f64 },
    /// Tune or seek landed at the live point.
    EnteringLive,
    /// Non-fatal anomaly worth surfacing (e.g. license wait timeout).
    Warning { message: String },
    /// Fatal failure; collection stops.
    TuneFailed {
        kind: TuneFailureKind,
        http_status: Option<u16>,
    },
    /// Lifecycle transition.
    StateChanged {
        from: CollectorState,
        to: CollectorState,
    },
}
