use std::time::Duration;

use rill_abr::AbrOptions;
use rill_net::NetOptions;

/// Collector configuration.
#[derive(Clone, Debug)]
pub struct HlsConfig {
    /// Network configuration for the default transport.
    pub net: NetOptions,
    /// ABR configuration (initial bandwidth, switch thresholds).
    pub abr: AbrOptions,
    /// Distance from the live edge to start playback at.
    pub live_offset_s: f64,
    /// Trick-play frame rates for linear and VOD content.
    pub linear_trick_play_fps: u32,
    pub vod_trick_play_fps: u32,
    /// Preferred audio rendition language (BCP-47 primary subtag).
    pub preferred_audio_language: String,
    /// Whether the audio track is collected at all.
    pub audio_enabled: bool,
    /// Cached fragments per track (staging ring capacity).
    pub fragment_cache_len: usize,
    /// Download both media playlists concurrently at tune.
    pub parallel_playlist_download: bool,
    /// Prefer program-date-time for initial A/V sync when available.
    pub use_program_date_time: bool,
    /// Keep VOD playlists in the in-memory URL-keyed cache.
    pub enable_playlist_cache: bool,
    /// Server-side time-shift buffer present (affects how long a
    /// discontinuity match waits on refreshes).
    pub tsb_supported: bool,
    /// Suppress cross-track discontinuity verification entirely.
    pub ignore_discontinuity: bool,
    /// Bound on license acquisition wait during decrypt.
    pub license_acq_timeout: Duration,
    /// Event bus channel capacity.
    pub event_capacity: usize,
    /// In-playlist tags reported as timed metadata (full names, e.g.
    /// `EXT-X-CUE`).
    pub subscribed_tags: Vec<String>,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            net: NetOptions::default(),
            abr: AbrOptions::default(),
            live_offset_s: 15.0,
            linear_trick_play_fps: 8,
            vod_trick_play_fps: 4,
            preferred_audio_language: "en".to_string(),
            audio_enabled: true,
            fragment_cache_len: 3,
            parallel_playlist_download: true,
            use_program_date_time: false,
            enable_playlist_cache: true,
            tsb_supported: false,
            ignore_discontinuity: false,
            license_acq_timeout: rill_drm::MAX_LICENSE_ACQ_WAIT_TIME,
            event_capacity: 32,
            subscribed_tags: Vec::new(),
        }
    }
}

impl HlsConfig {
    pub fn with_live_offset(mut self, secs: f64) -> Self {
        self.live_offset_s = secs;
        self
    }

    pub fn with_audio_language(mut self, lang: impl Into<String>) -> Self {
        self.preferred_audio_language = lang.into();
        self
    }

    pub fn with_audio_enabled(mut self, enabled: bool) -> Self {
        self.audio_enabled = enabled;
        self
    }

    pub fn with_abr(mut self, abr: AbrOptions) -> Self {
        self.abr = abr;
        self
    }

    pub fn with_net(mut self, net: NetOptions) -> Self {
        self.net = net;
        self
    }

    pub fn with_fragment_cache_len(mut self, len: usize) -> Self {
        self.fragment_cache_len = len.max(1);
        self
    }

    pub fn with_program_date_time_sync(mut self, enabled: bool) -> Self {
        self.use_program_date_time = enabled;
        self
    }
}
