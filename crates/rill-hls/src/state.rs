//! Shared collector and per-track state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rill_events::EventBus;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::index::MediaPlaylist;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    #[must_use]
    pub fn other(&self) -> Self {
        match self {
            Self::Video => Self::Audio,
            Self::Audio => Self::Video,
        }
    }
}

impl From<TrackKind> for rill_net::TrackHint {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Video => Self::Video,
            TrackKind::Audio => Self::Audio,
        }
    }
}

/// Collector-wide flags and services, shared by both tracks.
pub(crate) struct CollectorShared {
    pub events: EventBus,
    pub cancel: CancellationToken,
    pub downloads_enabled: AtomicBool,
    pub network_down: AtomicBool,
    pub first_fragment_decrypted: AtomicBool,
    /// Current playback position in seconds (f64 bits). Advanced by the
    /// injector as fragments are handed downstream; embedders can override
    /// it with real renderer positions.
    play_position_bits: AtomicU64,
}

impl CollectorShared {
    pub fn new(events: EventBus, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            downloads_enabled: AtomicBool::new(true),
            network_down: AtomicBool::new(false),
            first_fragment_decrypted: AtomicBool::new(false),
            play_position_bits: AtomicU64::new(0),
        }
    }

    pub fn play_position_s(&self) -> f64 {
        f64::from_bits(self.play_position_bits.load(Ordering::Acquire))
    }

    pub fn set_play_position_s(&self, position_s: f64) {
        self.play_position_bits
            .store(position_s.to_bits(), Ordering::Release);
    }

    pub fn downloads_enabled(&self) -> bool {
        self.downloads_enabled.load(Ordering::Acquire)
    }

    pub fn disable_downloads(&self) {
        self.downloads_enabled.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn set_network_down(&self, down: bool) {
        self.network_down.store(down, Ordering::Release);
    }

    pub fn is_network_down(&self) -> bool {
        self.network_down.load(Ordering::Acquire)
    }
}

/// The published playlist view of one track. Swapped atomically (under the
/// mutex) on every successful refresh.
#[derive(Clone, Debug)]
pub(crate) struct PlaylistSnapshot {
    pub buffer: Arc<str>,
    pub playlist: Arc<MediaPlaylist>,
    pub effective_url: Option<Url>,
    /// Content removed from the head of the sliding window so far.
    pub culled_seconds: f64,
    /// Refresh generation, bumped on every publication.
    pub generation: u64,
}

impl Default for PlaylistSnapshot {
    fn default() -> Self {
        Self {
            buffer: Arc::from(""),
            playlist: Arc::new(MediaPlaylist::default()),
            effective_url: None,
            culled_seconds: 0.0,
            generation: 0,
        }
    }
}

/// Per-track state visible to the other track (discontinuity matching) and
/// to the coordinator.
pub(crate) struct SharedTrack {
    pub kind: TrackKind,
    pub enabled: bool,
    snapshot: Mutex<PlaylistSnapshot>,
    /// Signaled after each index publication.
    pub indexed: Notify,
    /// Newest discontinuity position (window time + culled) already matched.
    pub last_matched_discontinuity: Mutex<f64>,
}

impl SharedTrack {
    pub fn new(kind: TrackKind, enabled: bool) -> Self {
        Self {
            kind,
            enabled,
            snapshot: Mutex::new(PlaylistSnapshot::default()),
            indexed: Notify::new(),
            last_matched_discontinuity: Mutex::new(-1.0),
        }
    }

    pub async fn snapshot(&self) -> PlaylistSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Publish a new index and wake discontinuity waiters.
    pub async fn publish(
        &self,
        buffer: Arc<str>,
        playlist: Arc<MediaPlaylist>,
        effective_url: Option<Url>,
        culled_delta: f64,
    ) -> PlaylistSnapshot {
        let mut guard = self.snapshot.lock().await;
        guard.buffer = buffer;
        guard.playlist = playlist;
        if effective_url.is_some() {
            guard.effective_url = effective_url;
        }
        guard.culled_seconds += culled_delta.max(0.0);
        guard.generation += 1;
        let published = guard.clone();
        drop(guard);
        self.indexed.notify_waiters();
        published
    }
}
