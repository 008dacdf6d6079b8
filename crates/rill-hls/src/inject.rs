//! Downstream pipeline interface and the per-track inject worker.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::state::{CollectorShared, TrackKind};

/// Container format of a track's fragments, detected from URI extensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SegmentFormat {
    MpegTs,
    Fmp4,
    AacEs,
    #[default]
    Unknown,
}

/// Pipeline setup pushed to the sink before the first fragment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineConfig {
    pub video_format: SegmentFormat,
    pub audio_format: SegmentFormat,
    pub audio_present: bool,
    pub trick_play: bool,
    pub rate: f64,
}

/// One fragment handed to the sink, in presentation order.
#[derive(Clone, Debug)]
pub struct StagedFragment {
    pub track: TrackKind,
    pub bytes: Bytes,
    pub position_s: f64,
    pub duration_s: f64,
    pub discontinuity: bool,
    /// Init segment (fMP4 header); emitted before any media fragment.
    pub init: bool,
}

/// Sink verdict for one fragment. `accepted == false` means the segment was
/// discarded downstream; the track is not charged backpressure for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SinkVerdict {
    pub accepted: bool,
    pub pts_error: bool,
}

impl SinkVerdict {
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            pts_error: false,
        }
    }
}

/// Downstream media pipeline (demuxer/injector or passthrough).
pub trait MediaSink: Send + Sync {
    /// Called once per tune with the negotiated pipeline shape.
    fn configure(&self, _config: &PipelineConfig) {}

    fn send_segment(&self, fragment: &StagedFragment) -> SinkVerdict;

    /// Flush any sink-side state (new tune, profile change).
    fn reset(&self) {}
}

/// Drains a track's staging ring into the sink, preserving order and
/// discontinuity flags. Exits when the ring closes or the collector stops.
pub(crate) async fn run_injector(
    track: TrackKind,
    mut ring: mpsc::Receiver<StagedFragment>,
    sink: Arc<dyn MediaSink>,
    shared: Arc<CollectorShared>,
) {
    debug!(track = track.name(), "injector started");
    loop {
        let fragment = tokio::select! {
            f = ring.recv() => f,
            () = shared.cancel.cancelled() => None,
        };
        let Some(fragment) = fragment else { break };

        let verdict = sink.send_segment(&fragment);
        // Approximate playback progress with the injected position; an
        // embedder wired to a real renderer overrides this.
        if verdict.accepted && track == TrackKind::Video && !fragment.init {
            shared.set_play_position_s(fragment.position_s + fragment.duration_s);
        }
        if !verdict.accepted {
            warn!(
                track = track.name(),
                position = fragment.position_s,
                "sink discarded fragment"
            );
        } else {
            trace!(
                track = track.name(),
                position = fragment.position_s,
                duration = fragment.duration_s,
                discontinuity = fragment.discontinuity,
                init = fragment.init,
                "fragment injected"
            );
        }
        if verdict.pts_error {
            warn!(track = track.name(), "sink reported PTS error");
        }
    }
    debug!(track = track.name(), "injector exited");
}
