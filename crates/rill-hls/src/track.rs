//! Per-track fetch loop: fragment selection, download, decrypt, staging, and
//! the live playlist refresh cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rill_abr::{AbrController, ThroughputSample};
use rill_drm::{defer_jitter, DrmError, DrmManager, MetadataHash};
use rill_events::StreamEvent;
use rill_net::{ByteRange, FetchRequest, ResourceKind, SharedTransport};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::HlsConfig;
use crate::constants::{
    MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS, MAX_MANIFEST_DOWNLOAD_RETRY,
    MAX_SEG_DOWNLOAD_FAIL_COUNT, MAX_SEG_DRM_DECRYPT_FAIL_COUNT,
    MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS, PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS,
};
use crate::error::{HlsError, HlsResult};
use crate::index::{EncryptionMethod, KeyTagInfo, MediaPlaylist, PlaylistKind};
use crate::inject::StagedFragment;
use crate::master::MasterManifest;
use crate::parser::{AttrIter, Lines, PlaylistLine, TagKind};
use crate::state::{CollectorShared, PlaylistSnapshot, SharedTrack, TrackKind};

/// The fragment chosen by a playlist walk or index lookup.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SelectedFragment {
    pub uri: String,
    pub duration_s: f64,
    pub byte_range: Option<ByteRange>,
    pub encrypted: bool,
    pub key: Option<KeyTagInfo>,
    pub drm_metadata_idx: Option<usize>,
    pub discontinuity: bool,
}

/// Out-of-band requests from the coordinator/ABR into a running fetch loop.
#[derive(Default)]
pub(crate) struct TrackControl {
    pub refresh_requested: AtomicBool,
    pub force_drm_reprocess: AtomicBool,
    pub inject_init_fragment: AtomicBool,
    pub new_playlist_url: std::sync::Mutex<Option<Url>>,
}

impl TrackControl {
    /// Mark the controller to re-resolve its playlist and re-download on the
    /// next loop iteration (ABR profile change / ramp-down).
    pub fn profile_changed(&self, new_url: Url) {
        *self
            .new_playlist_url
            .lock()
            .expect("track control mutex poisoned") = Some(new_url);
        self.inject_init_fragment.store(true, Ordering::Release);
        self.force_drm_reprocess.store(true, Ordering::Release);
        self.refresh_requested.store(true, Ordering::Release);
    }
}

/// Result of one fetch cycle.
enum Cycle {
    /// Fragment handled (or dropped after an error); keep looping.
    Continue,
    /// The walk found nothing; refresh or end-of-stream decides what's next.
    NoFragment,
    /// Fatal error published; worker must exit.
    Fatal,
}

/// Master-manifest link the video track needs to re-resolve profile URLs.
pub(crate) struct MasterLink {
    pub master: MasterManifest,
    pub base_url: Url,
}

impl MasterLink {
    pub fn profile_url(&self, profile_idx: usize) -> Option<Url> {
        let uri = &self.master.profiles.get(profile_idx)?.uri;
        self.base_url.join(uri).ok()
    }
}

/// Text walker over the published playlist buffer.
///
/// `position_s` and `next_media_sequence_number` live on a continuous
/// since-tune timeline; they are never reset by live refreshes (the walk is
/// re-pointed into the new buffer by sequence number instead).
struct PlaylistWalker {
    buffer: Arc<str>,
    playlist: Arc<MediaPlaylist>,
    offset: usize,
    position_s: f64,
    fragment_duration_s: f64,
    next_media_sequence_number: u64,
    key_tags_seen: usize,
    byte_range_cursor: u64,
    pending_byte_range: Option<ByteRange>,
    last_selection: Option<SelectedFragment>,
}

struct WalkHit {
    fragment: SelectedFragment,
    discontinuity: bool,
    program_date_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl PlaylistWalker {
    fn new() -> Self {
        Self {
            buffer: Arc::from(""),
            playlist: Arc::new(MediaPlaylist::default()),
            offset: 0,
            position_s: -1.0,
            fragment_duration_s: 0.0,
            next_media_sequence_number: 0,
            key_tags_seen: 0,
            byte_range_cursor: 0,
            pending_byte_range: None,
            last_selection: None,
        }
    }

    fn governing_key(&self) -> Option<&KeyTagInfo> {
        self.key_tags_seen
            .checked_sub(1)
            .and_then(|i| self.playlist.key_tags.get(i))
    }

    fn build_selection(&mut self, uri: &str, discontinuity: bool) -> SelectedFragment {
        let key = self.governing_key().cloned();
        let encrypted = key
            .as_ref()
            .is_some_and(|k| k.method == EncryptionMethod::Aes128);
        let drm_metadata_idx = key.as_ref().and_then(|k| k.cm_hash).and_then(|hash| {
            self.playlist
                .drm_metadata
                .iter()
                .position(|m| m.hash == hash)
        });
        SelectedFragment {
            uri: uri.to_string(),
            duration_s: self.fragment_duration_s,
            byte_range: self.pending_byte_range.take(),
            encrypted,
            key: if encrypted { key } else { None },
            drm_metadata_idx,
            discontinuity,
        }
    }

    /// Advance to the first URI whose start position reaches `play_target`
    /// (within the selection threshold). Skipped fragments shed their
    /// discontinuity and date-time annotations.
    fn step(&mut self, play_target: f64) -> Option<WalkHit> {
        if self.position_s >= 0.0 && self.position_s == play_target {
            if let Some(last) = self.last_selection.clone() {
                trace!(position = self.position_s, "re-serving current fragment");
                return Some(WalkHit {
                    discontinuity: last.discontinuity,
                    fragment: last,
                    program_date_time: None,
                });
            }
        }

        let buffer = self.buffer.clone();
        let mut lines = Lines::at_offset(&buffer, self.offset);
        let mut discontinuity = false;
        let mut program_date_time = None;

        while let Some(entry) = lines.next() {
            match entry.line {
                PlaylistLine::Tag { kind, rest, .. } => match kind {
                    TagKind::Inf => {
                        if self.position_s < 0.0 {
                            self.position_s = 0.0;
                        } else {
                            self.position_s += self.fragment_duration_s;
                        }
                        self.fragment_duration_s = crate::parser::parse_extinf_duration(rest);
                    }
                    TagKind::ByteRange => {
                        if let Some((length, offset)) =
                            crate::parser::parse_byte_range(rest, self.byte_range_cursor)
                        {
                            self.pending_byte_range =
                                Some(ByteRange::from_length_offset(length, offset));
                            self.byte_range_cursor = offset + length;
                        }
                    }
                    TagKind::MediaSequence => {
                        self.next_media_sequence_number = rest.trim().parse().unwrap_or(0);
                    }
                    TagKind::Key => {
                        self.key_tags_seen += 1;
                    }
                    TagKind::Discontinuity => discontinuity = true,
                    TagKind::ProgramDateTime => {
                        program_date_time = crate::parser::parse_program_date_time(rest);
                    }
                    _ => {}
                },
                PlaylistLine::Uri(uri) => {
                    self.next_media_sequence_number += 1;
                    let selected = self.position_s >= play_target
                        || (play_target - self.position_s) < PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS;
                    if selected {
                        self.offset = lines.pos();
                        let fragment = self.build_selection(uri, discontinuity);
                        self.last_selection = Some(fragment.clone());
                        return Some(WalkHit {
                            fragment,
                            discontinuity,
                            program_date_time,
                        });
                    }
                    discontinuity = false;
                    program_date_time = None;
                    self.pending_byte_range = None;
                }
                PlaylistLine::Comment(_) => {}
            }
        }
        self.offset = buffer.len();
        None
    }

    /// Point the walk into a freshly published buffer, continuing from the
    /// current media sequence number. VOD restarts from the beginning (the
    /// window is stable, only the profile changed).
    fn rebase(&mut self, snapshot: &PlaylistSnapshot) {
        let was_vod = self.playlist.playlist_kind == PlaylistKind::Vod;
        self.buffer = snapshot.buffer.clone();
        self.playlist = snapshot.playlist.clone();
        self.byte_range_cursor = 0;
        self.pending_byte_range = None;

        // Full restart only for VOD-to-VOD (profile switch over a stable
        // window). A live stream that just gained ENDLIST keeps its
        // sequence-based continuation.
        if self.playlist.playlist_kind == PlaylistKind::Vod && was_vod {
            self.offset = 0;
            self.position_s = -1.0;
            self.fragment_duration_s = 0.0;
            self.next_media_sequence_number = 0;
            self.key_tags_seen = 0;
            self.last_selection = None;
            return;
        }

        let current_seq = self.next_media_sequence_number.saturating_sub(1);
        let first = self.playlist.first_media_sequence_number;
        let idx = if current_seq < first {
            warn!(
                current_seq,
                window_first = first,
                "sequence gap after refresh, jumping to window start"
            );
            self.next_media_sequence_number = first + 1;
            self.last_selection = None;
            0
        } else {
            let rel = (current_seq - first) as usize;
            if rel >= self.playlist.fragments.len() {
                // Nothing new in the window yet; the walk stays exhausted.
                self.offset = self.buffer.len();
                return;
            }
            rel
        };

        let node = self.playlist.fragments[idx];
        self.fragment_duration_s = node.duration_s;
        self.key_tags_seen = node.key_tag_idx.map_or(0, |k| k + 1);
        self.offset = offset_after_fragment_uri(&self.buffer, node.info_offset);
    }
}

/// Byte offset just past the URI line of the fragment whose EXTINF starts at
/// `info_offset`.
fn offset_after_fragment_uri(buffer: &str, info_offset: usize) -> usize {
    let mut lines = Lines::at_offset(buffer, info_offset);
    while let Some(entry) = lines.next() {
        if matches!(entry.line, PlaylistLine::Uri(_)) {
            return lines.pos();
        }
    }
    buffer.len()
}

/// First URI line at or after `offset`.
fn uri_at(buffer: &str, offset: usize) -> Option<String> {
    Lines::at_offset(buffer, offset).find_map(|entry| match entry.line {
        PlaylistLine::Uri(uri) => Some(uri.to_string()),
        _ => None,
    })
}

/// `EXT-X-MAP` attribute text → (uri, byte range).
fn parse_init_fragment_info(info: &str) -> Option<(String, Option<ByteRange>)> {
    let mut uri = None;
    let mut range = None;
    for (name, value) in AttrIter::new(info) {
        match name {
            "URI" => uri = Some(value.to_string()),
            "BYTERANGE" => {
                if let Some((length, offset)) = crate::parser::parse_byte_range(value, 0) {
                    range = Some(ByteRange::from_length_offset(length, offset));
                }
            }
            _ => {}
        }
    }
    Some((uri?, range))
}

/// Buffer-depth-driven delay until the next live playlist refresh.
///
/// Clamped to `[500 ms, 6 s]` after subtracting the time already spent since
/// the previous download.
pub(crate) fn compute_refresh_delay(
    buffer_ms: i64,
    target_duration_s: f64,
    since_last_download: Duration,
) -> Duration {
    let max = MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64;
    let min = MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64;
    let target_ms = (target_duration_s * 1000.0) as i64;

    let mut delay = if buffer_ms > 2 * target_ms {
        (1.5 * target_duration_s * 1000.0) as i64
    } else if buffer_ms > target_ms {
        (0.5 * target_duration_s * 1000.0) as i64
    } else if buffer_ms > 2 * max {
        max
    } else if buffer_ms > 0 {
        buffer_ms / 3
    } else {
        min
    };

    delay -= since_last_download.as_millis() as i64;
    Duration::from_millis(delay.clamp(min, max) as u64)
}

/// Big-endian media sequence number, the HLS default IV when `IV=` is absent.
fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Per-track fetch state machine.
///
/// Created by the coordinator, which drives playlist load and A/V sync on it
/// directly before `run()` moves it onto its worker task.
pub(crate) struct TrackController {
    pub kind: TrackKind,
    config: Arc<HlsConfig>,
    transport: SharedTransport,
    drm: Arc<DrmManager>,
    abr: Arc<Mutex<AbrController>>,
    master: Arc<MasterLink>,
    pub shared: Arc<SharedTrack>,
    other: Arc<SharedTrack>,
    collector: Arc<CollectorShared>,
    pub control: Arc<TrackControl>,
    ring: mpsc::Sender<StagedFragment>,

    playlist_url: Url,
    effective_url: Url,

    rate: f64,
    trick_play: bool,
    trick_play_fps: u32,
    tsb_like: bool,
    defer_eligible: bool,

    walker: PlaylistWalker,
    pub play_target_s: f64,
    pub play_target_offset_s: f64,
    current_index: Option<usize>,
    pub eos: bool,
    walk_exhausted: bool,

    sync_after_discontinuity: bool,
    cm_hash: Option<MetadataHash>,
    drm_metadata_index_position: usize,
    first_index_done: bool,
    ramp_down_this_cycle: bool,

    seg_dl_fail_count: u32,
    seg_drm_decrypt_fail_count: u32,
    manifest_dl_fail_count: u32,
    last_playlist_download: Instant,
}

#[allow(clippy::too_many_arguments)]
impl TrackController {
    pub fn new(
        kind: TrackKind,
        config: Arc<HlsConfig>,
        transport: SharedTransport,
        drm: Arc<DrmManager>,
        abr: Arc<Mutex<AbrController>>,
        master: Arc<MasterLink>,
        shared: Arc<SharedTrack>,
        other: Arc<SharedTrack>,
        collector: Arc<CollectorShared>,
        ring: mpsc::Sender<StagedFragment>,
        playlist_url: Url,
    ) -> Self {
        Self {
            kind,
            config,
            transport,
            drm,
            abr,
            master,
            shared,
            other,
            collector,
            control: Arc::new(TrackControl::default()),
            ring,
            effective_url: playlist_url.clone(),
            playlist_url,
            rate: 1.0,
            trick_play: false,
            trick_play_fps: 4,
            tsb_like: false,
            defer_eligible: false,
            walker: PlaylistWalker::new(),
            play_target_s: 0.0,
            play_target_offset_s: 0.0,
            current_index: None,
            eos: false,
            walk_exhausted: false,
            sync_after_discontinuity: false,
            cm_hash: None,
            drm_metadata_index_position: 0,
            first_index_done: false,
            ramp_down_this_cycle: false,
            seg_dl_fail_count: 0,
            seg_drm_decrypt_fail_count: 0,
            manifest_dl_fail_count: 0,
            last_playlist_download: Instant::now(),
        }
    }

    pub fn set_mode(&mut self, rate: f64, trick_play: bool, trick_play_fps: u32) {
        self.rate = rate;
        self.trick_play = trick_play;
        self.trick_play_fps = trick_play_fps.max(1);
    }

    pub fn set_tune_context(&mut self, tsb_like: bool, defer_eligible: bool) {
        self.tsb_like = tsb_like;
        self.defer_eligible = defer_eligible;
    }

    pub fn playlist(&self) -> Arc<MediaPlaylist> {
        self.walker.playlist.clone()
    }

    pub fn fragment_duration_s(&self) -> f64 {
        self.walker.fragment_duration_s
    }

    pub fn playlist_position_s(&self) -> f64 {
        self.walker.position_s
    }

    pub fn next_media_sequence_number(&self) -> u64 {
        self.walker.next_media_sequence_number
    }

    pub fn start_date_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.walker.playlist.start_date_time
    }

    pub fn duration_s(&self) -> f64 {
        self.walker.playlist.total_duration_s
    }

    /// Initial playlist download + index; errors propagate to the tune.
    pub async fn load_playlist(&mut self) -> HlsResult<()> {
        let request = FetchRequest::new(
            self.playlist_url.clone(),
            ResourceKind::Manifest,
            self.kind.into(),
        );
        self.last_playlist_download = Instant::now();
        let response = self.transport.fetch(request).await?;
        let buffer = String::from_utf8_lossy(&response.bytes).into_owned();
        self.effective_url = response.effective_url.clone();

        let playlist = MediaPlaylist::index_with(&buffer, &self.config.subscribed_tags)?;
        let snapshot = self
            .shared
            .publish(
                Arc::from(buffer.as_str()),
                Arc::new(playlist),
                Some(response.effective_url),
                0.0,
            )
            .await;
        // Initial load starts the walk from the top regardless of kind.
        self.walker.buffer = snapshot.buffer.clone();
        self.walker.playlist = snapshot.playlist.clone();
        self.walker.offset = 0;
        self.walker.position_s = -1.0;
        self.walker.fragment_duration_s = 0.0;
        self.walker.key_tags_seen = 0;
        self.walker.byte_range_cursor = 0;
        self.walker.pending_byte_range = None;
        self.walker.last_selection = None;
        self.walker.next_media_sequence_number = 0;
        self.walk_exhausted = false;
        self.collector.events.publish(StreamEvent::PlaylistIndexed {
            track: self.kind.name(),
        });
        if self.kind == TrackKind::Video {
            for tag in &snapshot.playlist.timed_tags {
                self.collector.events.publish(StreamEvent::TimedMetadata {
                    position_ms: (tag.position_s * 1000.0) as u64,
                    name: tag.name.clone(),
                    content: tag.content.clone(),
                });
            }
        }
        self.handle_defer_tag().await;
        self.first_index_done = true;
        Ok(())
    }

    /// One synchronous walk step that never consults the other track. Used by
    /// the coordinator's sync pass; updates the cm-hash bookkeeping so DRM
    /// processing knows the current fragment's metadata.
    pub fn walk_step_ignoring_discontinuity(&mut self) -> Option<()> {
        let hit = self.walker.step(self.play_target_s)?;
        self.note_selection(&hit.fragment);
        Some(())
    }

    fn note_selection(&mut self, fragment: &SelectedFragment) {
        if !fragment.encrypted {
            self.cm_hash = None;
            return;
        }
        if let Some(hash) = fragment.key.as_ref().and_then(|k| k.cm_hash) {
            self.cm_hash = Some(hash);
        }
        if let Some(idx) = fragment.drm_metadata_idx {
            self.drm_metadata_index_position = idx;
        }
    }

    /// Drive license acquisition for the indexed metadata.
    ///
    /// Single-metadata streams acquire everything; rotating streams with a
    /// known current hash acquire only the current license when
    /// `acquire_current_only`, leaving the rest for later walks unless the
    /// deferred record has claimed one of them.
    pub async fn process_drm_metadata(&mut self, acquire_current_only: bool) {
        let playlist = self.walker.playlist.clone();
        if playlist.drm_metadata.is_empty() {
            return;
        }
        let mut found_current = false;
        for (i, meta) in playlist.drm_metadata.iter().enumerate() {
            if let Some(current) = self.cm_hash {
                if !found_current && meta.hash == current {
                    self.drm_metadata_index_position = i;
                    found_current = true;
                } else {
                    if acquire_current_only {
                        continue;
                    }
                    if self.drm.is_deferred(&meta.hash).await {
                        debug!(hash = %meta.hash, "metadata left to deferred acquisition");
                        continue;
                    }
                }
            }
            self.drm.set_metadata(meta, self.kind.name()).await;
        }
        if self.cm_hash.is_some() && !found_current {
            warn!(
                track = self.kind.name(),
                hash = ?self.cm_hash,
                "current CMSha1Hash not present in indexed metadata"
            );
        } else {
            trace!(
                track = self.kind.name(),
                position = self.drm_metadata_index_position,
                "drm metadata processed"
            );
        }
    }

    /// Apply the `EXT-X-X1-LIN-CK` policy for the playlist just indexed.
    async fn handle_defer_tag(&mut self) {
        let playlist = self.walker.playlist.clone();
        let Some(window_s) = playlist.defer_license_window_s else {
            self.drm.clear_defer_tag().await;
            return;
        };
        let eligible = self.kind == TrackKind::Video
            && playlist.playlist_kind.is_live()
            && self.rate == 1.0
            && self.defer_eligible;
        if !eligible || playlist.drm_metadata.len() <= 1 {
            return;
        }
        if !self.first_index_done {
            info!("defer tag on first index, not deferring license acquisition");
            self.drm.mark_defer_tag_seen().await;
            return;
        }
        if self.drm.defer_tag_under_processing().await {
            return;
        }
        if let Some(candidate) = self.drm.newest_uninstalled(&playlist.drm_metadata).await {
            let fire_at = Instant::now() + defer_jitter(Duration::from_secs(window_s));
            self.drm.schedule_deferred(candidate, fire_at).await;
        } else {
            self.drm.mark_defer_tag_seen().await;
        }
    }

    /// Live refresh: re-download, re-index, account culling, re-point the
    /// walk. Failures are absorbed unless the retry budget is gone and no
    /// fragments remain.
    pub async fn refresh_playlist(&mut self) {
        let common_seq = self.walker.next_media_sequence_number.saturating_sub(1);
        let prev_before_play_point = self
            .walker
            .playlist
            .completion_time_for_sequence(common_seq);
        // Updated even on failure so a bad refresh cannot spin back-to-back.
        self.last_playlist_download = Instant::now();

        if let Some(new_url) = self
            .control
            .new_playlist_url
            .lock()
            .expect("track control mutex poisoned")
            .take()
        {
            self.playlist_url = new_url;
        }

        let request = FetchRequest::new(
            self.playlist_url.clone(),
            ResourceKind::Manifest,
            self.kind.into(),
        );
        let response = match self.transport.fetch(request).await {
            Ok(r) => r,
            Err(e) => {
                if e.is_network_down() {
                    info!(track = self.kind.name(), "network down, refresh deferred");
                    self.collector.set_network_down(true);
                    return;
                }
                self.manifest_dl_fail_count += 1;
                warn!(
                    track = self.kind.name(),
                    failures = self.manifest_dl_fail_count,
                    error = %e,
                    "playlist refresh failed"
                );
                if self.walk_exhausted
                    && self.manifest_dl_fail_count > MAX_MANIFEST_DOWNLOAD_RETRY
                {
                    self.fail(HlsError::ManifestRequestFailed {
                        status: e.http_status(),
                    });
                }
                return;
            }
        };
        self.collector.set_network_down(false);

        let buffer = String::from_utf8_lossy(&response.bytes).into_owned();
        let mut playlist = match MediaPlaylist::index_with(&buffer, &self.config.subscribed_tags) {
            Ok(p) => p,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        // A presentation that has gone VOD never goes back.
        if self.walker.playlist.playlist_kind == PlaylistKind::Vod {
            playlist.playlist_kind = PlaylistKind::Vod;
        }

        let new_before_play_point = playlist.completion_time_for_sequence(common_seq);
        let culled = (prev_before_play_point - new_before_play_point).max(0.0);

        self.effective_url = response.effective_url.clone();
        let snapshot = self
            .shared
            .publish(
                Arc::from(buffer.as_str()),
                Arc::new(playlist),
                Some(response.effective_url),
                culled,
            )
            .await;
        self.walker.rebase(&snapshot);
        self.walk_exhausted = false;
        self.manifest_dl_fail_count = 0;

        self.collector.events.publish(StreamEvent::PlaylistIndexed {
            track: self.kind.name(),
        });
        if self.kind == TrackKind::Video {
            if culled > 0.0 {
                self.collector
                    .events
                    .publish(StreamEvent::CullingUpdated { culled_s: culled });
            }
            for tag in &snapshot.playlist.timed_tags {
                self.collector.events.publish(StreamEvent::TimedMetadata {
                    position_ms: (tag.position_s * 1000.0) as u64,
                    name: tag.name.clone(),
                    content: tag.content.clone(),
                });
            }
        }

        self.handle_defer_tag().await;
        let force = self
            .control
            .force_drm_reprocess
            .swap(false, Ordering::AcqRel);
        if (self.first_index_done && self.cm_hash.is_some()) || force {
            self.process_drm_metadata(false).await;
        }
        self.first_index_done = true;
    }

    fn fail(&mut self, error: HlsError) {
        warn!(track = self.kind.name(), error = %error, "fatal track error");
        if let Some(kind) = error.tune_failure_kind() {
            self.collector.events.publish(StreamEvent::TuneFailed {
                kind,
                http_status: error.http_status(),
            });
        }
        self.collector.disable_downloads();
    }

    /// Trick-play selection: walk the fragment index by completion time in
    /// the direction of `rate`.
    fn fragment_from_index(&mut self) -> Option<SelectedFragment> {
        let playlist = self.walker.playlist.clone();
        let count = playlist.fragments.len();
        if count == 0 {
            return None;
        }

        let idx = if self.rate > 0.0 {
            if playlist.playlist_kind.is_live() {
                let window_end = playlist.fragments[count - 1].completion_time_from_start_s
                    - self.config.live_offset_s;
                if self.play_target_s > window_end {
                    info!(
                        play_target = self.play_target_s,
                        window_end, "trick-play reached the live window edge"
                    );
                    return None;
                }
            }
            let start = self.current_index.unwrap_or(0);
            (start..count)
                .find(|&i| playlist.fragments[i].completion_time_from_start_s >= self.play_target_s)
        } else {
            let start = self.current_index.unwrap_or(count - 1);
            (0..=start)
                .rev()
                .find(|&i| playlist.fragments[i].completion_time_from_start_s <= self.play_target_s)
        }?;

        self.current_index = Some(idx);
        let node = playlist.fragments[idx];
        let duration = if idx > 0 {
            node.completion_time_from_start_s
                - playlist.fragments[idx - 1].completion_time_from_start_s
        } else {
            node.completion_time_from_start_s
        };
        self.walker.fragment_duration_s = duration;

        let uri = uri_at(&self.walker.buffer, node.info_offset)?;
        let key = playlist.fragment_key(&node).cloned();
        Some(SelectedFragment {
            uri,
            duration_s: duration,
            byte_range: node.byte_range,
            encrypted: node.encrypted,
            key: if node.encrypted { key } else { None },
            drm_metadata_idx: node.drm_metadata_idx,
            discontinuity: true,
        })
    }

    /// Normal-play selection with cross-track discontinuity verification.
    async fn next_fragment_normal(&mut self) -> Option<SelectedFragment> {
        if self.play_target_s < 0.0 {
            warn!(play_target = self.play_target_s, "clamping negative play target");
            self.play_target_s = 0.0;
        }
        loop {
            let hit = self.walker.step(self.play_target_s)?;
            let mut fragment = hit.fragment;

            if hit.discontinuity && !self.config.ignore_discontinuity && self.other.enabled {
                let culled = self.shared.snapshot().await.culled_seconds;
                let play_position = self.play_target_s - culled;
                let (position, use_start_time) = match hit.program_date_time {
                    Some(pdt) => (
                        pdt.timestamp() as f64
                            + f64::from(pdt.timestamp_subsec_micros()) / 1_000_000.0,
                        true,
                    ),
                    None => (play_position, false),
                };

                let live = self.walker.playlist.playlist_kind.is_live();
                let matched = self
                    .other
                    .has_discontinuity_around(
                        position,
                        use_start_time,
                        play_position,
                        live,
                        self.tsb_like,
                        &self.collector,
                    )
                    .await;

                match matched {
                    None => {
                        info!(
                            track = self.kind.name(),
                            "discontinuity unmatched on other track, dropping flag"
                        );
                        fragment.discontinuity = false;
                    }
                    Some(m) => {
                        if let Some(diff) = m.diff_s {
                            if diff > self.walker.fragment_duration_s / 2.0 {
                                info!(
                                    track = self.kind.name(),
                                    diff,
                                    from = self.play_target_s,
                                    to = self.walker.position_s + diff,
                                    "other track's discontinuity ahead, skipping forward"
                                );
                                self.sync_after_discontinuity = true;
                                self.play_target_s = self.walker.position_s + diff;
                                continue;
                            }
                        }
                    }
                }
            }

            fragment.discontinuity = fragment.discontinuity || self.sync_after_discontinuity;
            self.sync_after_discontinuity = false;
            self.note_selection(&fragment);
            return Some(fragment);
        }
    }

    async fn download_fragment(
        &mut self,
        fragment: &SelectedFragment,
        init: bool,
    ) -> HlsResult<Vec<u8>> {
        let url = self
            .effective_url
            .join(&fragment.uri)
            .map_err(|e| HlsError::InvalidUrl(format!("{}: {e}", fragment.uri)))?;
        let kind = if init {
            ResourceKind::InitFragment
        } else {
            ResourceKind::MediaFragment
        };
        let mut request = FetchRequest::new(url, kind, self.kind.into());
        if let Some(range) = fragment.byte_range {
            request = request.with_range(range);
        }

        let started = Instant::now();
        let response = self.transport.fetch(request).await?;
        if self.kind == TrackKind::Video && !init {
            let mut abr = self.abr.lock().await;
            abr.push_sample(ThroughputSample {
                bytes: response.bytes.len() as u64,
                duration: started.elapsed(),
                at: Instant::now(),
            });
        }
        Ok(response.bytes.to_vec())
    }

    /// Resolve the session for an encrypted fragment and decrypt in place.
    async fn decrypt_fragment(
        &mut self,
        fragment: &SelectedFragment,
        buffer: &mut Vec<u8>,
    ) -> HlsResult<()> {
        let playlist = self.walker.playlist.clone();
        self.drm.promote_due_deferred(self.kind.name()).await;

        let session = if let Some(idx) = fragment.drm_metadata_idx {
            let meta = playlist
                .drm_metadata
                .get(idx)
                .ok_or(HlsError::DrmDecryptFailed)?;
            let mut session = self.drm.session(&meta.hash).await;
            if session.is_none() || !session.as_ref().is_some_and(|s| s.key_ready()) {
                // Pull forward whatever acquisition would eventually cover it.
                if let Some(claimed) = self.drm.take_deferred_if(&meta.hash).await {
                    self.drm.set_metadata(&claimed, self.kind.name()).await;
                } else {
                    self.process_drm_metadata(false).await;
                }
                session = self.drm.session(&meta.hash).await;
            }
            session.ok_or(HlsError::DrmDecryptFailed)?
        } else {
            // Vanilla AES-128: key comes straight from the KEY tag's URI.
            let key_uri = fragment
                .key
                .as_ref()
                .and_then(|k| k.uri.as_deref())
                .ok_or(HlsError::DrmDecryptFailed)?;
            let key_url = self
                .effective_url
                .join(key_uri)
                .map_err(|e| HlsError::InvalidUrl(format!("{key_uri}: {e}")))?;
            let hash = MetadataHash::of(key_url.as_str().as_bytes());
            if self.drm.session(&hash).await.is_none() {
                let response = self
                    .transport
                    .fetch(FetchRequest::new(
                        key_url.clone(),
                        ResourceKind::Key,
                        self.kind.into(),
                    ))
                    .await?;
                let key: [u8; 16] = response
                    .bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| HlsError::Drm(DrmError::InvalidMetadata(
                        format!("key at {key_url} is not 16 bytes"),
                    )))?;
                self.drm
                    .install_resolved_key(hash, rill_drm::KeyMaterial { key })
                    .await;
            }
            self.drm
                .session(&hash)
                .await
                .ok_or(HlsError::DrmDecryptFailed)?
        };

        let iv = fragment
            .key
            .as_ref()
            .and_then(|k| k.iv)
            .unwrap_or_else(|| {
                iv_from_sequence(self.walker.next_media_sequence_number.saturating_sub(1))
            });

        session
            .decrypt(buffer, &iv, self.config.license_acq_timeout)
            .await?;
        Ok(())
    }

    async fn fetch_init_fragment(&mut self) -> Result<(), ()> {
        let Some(info) = self.walker.playlist.init_fragment_info.clone() else {
            return Ok(());
        };
        let Some((uri, byte_range)) = parse_init_fragment_info(&info) else {
            warn!(map = %info, "unparseable EXT-X-MAP, skipping init fragment");
            return Ok(());
        };
        let fragment = SelectedFragment {
            uri,
            duration_s: 0.0,
            byte_range,
            encrypted: false,
            key: None,
            drm_metadata_idx: None,
            discontinuity: false,
        };
        match self.download_fragment(&fragment, true).await {
            Ok(bytes) => {
                let staged = StagedFragment {
                    track: self.kind,
                    bytes: bytes.into(),
                    position_s: 0.0,
                    duration_s: 0.0,
                    discontinuity: false,
                    init: true,
                };
                if self.ring.send(staged).await.is_err() {
                    return Err(());
                }
                debug!(track = self.kind.name(), "init fragment staged");
                Ok(())
            }
            Err(e) => {
                warn!(track = self.kind.name(), error = %e, "init fragment download failed");
                self.fail(HlsError::InitFragmentDownloadFailure);
                Err(())
            }
        }
    }

    /// One fetch cycle: reserve ring space, select, download, decrypt, stage.
    async fn fetch_cycle(&mut self) -> Cycle {
        let is_live = self.walker.playlist.playlist_kind.is_live();
        let ring = self.ring.clone();

        // Reserve staging space first. On live, cap the wait so the loop can
        // still refresh the playlist while the ring is full.
        let permit = if is_live {
            let refresh_due = Duration::from_millis(MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS)
                .saturating_sub(self.last_playlist_download.elapsed());
            match tokio::time::timeout(refresh_due.max(Duration::from_millis(1)), ring.reserve())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Cycle::Fatal,
                Err(_) => {
                    self.refresh_playlist().await;
                    return Cycle::Continue;
                }
            }
        } else {
            tokio::select! {
                reserved = ring.reserve() => match reserved {
                    Ok(permit) => permit,
                    Err(_) => return Cycle::Fatal,
                },
                () = self.collector.cancel.cancelled() => return Cycle::Fatal,
            }
        };

        self.ramp_down_this_cycle = false;
        let trick_delta = self.rate / f64::from(self.trick_play_fps);

        let selected = if self.trick_play {
            let fragment = self.fragment_from_index();
            if self.rate < 0.0 {
                if fragment.is_none() || self.play_target_s == 0.0 {
                    info!("rewind reached the beginning");
                    self.eos = true;
                } else if self.play_target_s > -trick_delta {
                    self.play_target_s += trick_delta;
                } else {
                    self.play_target_s = 0.0;
                }
            } else if fragment.is_none() {
                info!("fast-forward reached the end");
                self.eos = true;
            } else {
                self.play_target_s += trick_delta;
            }
            fragment
        } else {
            let fragment = self.next_fragment_normal().await;
            match &fragment {
                Some(_) => {
                    self.play_target_s =
                        self.walker.position_s + self.walker.fragment_duration_s;
                }
                None => {
                    let playlist = self.walker.playlist.clone();
                    if (playlist.playlist_kind == PlaylistKind::Vod || playlist.has_endlist)
                        && self.walker.position_s >= 0.0
                    {
                        info!(track = self.kind.name(), "played to the end");
                        self.eos = true;
                    }
                }
            }
            fragment
        };

        let Some(fragment) = selected else {
            self.walk_exhausted = true;
            return Cycle::NoFragment;
        };

        let mut bytes = match self.download_fragment(&fragment, false).await {
            Ok(bytes) => {
                if self.collector.is_network_down() {
                    info!(track = self.kind.name(), "network recovered");
                    self.collector.set_network_down(false);
                }
                bytes
            }
            Err(e) => {
                if let HlsError::Net(net) = &e {
                    // Transient outage: rewind onto the same fragment, pause,
                    // retry with no failure penalty.
                    if net.is_network_down() {
                        self.collector.set_network_down(true);
                        warn!(track = self.kind.name(), error = %e, "network down, pausing");
                        if self.trick_play {
                            self.play_target_s -= trick_delta;
                        } else {
                            self.play_target_s = self.walker.position_s;
                        }
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_millis(
                                MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS,
                            )) => {}
                            () = self.collector.cancel.cancelled() => {}
                        }
                        return Cycle::Continue;
                    }
                }
                self.seg_dl_fail_count += 1;
                warn!(
                    track = self.kind.name(),
                    uri = %fragment.uri,
                    failures = self.seg_dl_fail_count,
                    error = %e,
                    "fragment download failed"
                );

                if self.kind == TrackKind::Video {
                    let ramped = {
                        let mut abr = self.abr.lock().await;
                        abr.check_for_ramp_down(e.http_status())
                    };
                    if let Some(profile) = ramped {
                        if self.trick_play {
                            self.play_target_s -= trick_delta;
                        } else {
                            self.play_target_s -= self.walker.fragment_duration_s;
                        }
                        self.ramp_down_this_cycle = true;
                        if let Some(url) = self.master.profile_url(profile) {
                            self.control.profile_changed(url);
                        }
                    }
                }

                if self.seg_dl_fail_count >= MAX_SEG_DOWNLOAD_FAIL_COUNT
                    && self.collector.downloads_enabled()
                {
                    self.fail(HlsError::FragmentDownloadFailure {
                        status: e.http_status(),
                    });
                    return Cycle::Fatal;
                }
                return Cycle::Continue;
            }
        };
        self.seg_dl_fail_count = 0;

        if fragment.encrypted && !bytes.is_empty() {
            if let Err(e) = self.decrypt_fragment(&fragment, &mut bytes).await {
                match e {
                    HlsError::Drm(DrmError::KeyAcquisitionTimeout) => {
                        warn!(track = self.kind.name(), "license acquisition timed out");
                        self.collector.events.publish(StreamEvent::Warning {
                            message: "license acquisition timeout".into(),
                        });
                    }
                    ref other => {
                        self.seg_drm_decrypt_fail_count += 1;
                        warn!(
                            track = self.kind.name(),
                            failures = self.seg_drm_decrypt_fail_count,
                            error = %other,
                            "fragment decrypt failed"
                        );
                        if self.seg_drm_decrypt_fail_count >= MAX_SEG_DRM_DECRYPT_FAIL_COUNT {
                            self.fail(HlsError::DrmDecryptFailed);
                            return Cycle::Fatal;
                        }
                    }
                }
                return Cycle::Continue;
            }
            self.seg_drm_decrypt_fail_count = 0;
            if !self
                .collector
                .first_fragment_decrypted
                .swap(true, Ordering::AcqRel)
            {
                self.collector
                    .events
                    .publish(StreamEvent::FirstFragmentDecrypted);
            }
        } else if bytes.is_empty() {
            warn!(track = self.kind.name(), uri = %fragment.uri, "zero-length fragment");
        }

        let (position, duration, discontinuity) = if self.trick_play {
            (
                self.play_target_s - self.play_target_offset_s - trick_delta,
                self.walker.fragment_duration_s * self.rate.abs()
                    / f64::from(self.trick_play_fps),
                true,
            )
        } else {
            (
                self.play_target_s
                    - self.play_target_offset_s
                    - self.walker.fragment_duration_s,
                self.walker.fragment_duration_s,
                fragment.discontinuity,
            )
        };

        permit.send(StagedFragment {
            track: self.kind,
            bytes: bytes.into(),
            position_s: position,
            duration_s: duration,
            discontinuity,
            init: false,
        });
        trace!(
            track = self.kind.name(),
            position,
            duration,
            discontinuity,
            "fragment staged"
        );
        Cycle::Continue
    }

    /// The fetch worker body.
    pub async fn run(mut self) {
        debug!(track = self.kind.name(), "fetch loop started");
        'outer: while self.collector.downloads_enabled() {
            loop {
                if !self.collector.downloads_enabled() {
                    break 'outer;
                }
                if self.control.refresh_requested.swap(false, Ordering::AcqRel) {
                    self.refresh_playlist().await;
                }
                if self
                    .control
                    .inject_init_fragment
                    .swap(false, Ordering::AcqRel)
                    && self.fetch_init_fragment().await.is_err()
                {
                    break 'outer;
                }

                match self.fetch_cycle().await {
                    Cycle::Continue => {}
                    Cycle::NoFragment => break,
                    Cycle::Fatal => break 'outer,
                }

                // Video drives ABR; skipped for the cycle that just ramped
                // down so a failing profile isn't immediately re-selected.
                if self.kind == TrackKind::Video && !self.trick_play && !self.ramp_down_this_cycle
                {
                    let switched = {
                        let mut abr = self.abr.lock().await;
                        abr.check_for_profile_change().map(|p| {
                            (p, abr.registry().get(p).copied())
                        })
                    };
                    if let Some((profile, entry)) = switched {
                        if let Some(url) = self.master.profile_url(profile) {
                            info!(profile, "ABR profile change");
                            self.control.profile_changed(url);
                            if let Some(entry) = entry {
                                self.collector.events.publish(StreamEvent::BitrateChanged {
                                    bandwidth_bps: entry.bandwidth_bps,
                                    width: entry.width,
                                    height: entry.height,
                                });
                            }
                        }
                    }
                }

                if self.walker.playlist.playlist_kind.is_live()
                    && self.last_playlist_download.elapsed()
                        >= Duration::from_millis(MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS)
                {
                    self.refresh_playlist().await;
                }
            }

            let playlist = self.walker.playlist.clone();
            if self.eos || playlist.has_endlist || !self.collector.downloads_enabled() {
                break;
            }

            // Live with no fragment available: pace the next refresh by
            // buffer depth.
            let snapshot = self.shared.snapshot().await;
            let play_position = self.collector.play_position_s();
            let end_available =
                (snapshot.culled_seconds + snapshot.playlist.total_duration_s) * 1000.0;
            let buffer_ms = (end_available - play_position * 1000.0) as i64;
            let delay = compute_refresh_delay(
                buffer_ms,
                snapshot.playlist.target_duration_s,
                self.last_playlist_download.elapsed(),
            );
            debug!(
                track = self.kind.name(),
                buffer_ms,
                delay_ms = delay.as_millis() as u64,
                "refresh cadence sleep"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.collector.cancel.cancelled() => break,
            }
            self.refresh_playlist().await;
        }
        debug!(track = self.kind.name(), eos = self.eos, "fetch loop exited");
        // Dropping the ring sender lets the injector drain and exit.
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    // target duration 6s: buffer 20s -> 9s clamped to 6s
    #[case(20_000, 6.0, 6_000)]
    // buffer 8s -> 0.5 * target = 3s
    #[case(8_000, 6.0, 3_000)]
    // buffer 1s -> buffer/3 = 333ms clamped to 500ms
    #[case(1_000, 6.0, 500)]
    // no buffer at all -> minimum
    #[case(0, 6.0, 500)]
    // huge target duration but buffer just above 2*max -> max
    #[case(13_000, 60.0, 6_000)]
    fn refresh_delay_table(
        #[case] buffer_ms: i64,
        #[case] target_s: f64,
        #[case] expected_ms: u64,
    ) {
        let delay = compute_refresh_delay(buffer_ms, target_s, Duration::ZERO);
        assert_eq!(delay.as_millis() as u64, expected_ms);
    }

    #[test]
    fn refresh_delay_subtracts_elapsed() {
        // buffer 8s, target 6s -> 3s base, minus 1s elapsed = 2s
        let delay = compute_refresh_delay(8_000, 6.0, Duration::from_secs(1));
        assert_eq!(delay, Duration::from_secs(2));
        // elapsed beyond the base clamps at the minimum
        let delay = compute_refresh_delay(8_000, 6.0, Duration::from_secs(10));
        assert_eq!(
            delay,
            Duration::from_millis(MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS)
        );
    }

    #[test]
    fn walker_selects_by_play_target() {
        let buf = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:10\n\
#EXTINF:4.0,\ns10.ts\n#EXTINF:4.0,\ns11.ts\n#EXTINF:4.0,\ns12.ts\n#EXT-X-ENDLIST\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());

        // play_target 0 selects the first fragment.
        let hit = walker.step(0.0).expect("fragment");
        assert_eq!(hit.fragment.uri, "s10.ts");
        assert_eq!(walker.position_s, 0.0);
        assert_eq!(walker.next_media_sequence_number, 11);

        // Advance like the fetch loop and select the next.
        let target = walker.position_s + walker.fragment_duration_s;
        let hit = walker.step(target).expect("fragment");
        assert_eq!(hit.fragment.uri, "s11.ts");
        assert_eq!(walker.position_s, 4.0);

        let hit = walker.step(8.0).expect("fragment");
        assert_eq!(hit.fragment.uri, "s12.ts");

        assert!(walker.step(12.0).is_none());
    }

    #[test]
    fn walker_skips_to_seek_target() {
        let buf = "#EXTM3U\n#EXTINF:6.0,\na.ts\n#EXTINF:6.0,\nb.ts\n#EXTINF:6.0,\nc.ts\n#EXT-X-ENDLIST\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());

        let hit = walker.step(12.0).expect("fragment");
        assert_eq!(hit.fragment.uri, "c.ts");
        assert_eq!(walker.position_s, 12.0);
    }

    #[test]
    fn walker_selection_threshold() {
        let buf = "#EXTM3U\n#EXTINF:6.0,\na.ts\n#EXTINF:6.0,\nb.ts\n#EXT-X-ENDLIST\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());

        // 6.05 is within 0.1s past b's start (6.0), so b is still selected.
        let hit = walker.step(6.05).expect("fragment");
        assert_eq!(hit.fragment.uri, "b.ts");
    }

    #[test]
    fn walker_retries_current_fragment() {
        let buf = "#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n#EXT-X-ENDLIST\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());

        let first = walker.step(0.0).expect("fragment");
        assert_eq!(first.fragment.uri, "a.ts");
        // play target NOT advanced (download failed): same fragment again.
        let retry = walker.step(0.0).expect("fragment");
        assert_eq!(retry.fragment.uri, "a.ts");
    }

    #[test]
    fn walker_reports_discontinuity_and_resets_on_skip() {
        let buf = "#EXTM3U\n\
#EXTINF:4.0,\na.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXTINF:4.0,\nb.ts\n\
#EXTINF:4.0,\nc.ts\n#EXT-X-ENDLIST\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());

        // Seeking past b: the discontinuity annotation must not leak onto c.
        let hit = walker.step(8.0).expect("fragment");
        assert_eq!(hit.fragment.uri, "c.ts");
        assert!(!hit.discontinuity);

        // Fresh walker stopping exactly on b sees the flag.
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(buf);
        walker.playlist = Arc::new(MediaPlaylist::index(buf).unwrap());
        let hit = walker.step(4.0).expect("fragment");
        assert_eq!(hit.fragment.uri, "b.ts");
        assert!(hit.discontinuity);
    }

    #[test]
    fn walker_rebase_continues_by_sequence() {
        let old = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:10\n\
#EXTINF:4.0,\ns10.ts\n#EXTINF:4.0,\ns11.ts\n#EXTINF:4.0,\ns12.ts\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(old);
        walker.playlist = Arc::new(MediaPlaylist::index(old).unwrap());

        // Consume s10 and s11.
        walker.step(0.0).unwrap();
        let t = walker.position_s + walker.fragment_duration_s;
        walker.step(t).unwrap();
        assert_eq!(walker.next_media_sequence_number, 12);
        let continuous_position = walker.position_s;

        // Window slid by one: s10 culled, s13 appended.
        let new = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:11\n\
#EXTINF:4.0,\ns11.ts\n#EXTINF:4.0,\ns12.ts\n#EXTINF:4.0,\ns13.ts\n";
        let snapshot = PlaylistSnapshot {
            buffer: Arc::from(new),
            playlist: Arc::new(MediaPlaylist::index(new).unwrap()),
            effective_url: None,
            culled_seconds: 4.0,
            generation: 2,
        };
        walker.rebase(&snapshot);

        // Continuous timeline preserved; next selection is s12.
        assert_eq!(walker.position_s, continuous_position);
        let t = walker.position_s + walker.fragment_duration_s;
        let hit = walker.step(t).expect("fragment");
        assert_eq!(hit.fragment.uri, "s12.ts");
        assert_eq!(walker.next_media_sequence_number, 13);
    }

    #[test]
    fn walker_rebase_handles_window_gap() {
        let old = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:10\n#EXTINF:4.0,\ns10.ts\n";
        let mut walker = PlaylistWalker::new();
        walker.buffer = Arc::from(old);
        walker.playlist = Arc::new(MediaPlaylist::index(old).unwrap());
        walker.step(0.0).unwrap();

        // Everything culled; the window jumped far ahead.
        let new = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:50\n\
#EXTINF:4.0,\ns50.ts\n#EXTINF:4.0,\ns51.ts\n";
        let snapshot = PlaylistSnapshot {
            buffer: Arc::from(new),
            playlist: Arc::new(MediaPlaylist::index(new).unwrap()),
            effective_url: None,
            culled_seconds: 160.0,
            generation: 2,
        };
        walker.rebase(&snapshot);
        assert_eq!(walker.next_media_sequence_number, 51);

        // The walk resumes from the fragment after the window start.
        let t = walker.position_s + walker.fragment_duration_s;
        let hit = walker.step(t).expect("fragment");
        assert_eq!(hit.fragment.uri, "s51.ts");
    }

    #[test]
    fn init_fragment_info_parse() {
        let (uri, range) =
            parse_init_fragment_info("URI=\"init.mp4\",BYTERANGE=\"720@0\"").unwrap();
        assert_eq!(uri, "init.mp4");
        assert_eq!(range, Some(ByteRange::new(0, 719)));

        let (uri, range) = parse_init_fragment_info("URI=\"init.mp4\"").unwrap();
        assert_eq!(uri, "init.mp4");
        assert_eq!(range, None);

        assert!(parse_init_fragment_info("BYTERANGE=\"720@0\"").is_none());
    }

    #[test]
    fn sequence_iv_derivation() {
        let iv = iv_from_sequence(0x0102_0304);
        assert_eq!(&iv[..8], &[0u8; 8]);
        assert_eq!(&iv[8..], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }
}
