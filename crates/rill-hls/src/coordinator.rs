//! Multi-track coordinator: tune sequence, A/V synchronization, live-edge
//! adjustment, trick-play configuration, lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rill_abr::{AbrController, ProfileEntry};
use rill_drm::DrmManager;
use rill_events::{CollectorState, EventBus, MediaMetadata, StreamEvent};
use rill_net::{FetchRequest, NetError, ResourceKind, SharedTransport, TrackHint};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HlsConfig;
use crate::constants::{
    MANIFEST_RETRY_DELAY, MAX_MANIFEST_DOWNLOAD_RETRY,
    MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC, MAX_SEQ_NUMBER_LAG_COUNT,
};
use crate::error::{HlsError, HlsResult};
use crate::index::PlaylistKind;
use crate::inject::{run_injector, MediaSink, PipelineConfig, SegmentFormat, StagedFragment};
use crate::master::MasterManifest;
use crate::parser::{Lines, PlaylistLine};
use crate::state::{CollectorShared, SharedTrack, TrackKind};
use crate::track::{MasterLink, TrackController};

/// How the presentation is being (re)entered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TuneType {
    /// Fresh tune at the default position (live edge for live content).
    NewNormal,
    /// Fresh tune at a position.
    NewSeek(f64),
    /// Seek within an ongoing presentation.
    Seek(f64),
    /// Jump back to the live edge.
    SeekToLive,
    /// Internal re-tune preserving position.
    Retune(f64),
}

impl TuneType {
    fn seek_position(&self) -> Option<f64> {
        match self {
            Self::NewSeek(p) | Self::Seek(p) | Self::Retune(p) => Some(*p),
            Self::NewNormal | Self::SeekToLive => None,
        }
    }

    fn is_new(&self) -> bool {
        matches!(self, Self::NewNormal | Self::NewSeek(_))
    }
}

struct Track {
    controller: TrackController,
    shared: Arc<SharedTrack>,
    ring_rx: Option<mpsc::Receiver<StagedFragment>>,
}

/// The fragment collector.
///
/// Owns both track pipelines and the downstream sink. `init` runs the tune
/// sequence; `start` spawns the fetch and inject workers; `stop` tears
/// everything down.
pub struct HlsCollector {
    config: Arc<HlsConfig>,
    transport: SharedTransport,
    drm: Arc<DrmManager>,
    sink: Arc<dyn MediaSink>,
    events: EventBus,
    abr: Arc<Mutex<AbrController>>,
    shared: Arc<CollectorShared>,

    manifest_url: Url,
    master: Option<Arc<MasterLink>>,
    video: Option<Track>,
    audio: Option<Track>,
    workers: Vec<JoinHandle<()>>,

    rate: f64,
    trick_play: bool,
    trick_play_fps: u32,
    state: CollectorState,
    pub is_at_live_point: bool,
    seek_position_s: f64,
    playlist_cache: HashMap<String, Bytes>,
}

impl HlsCollector {
    pub fn new(
        manifest_url: Url,
        config: HlsConfig,
        transport: SharedTransport,
        drm: Arc<DrmManager>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let abr = Arc::new(Mutex::new(AbrController::new(config.abr.clone())));
        let shared = Arc::new(CollectorShared::new(
            events.clone(),
            CancellationToken::new(),
        ));
        Self {
            config: Arc::new(config),
            transport,
            drm,
            sink,
            events,
            abr,
            shared,
            manifest_url,
            master: None,
            video: None,
            audio: None,
            workers: Vec::new(),
            rate: 1.0,
            trick_play: false,
            trick_play_fps: 4,
            state: CollectorState::Idle,
            is_at_live_point: false,
            seek_position_s: 0.0,
            playlist_cache: HashMap::new(),
        }
    }

    /// Subscribe to collector events.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Playback rate for this tune. Anything other than 1.0 selects the
    /// I-frame playlist and enters trick-play.
    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    /// Feed real renderer positions into the refresh cadence.
    pub fn update_play_position(&self, position_s: f64) {
        self.shared.set_play_position_s(position_s);
    }

    fn transition(&mut self, to: CollectorState) {
        if self.state != to {
            self.events.publish(StreamEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn fail_tune(&mut self, error: &HlsError) {
        if let Some(kind) = error.tune_failure_kind() {
            self.events.publish(StreamEvent::TuneFailed {
                kind,
                http_status: error.http_status(),
            });
        }
        self.transition(CollectorState::Failed);
    }

    /// Run the tune sequence. On success the collector is primed and ready
    /// for [`start`](Self::start).
    pub async fn init(&mut self, tune_type: TuneType) -> HlsResult<()> {
        self.transition(CollectorState::Tuning);
        match self.init_inner(tune_type).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_tune(&e);
                Err(e)
            }
        }
    }

    async fn init_inner(&mut self, tune_type: TuneType) -> HlsResult<()> {
        if tune_type.is_new() {
            self.drm.reset_all().await;
            self.playlist_cache.clear();
        } else {
            // Re-entering the same presentation: revive any key waits the
            // previous stop() aborted.
            self.drm.restore_all_key_states().await;
        }

        // 1. Master manifest, with bounded retries on 404.
        let master_bytes = self.download_master().await?;
        let master_text = String::from_utf8_lossy(&master_bytes).into_owned();
        let master = MasterManifest::parse(&master_text)?;
        if master.profiles.is_empty() {
            return Err(HlsError::ManifestContentError(
                "master manifest carries no variants".into(),
            ));
        }

        // 2. Register profiles and pick the starting variant.
        {
            let mut abr = self.abr.lock().await;
            abr.registry_mut().clear();
            for p in &master.profiles {
                abr.registry_mut().add_profile(ProfileEntry {
                    is_iframe: p.is_iframe,
                    bandwidth_bps: p.bandwidth_bps,
                    width: p.width,
                    height: p.height,
                });
            }
            abr.select_initial_profile();
        }

        self.trick_play = self.rate != 1.0 && master.has_iframe_profile();
        let profile_idx = if self.trick_play {
            let mut abr = self.abr.lock().await;
            let idx = abr
                .registry()
                .iframe_profile()
                .ok_or_else(|| HlsError::ManifestContentError("no iframe profile".into()))?;
            abr.set_current_profile(idx);
            idx
        } else {
            self.abr.lock().await.current_profile()
        };

        let profile = &master.profiles[profile_idx];
        self.events.publish(StreamEvent::BitrateChanged {
            bandwidth_bps: profile.bandwidth_bps,
            width: profile.width,
            height: profile.height,
        });

        // 3. Resolve per-track playlist URLs.
        let video_url = self
            .manifest_url
            .join(&profile.uri)
            .map_err(|e| HlsError::InvalidUrl(format!("{}: {e}", profile.uri)))?;

        let audio_selection = if self.config.audio_enabled && !self.trick_play {
            profile.audio_group.as_deref().and_then(|group| {
                master
                    .select_audio_rendition(group, &self.config.preferred_audio_language)
                    .and_then(|(r, lang)| r.uri.clone().map(|u| (u, lang)))
            })
        } else {
            None
        };
        let audio_url = match &audio_selection {
            Some((uri, lang)) => {
                info!(language = %lang, uri = %uri, "audio rendition selected");
                Some(
                    self.manifest_url
                        .join(uri)
                        .map_err(|e| HlsError::InvalidUrl(format!("{uri}: {e}")))?,
                )
            }
            None => None,
        };

        let master_link = Arc::new(MasterLink {
            master: master.clone(),
            base_url: self.manifest_url.clone(),
        });
        self.master = Some(master_link.clone());

        // 4. Build tracks and download both playlists.
        let audio_enabled = audio_url.is_some();
        let video_shared = Arc::new(SharedTrack::new(TrackKind::Video, true));
        let audio_shared = Arc::new(SharedTrack::new(TrackKind::Audio, audio_enabled));

        let mut video = self.build_track(
            TrackKind::Video,
            video_shared.clone(),
            audio_shared.clone(),
            master_link.clone(),
            video_url,
        );
        let mut audio = audio_url.map(|url| {
            self.build_track(
                TrackKind::Audio,
                audio_shared.clone(),
                video_shared.clone(),
                master_link.clone(),
                url,
            )
        });

        let tsb_like = self.config.tsb_supported;
        let defer_eligible =
            matches!(tune_type, TuneType::NewNormal | TuneType::SeekToLive);
        video
            .controller
            .set_mode(self.rate, self.trick_play, self.config.vod_trick_play_fps);
        video.controller.set_tune_context(tsb_like, defer_eligible);
        if let Some(a) = audio.as_mut() {
            a.controller
                .set_mode(1.0, false, self.config.vod_trick_play_fps);
            a.controller.set_tune_context(tsb_like, false);
        }

        if self.config.parallel_playlist_download {
            if let Some(a) = audio.as_mut() {
                let (rv, ra) =
                    tokio::join!(video.controller.load_playlist(), a.controller.load_playlist());
                rv?;
                ra?;
            } else {
                video.controller.load_playlist().await?;
            }
        } else {
            video.controller.load_playlist().await?;
            if let Some(a) = audio.as_mut() {
                a.controller.load_playlist().await?;
            }
        }

        if video.controller.duration_s() <= 0.0 {
            return Err(HlsError::ManifestContentError(
                "video playlist has zero duration".into(),
            ));
        }
        if let Some(a) = &audio {
            if a.controller.duration_s() <= 0.0 {
                return Err(HlsError::ManifestContentError(
                    "audio playlist has zero duration".into(),
                ));
            }
        }

        let playlist_kind = video.controller.playlist().playlist_kind;
        let is_live = playlist_kind.is_live();

        // Final trick-play frame rate depends on whether we ended up live.
        let fps = if self.trick_play && is_live {
            self.config.linear_trick_play_fps
        } else {
            self.config.vod_trick_play_fps
        };
        self.trick_play_fps = fps;
        video.controller.set_mode(self.rate, self.trick_play, fps);
        if let Some(a) = audio.as_mut() {
            a.controller.set_mode(1.0, false, fps);
        }

        // 5. Presentation metadata.
        let has_drm = !video.controller.playlist().drm_metadata.is_empty()
            || video.controller.playlist().drm_key_tag_count > 0
            || master.has_drm_metadata;
        self.events.publish(StreamEvent::Metadata(MediaMetadata {
            duration_s: video.controller.duration_s(),
            is_live,
            languages: master.audio_languages(),
            bitrates_bps: master.playable_bandwidths(),
            has_drm,
            has_iframe_track: master.has_iframe_profile(),
        }));

        // 6. Pipeline shape.
        let video_format = detect_format(&video_shared.snapshot().await.buffer);
        let audio_format = match &audio {
            Some(a) => detect_format(&a.shared.snapshot().await.buffer),
            None => SegmentFormat::Unknown,
        };
        self.sink.configure(&PipelineConfig {
            video_format,
            audio_format,
            audio_present: audio_enabled,
            trick_play: self.trick_play,
            rate: self.rate,
        });

        // Seek targets before synchronization.
        if let Some(position) = tune_type.seek_position() {
            video.controller.play_target_s = position;
            if let Some(a) = audio.as_mut() {
                a.controller.play_target_s = position;
            }
        }

        self.video = Some(video);
        self.audio = audio;

        // 7–8. Synchronize and live-adjust.
        self.sync_and_adjust(tune_type, playlist_kind).await?;

        // 9. Kick off license acquisition for the current metadata.
        if let Some(a) = self.audio.as_mut() {
            a.controller.process_drm_metadata(true).await;
        }
        if let Some(v) = self.video.as_mut() {
            v.controller.process_drm_metadata(true).await;
        }

        info!(
            live = is_live,
            trick_play = self.trick_play,
            at_live_point = self.is_at_live_point,
            seek = self.seek_position_s,
            "tune complete"
        );
        Ok(())
    }

    fn build_track(
        &self,
        kind: TrackKind,
        shared: Arc<SharedTrack>,
        other: Arc<SharedTrack>,
        master: Arc<MasterLink>,
        playlist_url: Url,
    ) -> Track {
        let (tx, rx) = mpsc::channel(self.config.fragment_cache_len);
        let controller = TrackController::new(
            kind,
            self.config.clone(),
            self.transport.clone(),
            self.drm.clone(),
            self.abr.clone(),
            master,
            shared.clone(),
            other,
            self.shared.clone(),
            tx,
            playlist_url,
        );
        Track {
            controller,
            shared,
            ring_rx: Some(rx),
        }
    }

    async fn download_master(&mut self) -> HlsResult<Bytes> {
        let cache_key = self.manifest_url.to_string();
        if self.config.enable_playlist_cache {
            if let Some(cached) = self.playlist_cache.get(&cache_key) {
                debug!("master manifest served from cache");
                return Ok(cached.clone());
            }
        }

        let mut attempts = 0_u32;
        loop {
            let request = FetchRequest::new(
                self.manifest_url.clone(),
                ResourceKind::Manifest,
                TrackHint::Video,
            );
            match self.transport.fetch(request).await {
                Ok(response) => {
                    if self.config.enable_playlist_cache {
                        self.playlist_cache
                            .insert(cache_key, response.bytes.clone());
                    }
                    return Ok(response.bytes);
                }
                Err(NetError::HttpStatus { status: 404, url })
                    if attempts < MAX_MANIFEST_DOWNLOAD_RETRY =>
                {
                    attempts += 1;
                    warn!(attempts, url = %url, "master manifest 404, retrying");
                    tokio::time::sleep(MANIFEST_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(HlsError::ManifestRequestFailed {
                        status: e.http_status(),
                    })
                }
            }
        }
    }

    /// §4.5.1 + §4.5.2: pick a sync strategy, then move both tracks onto the
    /// live edge when appropriate.
    async fn sync_and_adjust(
        &mut self,
        tune_type: TuneType,
        playlist_kind: PlaylistKind,
    ) -> HlsResult<()> {
        let is_live = playlist_kind.is_live();
        let live_offset = self.config.live_offset_s;

        let mut live_adjust = matches!(tune_type, TuneType::NewNormal)
            && playlist_kind == PlaylistKind::Live;
        match tune_type {
            TuneType::SeekToLive if is_live => {
                live_adjust = true;
                self.set_play_targets(0.0);
                self.events.publish(StreamEvent::EnteringLive);
            }
            TuneType::Seek(_) | TuneType::NewSeek(_) | TuneType::Retune(_) if self.rate > 0.0 => {
                let (play_target, duration) = match self.video.as_ref() {
                    Some(v) => (v.controller.play_target_s, v.controller.duration_s()),
                    None => (0.0, 0.0),
                };
                let mut seek_window_end = duration;
                if is_live {
                    seek_window_end -= live_offset;
                }
                if play_target > seek_window_end {
                    if is_live {
                        live_adjust = true;
                        self.set_play_targets(0.0);
                        if matches!(tune_type, TuneType::Seek(_)) {
                            self.events.publish(StreamEvent::EnteringLive);
                        }
                    } else {
                        if let Some(v) = self.video.as_mut() {
                            v.controller.eos = true;
                        }
                        if let Some(a) = self.audio.as_mut() {
                            a.controller.eos = true;
                        }
                        return Err(HlsError::SeekRangeError {
                            target_s: play_target,
                            duration_s: seek_window_end,
                        });
                    }
                }
            }
            _ => {}
        }

        if self.audio.is_some() && !self.trick_play {
            if playlist_kind == PlaylistKind::Vod {
                self.sync_tracks_for_discontinuity();
            } else {
                let mut synced = false;
                if !live_adjust && self.discontinuity_counts_match() {
                    synced = self.sync_tracks_for_discontinuity();
                }
                if !synced {
                    let use_pdt = self.config.use_program_date_time;
                    self.sync_tracks(use_pdt)?;
                }
            }
        }

        if live_adjust {
            self.apply_live_adjust(live_offset);
        }

        // Post-adjust: begin at a clean period boundary when both tracks
        // expose the same discontinuity layout.
        if self.audio.is_some() && playlist_kind != PlaylistKind::Vod {
            let video_periods = self
                .video
                .as_ref()
                .map(|v| v.controller.playlist().period_count())
                .unwrap_or(0);
            if video_periods > 0 && self.discontinuity_counts_match() {
                if live_adjust {
                    self.sync_tracks_for_discontinuity();
                }
                self.align_to_period_boundary();
            }
        }
        Ok(())
    }

    fn set_play_targets(&mut self, target: f64) {
        if let Some(v) = self.video.as_mut() {
            v.controller.play_target_s = target;
        }
        if let Some(a) = self.audio.as_mut() {
            a.controller.play_target_s = target;
        }
    }

    fn discontinuity_counts_match(&self) -> bool {
        let (Some(video), Some(audio)) = (&self.video, &self.audio) else {
            return false;
        };
        let v = video.controller.playlist().period_count();
        let a = audio.controller.playlist().period_count();
        v == a && v > 0
    }

    /// Discontinuity-aligned sync: put the audio target at the same offset
    /// within its period as the video target is within its own.
    fn sync_tracks_for_discontinuity(&mut self) -> bool {
        let (Some(video), Some(audio)) = (&mut self.video, &mut self.audio) else {
            return false;
        };
        let v_playlist = video.controller.playlist();
        let a_playlist = audio.controller.playlist();
        if v_playlist.period_count() != a_playlist.period_count() {
            warn!(
                video_periods = v_playlist.period_count(),
                audio_periods = a_playlist.period_count(),
                "period counts differ, discontinuity sync skipped"
            );
            return false;
        }
        let Some((period_idx, offset)) =
            v_playlist.next_fragment_period_info(video.controller.play_target_s)
        else {
            return false;
        };
        let audio_period_start = a_playlist.period_start_position(period_idx);
        if audio_period_start == 0.0 {
            warn!(period_idx, "audio period start unavailable");
            return false;
        }
        audio.controller.play_target_s = audio_period_start + offset;
        info!(
            period_idx,
            offset,
            audio_target = audio.controller.play_target_s,
            video_target = video.controller.play_target_s,
            "tracks aligned on discontinuity"
        );
        true
    }

    /// Sequence-number / start-time synchronization for live and event
    /// streams.
    fn sync_tracks(&mut self, use_program_date_time: bool) -> HlsResult<()> {
        let (Some(video), Some(audio)) = (&mut self.video, &mut self.audio) else {
            return Ok(());
        };

        // Parse both playlists up to their first selectable fragment and
        // align targets with fragment starts.
        for track in [&mut *video, &mut *audio] {
            track.controller.walk_step_ignoring_discontinuity();
            track.controller.play_target_s = track.controller.playlist_position_s().max(0.0);
        }

        let video_start = video.controller.start_date_time();
        let audio_start = audio.controller.start_date_time();
        let start_time_available = video_start.is_some() && audio_start.is_some();

        let diff_between_start_times = match (audio_start, video_start) {
            (Some(a), Some(v)) => {
                (a.timestamp() as f64 + f64::from(a.timestamp_subsec_micros()) / 1e6)
                    - (v.timestamp() as f64 + f64::from(v.timestamp_subsec_micros()) / 1e6)
            }
            _ => 0.0,
        };

        let video_seq = video.controller.next_media_sequence_number().saturating_sub(1);
        let audio_seq = audio.controller.next_media_sequence_number().saturating_sub(1);

        if start_time_available && !use_program_date_time {
            let vd = video.controller.playlist().target_duration_s;
            let ad = audio.controller.playlist().target_duration_s;
            if (vd - ad).abs() > f64::EPSILON {
                warn!(
                    video_target_duration = vd,
                    audio_target_duration = ad,
                    "sequence-number sync with unequal target durations"
                );
            } else {
                let diff_based_on_seq = (audio_seq as f64 - video_seq as f64)
                    * video.controller.fragment_duration_s();
                if (diff_based_on_seq - diff_between_start_times).abs()
                    > video.controller.fragment_duration_s()
                {
                    warn!(
                        diff_based_on_seq,
                        diff_between_start_times,
                        "start-time and sequence numbers disagree"
                    );
                }
            }
        }

        let mut synced_using_seq = false;
        if !start_time_available || !use_program_date_time {
            let (lagging, diff) = if audio_seq > video_seq {
                (Some(TrackKind::Video), audio_seq - video_seq)
            } else if video_seq > audio_seq {
                (Some(TrackKind::Audio), video_seq - audio_seq)
            } else {
                (None, 0)
            };

            match lagging {
                None => synced_using_seq = true,
                Some(kind) => {
                    if start_time_available && diff > MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC {
                        info!(diff, "sequence gap too wide, falling back to start-time sync");
                    } else if diff <= MAX_SEQ_NUMBER_LAG_COUNT {
                        info!(track = kind.name(), diff, "sequence-number catch-up");
                        let track = match kind {
                            TrackKind::Video => &mut *video,
                            TrackKind::Audio => &mut *audio,
                        };
                        for _ in 0..diff {
                            let step = track.controller.fragment_duration_s();
                            track.controller.play_target_s += step;
                            track.controller.play_target_offset_s += step;
                            if track.controller.walk_step_ignoring_discontinuity().is_none() {
                                warn!(
                                    track = kind.name(),
                                    "catch-up ran out of fragments, seek may be out of window"
                                );
                            }
                        }
                        synced_using_seq = true;
                    } else {
                        warn!(
                            track = kind.name(),
                            diff,
                            max = MAX_SEQ_NUMBER_LAG_COUNT,
                            "sequence lag beyond catch-up bound"
                        );
                    }
                }
            }
        }

        if !synced_using_seq {
            if !start_time_available {
                return Err(HlsError::TracksSynchronizationError(
                    "no start time and sequence sync failed".into(),
                ));
            }
            if diff_between_start_times > 0.0 {
                // Audio started later: advance video.
                let half = video.controller.fragment_duration_s() / 2.0;
                if diff_between_start_times > half {
                    let new_target = video.controller.play_target_s + diff_between_start_times;
                    if video.controller.duration_s() > new_target {
                        video.controller.play_target_s = new_target;
                        video.controller.play_target_offset_s = diff_between_start_times;
                    } else {
                        return Err(HlsError::TracksSynchronizationError(format!(
                            "start-time diff {diff_between_start_times}s beyond video duration"
                        )));
                    }
                } else {
                    debug!(diff = diff_between_start_times, "A/V difference tolerable");
                }
            } else if diff_between_start_times < 0.0 {
                let magnitude = -diff_between_start_times;
                let half = audio.controller.fragment_duration_s() / 2.0;
                if magnitude > half {
                    let new_target = audio.controller.play_target_s + magnitude;
                    if audio.controller.duration_s() > new_target {
                        audio.controller.play_target_s = new_target;
                        audio.controller.play_target_offset_s = magnitude;
                    } else {
                        return Err(HlsError::TracksSynchronizationError(format!(
                            "start-time diff {magnitude}s beyond audio duration"
                        )));
                    }
                } else {
                    debug!(diff = magnitude, "A/V difference tolerable");
                }
            }
        }

        info!(
            audio_target = audio.controller.play_target_s,
            video_target = video.controller.play_target_s,
            "track synchronization done"
        );
        Ok(())
    }

    /// §4.5.2: move both targets toward the live edge by the smaller of the
    /// two per-track offsets so neither falls off its window.
    fn apply_live_adjust(&mut self, live_offset: f64) {
        let Some(video) = self.video.as_mut() else { return };
        let v_duration = video.controller.duration_s();
        let v_offset_budget = live_offset + video.controller.play_target_offset_s;
        if v_duration <= v_offset_budget {
            warn!(
                duration = v_duration,
                needed = v_offset_budget,
                "live adjust not possible on video"
            );
            self.seek_position_s = video.controller.play_target_s;
            return;
        }
        let offset_video = v_duration - live_offset - video.controller.play_target_offset_s;
        let offset_audio = match self.audio.as_ref() {
            Some(a) => {
                let a_duration = a.controller.duration_s();
                let a_budget = live_offset + a.controller.play_target_offset_s;
                if a_duration > a_budget {
                    a_duration - live_offset - a.controller.play_target_offset_s
                } else {
                    warn!(
                        duration = a_duration,
                        needed = a_budget,
                        "audio too short for live adjust"
                    );
                    0.0
                }
            }
            None => offset_video,
        };

        let offset = offset_video.min(offset_audio);
        if let Some(v) = self.video.as_mut() {
            v.controller.play_target_s += offset;
        }
        if let Some(a) = self.audio.as_mut() {
            a.controller.play_target_s += offset;
        }
        if offset > 0.0 {
            self.is_at_live_point = true;
        }
        self.seek_position_s = self
            .video
            .as_ref()
            .map(|v| v.controller.play_target_s)
            .unwrap_or(0.0);
        info!(
            offset,
            at_live_point = self.is_at_live_point,
            "live-edge adjustment applied"
        );
    }

    /// Walk discontinuity pairs and pull both targets back onto the previous
    /// shared period boundary.
    fn align_to_period_boundary(&mut self) {
        let (Some(video), Some(audio)) = (&mut self.video, &mut self.audio) else {
            return;
        };
        let v_playlist = video.controller.playlist();
        let a_playlist = audio.controller.playlist();
        let count = v_playlist.period_count();

        let mut video_prev = 0.0_f64;
        let mut audio_prev = 0.0_f64;
        for i in 0..=count {
            let (video_next, audio_next) = if i < count {
                (
                    v_playlist.discontinuities[i].position_from_start_s,
                    a_playlist.discontinuities[i].position_from_start_s,
                )
            } else {
                let end = v_playlist.total_duration_s;
                (end, end)
            };
            if video_next > video.controller.play_target_s + 5.0
                && audio_next > audio.controller.play_target_s + 5.0
            {
                if video.controller.play_target_s < video_prev {
                    info!(
                        from = video.controller.play_target_s,
                        to = video_prev,
                        "video target advanced to period boundary"
                    );
                    video.controller.play_target_s = video_prev;
                }
                if audio.controller.play_target_s < audio_prev {
                    info!(
                        from = audio.controller.play_target_s,
                        to = audio_prev,
                        "audio target advanced to period boundary"
                    );
                    audio.controller.play_target_s = audio_prev;
                }
                break;
            }
            video_prev = video_next;
            audio_prev = audio_next;
        }
    }

    /// Spawn fetch and inject workers for every enabled track.
    pub fn start(&mut self) -> HlsResult<()> {
        let video = self
            .video
            .take()
            .ok_or_else(|| HlsError::ManifestContentError("start() before init()".into()))?;
        let audio = self.audio.take();

        self.sink.reset();
        self.transition(CollectorState::Collecting);

        for track in std::iter::once(video).chain(audio) {
            let mut t = track;
            let kind = t.controller.kind;
            if let Some(rx) = t.ring_rx.take() {
                self.workers.push(tokio::spawn(run_injector(
                    kind,
                    rx,
                    self.sink.clone(),
                    self.shared.clone(),
                )));
            }
            // Emit the fMP4 header before the first media fragment.
            if t.controller.playlist().init_fragment_info.is_some() {
                t.controller
                    .control
                    .inject_init_fragment
                    .store(true, std::sync::atomic::Ordering::Release);
            }
            self.workers.push(tokio::spawn(t.controller.run()));
        }
        Ok(())
    }

    /// Stop everything: disable downloads, abort DRM waits, join workers.
    pub async fn stop(&mut self, clear_drm: bool) {
        self.shared.disable_downloads();
        self.drm.cancel_all_key_waits().await;
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "worker join failed");
                }
            }
        }
        if clear_drm {
            self.drm.reset_all().await;
        }
        self.sink.reset();
        if self.state != CollectorState::Failed {
            self.transition(CollectorState::Completed);
        }
        debug!("collector stopped");
    }

    /// Wait for the workers to finish on their own (end of VOD stream).
    pub async fn join(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        if self.state == CollectorState::Collecting {
            self.transition(CollectorState::Completed);
        }
    }

    #[must_use]
    pub fn state(&self) -> CollectorState {
        self.state
    }

    #[must_use]
    pub fn seek_position_s(&self) -> f64 {
        self.seek_position_s
    }

    /// Trick-play frame rate chosen at tune.
    #[must_use]
    pub fn trick_play_fps(&self) -> u32 {
        self.trick_play_fps
    }

    /// The parsed master manifest, once tuned.
    #[must_use]
    pub fn master_manifest(&self) -> Option<&MasterManifest> {
        self.master.as_ref().map(|m| &m.master)
    }
}

/// Container format from the first URI line's extension.
pub(crate) fn detect_format(buffer: &str) -> SegmentFormat {
    for entry in Lines::new(buffer) {
        if let PlaylistLine::Uri(uri) = entry.line {
            let path = uri.split('?').next().unwrap_or(uri);
            return match path.rsplit('.').next() {
                Some("ts") => SegmentFormat::MpegTs,
                Some("mp4") | Some("m4s") => SegmentFormat::Fmp4,
                Some("aac") => SegmentFormat::AacEs,
                _ => SegmentFormat::Unknown,
            };
        }
    }
    SegmentFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_from_first_uri() {
        assert_eq!(
            detect_format("#EXTM3U\n#EXTINF:4,\nseg.ts\n"),
            SegmentFormat::MpegTs
        );
        assert_eq!(
            detect_format("#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\nseg.m4s\n"),
            SegmentFormat::Fmp4
        );
        assert_eq!(
            detect_format("#EXTM3U\n#EXTINF:4,\nseg.aac?token=1\n"),
            SegmentFormat::AacEs
        );
        assert_eq!(detect_format("#EXTM3U\n"), SegmentFormat::Unknown);
    }

    #[test]
    fn tune_type_accessors() {
        assert_eq!(TuneType::Seek(42.0).seek_position(), Some(42.0));
        assert_eq!(TuneType::NewNormal.seek_position(), None);
        assert!(TuneType::NewSeek(1.0).is_new());
        assert!(!TuneType::SeekToLive.is_new());
    }
}
