//! Media playlist indexing.
//!
//! A freshly downloaded playlist buffer is tokenized once into an ordered
//! fragment index plus side tables for discontinuities, rotating-key DRM
//! metadata, and key tags. Nodes reference the immutable buffer by byte
//! offset; the fetch-loop walk resumes tokenization from those offsets.

use chrono::{DateTime, Utc};
use rill_drm::{DrmMetadata, MetadataHash};
use tracing::{debug, info, warn};

use crate::error::{HlsError, HlsResult};
use crate::parser::{
    is_yes, parse_byte_range, parse_extinf_duration, parse_iv, parse_program_date_time, AttrIter,
    Lines, PlaylistLine, TagKind,
};

/// Declared playlist type. `Undefined` behaves as live until proven
/// otherwise; once a presentation is `Vod` it never goes back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaylistKind {
    #[default]
    Undefined,
    Vod,
    Event,
    Live,
}

impl PlaylistKind {
    /// Anything that is not VOD refreshes like live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Vod)
    }
}

/// Segment encryption method from `EXT-X-KEY:METHOD=`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncryptionMethod {
    #[default]
    None,
    Aes128,
}

/// Effective `EXT-X-KEY` state, one entry per KEY tag observed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyTagInfo {
    pub method: EncryptionMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
    /// `CMSha1Hash=0x…`, the digest of the governing FAXS-CM metadata.
    pub cm_hash: Option<MetadataHash>,
}

/// One fragment in playlist order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FragmentNode {
    /// Sum of EXTINF durations up to and including this fragment.
    pub completion_time_from_start_s: f64,
    pub duration_s: f64,
    /// Byte offset of this fragment's `#EXTINF` tag in the playlist buffer.
    pub info_offset: usize,
    /// Index into [`MediaPlaylist::drm_metadata`]; `None` iff the fragment is
    /// clear or uses vanilla AES-128 (no rotating metadata).
    pub drm_metadata_idx: Option<usize>,
    /// Index into [`MediaPlaylist::key_tags`] for the governing KEY tag
    /// (`METHOD=NONE` included); `None` before any KEY tag.
    pub key_tag_idx: Option<usize>,
    pub byte_range: Option<rill_net::ByteRange>,
    pub encrypted: bool,
}

/// One `EXT-X-DISCONTINUITY`, bound to the fragment that follows it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiscontinuityNode {
    pub fragment_index: usize,
    pub position_from_start_s: f64,
    pub program_date_time: Option<DateTime<Utc>>,
}

/// A subscribed in-playlist tag observed while indexing.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedTag {
    pub position_s: f64,
    pub name: String,
    pub content: String,
}

/// Indexed view of one media playlist download.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration_s: f64,
    pub first_media_sequence_number: u64,
    pub playlist_kind: PlaylistKind,
    pub has_endlist: bool,
    /// Raw attribute text of `EXT-X-MAP`, if present.
    pub init_fragment_info: Option<String>,
    pub fragments: Vec<FragmentNode>,
    pub discontinuities: Vec<DiscontinuityNode>,
    pub drm_metadata: Vec<DrmMetadata>,
    pub key_tags: Vec<KeyTagInfo>,
    pub drm_key_tag_count: u32,
    pub total_duration_s: f64,
    pub iframes_only: bool,
    pub allow_cache: bool,
    /// First `EXT-X-PROGRAM-DATE-TIME`; anchors initial A/V sync.
    pub start_date_time: Option<DateTime<Utc>>,
    /// `EXT-X-X1-LIN-CK:<seconds>` payload, when present.
    pub defer_license_window_s: Option<u64>,
    /// Subscribed tags with their positions, for timed-metadata events.
    pub timed_tags: Vec<TimedTag>,
}

impl MediaPlaylist {
    /// Index a playlist buffer.
    pub fn index(buf: &str) -> HlsResult<Self> {
        Self::index_with(buf, &[])
    }

    /// Index a playlist buffer, collecting occurrences of `subscribed_tags`
    /// (full tag names, e.g. `EXT-X-CUE`) as timed metadata.
    pub fn index_with(buf: &str, subscribed_tags: &[String]) -> HlsResult<Self> {
        if !buf.starts_with("#EXTM3U") {
            return Err(HlsError::InvalidManifest(
                "media playlist does not start with #EXTM3U".into(),
            ));
        }

        let mut playlist = Self {
            allow_cache: true,
            ..Self::default()
        };

        // Pass 1: collect rotating-key metadata blobs so KEY tags seen during
        // the main walk can resolve their CMSha1Hash references.
        for entry in Lines::new(buf) {
            if let PlaylistLine::Tag {
                kind: TagKind::FaxsCm,
                rest,
                ..
            } = entry.line
            {
                match DrmMetadata::from_base64(rest) {
                    Ok(meta) => {
                        debug!(hash = %meta.hash, "indexed DRM metadata");
                        playlist.drm_metadata.push(meta);
                    }
                    Err(e) => warn!(error = %e, "discarding undecodable FAXS-CM payload"),
                }
            }
        }

        // Pass 2: the main walk.
        let mut total_duration = 0.0_f64;
        let mut pending_duration: Option<(f64, usize)> = None;
        let mut pending_discontinuity = false;
        let mut pending_date_time: Option<DateTime<Utc>> = None;
        let mut pending_byte_range: Option<rill_net::ByteRange> = None;
        let mut byte_range_cursor = 0_u64;
        let mut current_key: Option<usize> = None;
        let mut encrypted = false;
        let mut drm_metadata_idx: Option<usize> = None;

        for entry in Lines::new(buf) {
            match entry.line {
                PlaylistLine::Tag { kind, name, rest } => match kind {
                    TagKind::TargetDuration => {
                        playlist.target_duration_s = rest.trim().parse().unwrap_or(0.0);
                    }
                    TagKind::MediaSequence => {
                        playlist.first_media_sequence_number = rest.trim().parse().unwrap_or(0);
                    }
                    TagKind::PlaylistType => match rest.trim() {
                        "VOD" => playlist.playlist_kind = PlaylistKind::Vod,
                        "EVENT" => playlist.playlist_kind = PlaylistKind::Event,
                        other => {
                            return Err(HlsError::InvalidManifest(format!(
                                "unknown PLAYLIST-TYPE '{other}'"
                            )))
                        }
                    },
                    TagKind::EndList => playlist.has_endlist = true,
                    TagKind::Map => {
                        playlist.init_fragment_info = Some(rest.to_string());
                    }
                    TagKind::IFramesOnly => playlist.iframes_only = true,
                    TagKind::AllowCache => playlist.allow_cache = is_yes(rest.trim()),
                    TagKind::Inf => {
                        pending_duration = Some((parse_extinf_duration(rest), entry.offset));
                    }
                    TagKind::ByteRange => {
                        if let Some((length, offset)) = parse_byte_range(rest, byte_range_cursor) {
                            pending_byte_range =
                                Some(rill_net::ByteRange::from_length_offset(length, offset));
                            byte_range_cursor = offset + length;
                        }
                    }
                    TagKind::Discontinuity => {
                        // A discontinuity before any content carries no break.
                        if total_duration != 0.0 {
                            pending_discontinuity = true;
                        }
                    }
                    TagKind::ProgramDateTime => {
                        pending_date_time = parse_program_date_time(rest);
                        if playlist.start_date_time.is_none() {
                            playlist.start_date_time = pending_date_time;
                        }
                    }
                    TagKind::Key => {
                        let key = parse_key_tag(rest)?;
                        playlist.drm_key_tag_count += 1;
                        encrypted = key.method == EncryptionMethod::Aes128;
                        drm_metadata_idx = match (encrypted, key.cm_hash) {
                            (true, Some(hash)) => {
                                let found = playlist
                                    .drm_metadata
                                    .iter()
                                    .position(|m| m.hash == hash);
                                if found.is_none() {
                                    warn!(hash = %hash, "CMSha1Hash has no matching FAXS-CM metadata");
                                }
                                found
                            }
                            _ => None,
                        };
                        playlist.key_tags.push(key);
                        current_key = Some(playlist.key_tags.len() - 1);
                    }
                    TagKind::DeferLicense => match rest.trim().parse::<u64>() {
                        Ok(secs) if secs > 0 => playlist.defer_license_window_s = Some(secs),
                        _ => warn!(payload = rest, "invalid defer-license window"),
                    },
                    TagKind::FaxsCm
                    | TagKind::ExtM3u
                    | TagKind::Version
                    | TagKind::IndependentSegments => {}
                    TagKind::Unknown => {
                        if subscribed_tags.iter().any(|t| t == name) {
                            playlist.timed_tags.push(TimedTag {
                                position_s: total_duration,
                                name: name.to_string(),
                                content: rest.to_string(),
                            });
                        }
                    }
                    TagKind::StreamInf | TagKind::IFrameStreamInf | TagKind::Media => {
                        warn!(tag = name, "master-only tag in media playlist, ignoring");
                    }
                },
                PlaylistLine::Uri(_) => {
                    let Some((duration, info_offset)) = pending_duration.take() else {
                        continue;
                    };
                    if pending_discontinuity {
                        playlist.discontinuities.push(DiscontinuityNode {
                            fragment_index: playlist.fragments.len(),
                            position_from_start_s: total_duration,
                            program_date_time: pending_date_time,
                        });
                        pending_discontinuity = false;
                    }
                    total_duration += duration;
                    playlist.fragments.push(FragmentNode {
                        completion_time_from_start_s: total_duration,
                        duration_s: duration,
                        info_offset,
                        drm_metadata_idx,
                        key_tag_idx: current_key,
                        byte_range: pending_byte_range.take(),
                        encrypted,
                    });
                    pending_date_time = None;
                }
                PlaylistLine::Comment(_) => {}
            }
        }

        // ENDLIST closes the window for good, even without PLAYLIST-TYPE.
        if playlist.has_endlist && playlist.playlist_kind != PlaylistKind::Vod {
            if playlist.playlist_kind == PlaylistKind::Undefined {
                info!("ENDLIST without PLAYLIST-TYPE, treating as VOD");
            }
            playlist.playlist_kind = PlaylistKind::Vod;
        } else if playlist.playlist_kind == PlaylistKind::Undefined {
            playlist.playlist_kind = PlaylistKind::Live;
        }

        playlist.total_duration_s = total_duration;
        Ok(playlist)
    }

    /// Completion time of the fragment with the given media sequence number,
    /// clamped into the window. Drives culling arithmetic across refreshes.
    #[must_use]
    pub fn completion_time_for_sequence(&self, sequence: u64) -> f64 {
        if self.fragments.is_empty() {
            return 0.0;
        }
        let Some(rel) = sequence.checked_sub(self.first_media_sequence_number) else {
            warn!(
                sequence,
                first = self.first_media_sequence_number,
                "sequence number precedes the window"
            );
            return 0.0;
        };
        let idx = (rel as usize).min(self.fragments.len() - 1);
        self.fragments[idx].completion_time_from_start_s
    }

    /// Key tag governing a fragment.
    #[must_use]
    pub fn fragment_key(&self, fragment: &FragmentNode) -> Option<&KeyTagInfo> {
        fragment.key_tag_idx.and_then(|i| self.key_tags.get(i))
    }

    /// Number of continuous periods (discontinuity count).
    #[must_use]
    pub fn period_count(&self) -> usize {
        self.discontinuities.len()
    }

    /// Start position of the period with the given index.
    #[must_use]
    pub fn period_start_position(&self, period_idx: usize) -> f64 {
        self.discontinuities
            .get(period_idx)
            .map(|d| d.position_from_start_s)
            .unwrap_or(0.0)
    }

    /// Period containing the fragment that would play at `play_target`, and
    /// the offset of that fragment's start from the period start. `None`
    /// when `play_target` is past the window or in the first period.
    #[must_use]
    pub fn next_fragment_period_info(&self, play_target: f64) -> Option<(usize, f64)> {
        let mut prev_completion = 0.0_f64;
        let mut fragment_idx = None;
        for (idx, node) in self.fragments.iter().enumerate() {
            if node.completion_time_from_start_s >= play_target {
                fragment_idx = Some(idx);
                break;
            }
            prev_completion = node.completion_time_from_start_s;
        }
        let idx = fragment_idx?;
        if idx == 0 {
            return None;
        }

        let mut period_idx = None;
        let mut period_start = 0.0;
        for (i, disc) in self.discontinuities.iter().enumerate() {
            if disc.fragment_index > idx {
                break;
            }
            period_idx = Some(i);
            period_start = disc.position_from_start_s;
        }
        Some((period_idx?, prev_completion - period_start))
    }
}

fn parse_key_tag(attr_list: &str) -> HlsResult<KeyTagInfo> {
    let mut key = KeyTagInfo::default();
    for (name, value) in AttrIter::new(attr_list) {
        match name {
            "METHOD" => {
                key.method = match value {
                    "NONE" => EncryptionMethod::None,
                    "AES-128" => EncryptionMethod::Aes128,
                    other => {
                        return Err(HlsError::InvalidManifest(format!(
                            "unsupported encryption METHOD '{other}'"
                        )))
                    }
                }
            }
            "URI" => key.uri = Some(value.to_string()),
            "IV" => key.iv = parse_iv(value),
            "CMSha1Hash" => match MetadataHash::from_hex(value) {
                Ok(hash) => key.cm_hash = Some(hash),
                Err(e) => warn!(error = %e, "bad CMSha1Hash attribute"),
            },
            "KEYFORMAT" | "KEYFORMATVERSIONS" => {}
            other => debug!(attr = other, "unknown KEY attribute"),
        }
    }
    Ok(key)
}
