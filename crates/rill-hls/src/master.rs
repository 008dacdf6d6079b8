//! Master manifest model and parsing.

use tracing::{debug, warn};

use crate::error::{HlsError, HlsResult};
use crate::parser::{is_yes, parse_resolution, AttrIter, Lines, PlaylistLine, TagKind};

/// One `EXT-X-STREAM-INF` / `EXT-X-I-FRAME-STREAM-INF` entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariantProfile {
    pub is_iframe: bool,
    pub bandwidth_bps: u64,
    pub average_bandwidth_bps: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub codecs: Option<String>,
    pub audio_group: Option<String>,
    pub uri: String,
}

/// Alternate-rendition kind from `EXT-X-MEDIA:TYPE=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenditionKind {
    Audio,
    Video,
}

/// One `EXT-X-MEDIA` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaRendition {
    pub kind: RenditionKind,
    pub group_id: Option<String>,
    pub name: Option<String>,
    pub language: Option<String>,
    pub is_default: bool,
    pub autoselect: bool,
    pub forced: bool,
    pub uri: Option<String>,
    pub channels: Option<u32>,
    pub instream_id: Option<String>,
}

impl Default for MediaRendition {
    fn default() -> Self {
        Self {
            kind: RenditionKind::Audio,
            group_id: None,
            name: None,
            language: None,
            is_default: false,
            autoselect: false,
            forced: false,
            uri: None,
            channels: None,
            instream_id: None,
        }
    }
}

/// Parsed master manifest.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MasterManifest {
    pub profiles: Vec<VariantProfile>,
    pub renditions: Vec<MediaRendition>,
    /// Master-level `EXT-X-FAXS-CM` seen (metadata itself lives in the media
    /// playlists).
    pub has_drm_metadata: bool,
}

impl MasterManifest {
    /// Parse a master manifest buffer.
    pub fn parse(buf: &str) -> HlsResult<Self> {
        if !buf.starts_with("#EXTM3U") {
            return Err(HlsError::InvalidManifest(
                "master manifest does not start with #EXTM3U".into(),
            ));
        }

        let mut master = Self::default();
        let mut lines = Lines::new(buf);
        let mut pending_profile: Option<VariantProfile> = None;

        while let Some(entry) = lines.next() {
            match entry.line {
                PlaylistLine::Tag { kind, name, rest } => {
                    // A profile awaiting its URI line is abandoned if another
                    // tag arrives first.
                    if pending_profile.is_some()
                        && !matches!(kind, TagKind::StreamInf | TagKind::IFrameStreamInf)
                    {
                        warn!("STREAM-INF without a following URI line, dropping profile");
                        pending_profile = None;
                    }
                    match kind {
                        TagKind::StreamInf | TagKind::IFrameStreamInf => {
                            if pending_profile.take().is_some() {
                                warn!("STREAM-INF without a following URI line, dropping profile");
                            }
                            let profile =
                                parse_stream_inf(rest, kind == TagKind::IFrameStreamInf);
                            if profile.uri.is_empty() {
                                pending_profile = Some(profile);
                            } else {
                                master.profiles.push(profile);
                            }
                        }
                        TagKind::Media => {
                            if let Some(rendition) = parse_media(rest) {
                                master.renditions.push(rendition);
                            }
                        }
                        TagKind::FaxsCm => master.has_drm_metadata = true,
                        TagKind::ExtM3u
                        | TagKind::Version
                        | TagKind::IndependentSegments => {}
                        _ => debug!(tag = name, "tag ignored in master manifest"),
                    }
                }
                PlaylistLine::Uri(uri) => {
                    if let Some(mut profile) = pending_profile.take() {
                        profile.uri = uri.to_string();
                        master.profiles.push(profile);
                    } else {
                        warn!(uri, "URI line without preceding STREAM-INF in master");
                    }
                }
                PlaylistLine::Comment(_) => {}
            }
        }

        master.check_rendition_groups();
        Ok(master)
    }

    /// Every referenced audio group must name a rendition group that exists.
    fn check_rendition_groups(&self) {
        for profile in &self.profiles {
            if let Some(group) = &profile.audio_group {
                let present = self
                    .renditions
                    .iter()
                    .any(|r| r.group_id.as_deref() == Some(group.as_str()));
                if !present {
                    warn!(group = %group, uri = %profile.uri, "AUDIO group not found among renditions");
                }
            }
        }
    }

    /// Pick the audio rendition for `group`: first by preferred language,
    /// then the one marked DEFAULT. Returns the rendition and the language it
    /// settles on.
    pub fn select_audio_rendition(
        &self,
        group: &str,
        preferred_language: &str,
    ) -> Option<(&MediaRendition, String)> {
        let in_group = || {
            self.renditions
                .iter()
                .filter(move |r| r.kind == RenditionKind::Audio)
                .filter(move |r| r.group_id.as_deref() == Some(group))
        };

        if !preferred_language.is_empty() {
            if let Some(r) = in_group()
                .find(|r| r.language.as_deref() == Some(preferred_language))
            {
                return Some((r, preferred_language.to_string()));
            }
        }
        in_group().find(|r| r.is_default).map(|r| {
            let lang = r.language.clone().unwrap_or_else(|| "en".to_string());
            (r, lang)
        })
    }

    /// Bandwidths of playable (non-iframe) profiles, manifest order.
    #[must_use]
    pub fn playable_bandwidths(&self) -> Vec<u64> {
        self.profiles
            .iter()
            .filter(|p| !p.is_iframe)
            .map(|p| p.bandwidth_bps)
            .collect()
    }

    #[must_use]
    pub fn has_iframe_profile(&self) -> bool {
        self.profiles.iter().any(|p| p.is_iframe)
    }

    /// Languages across audio renditions, deduplicated, manifest order.
    #[must_use]
    pub fn audio_languages(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for r in &self.renditions {
            if r.kind != RenditionKind::Audio {
                continue;
            }
            if let Some(lang) = &r.language {
                if !out.iter().any(|l| l == lang) {
                    out.push(lang.clone());
                }
            }
        }
        out
    }
}

fn parse_stream_inf(attr_list: &str, is_iframe: bool) -> VariantProfile {
    let mut profile = VariantProfile {
        is_iframe,
        ..VariantProfile::default()
    };
    for (name, value) in AttrIter::new(attr_list) {
        match name {
            "BANDWIDTH" => profile.bandwidth_bps = value.parse().unwrap_or(0),
            "AVERAGE-BANDWIDTH" => profile.average_bandwidth_bps = value.parse().ok(),
            "RESOLUTION" => {
                if let Some((w, h)) = parse_resolution(value) {
                    profile.width = w;
                    profile.height = h;
                }
            }
            "FRAME-RATE" => profile.frame_rate = value.parse().ok(),
            "CODECS" => profile.codecs = Some(value.to_string()),
            "AUDIO" => profile.audio_group = Some(value.to_string()),
            "URI" => profile.uri = value.to_string(),
            "PROGRAM-ID" | "CLOSED-CAPTIONS" | "SUBTITLES" => {}
            other => debug!(attr = other, "unknown STREAM-INF attribute"),
        }
    }
    profile
}

fn parse_media(attr_list: &str) -> Option<MediaRendition> {
    let mut rendition = MediaRendition::default();
    let mut kind = None;
    for (name, value) in AttrIter::new(attr_list) {
        match name {
            "TYPE" => {
                kind = match value {
                    "AUDIO" => Some(RenditionKind::Audio),
                    "VIDEO" => Some(RenditionKind::Video),
                    other => {
                        debug!(kind = other, "unsupported EXT-X-MEDIA TYPE, skipping");
                        None
                    }
                }
            }
            "GROUP-ID" => rendition.group_id = Some(value.to_string()),
            "NAME" => rendition.name = Some(value.to_string()),
            "LANGUAGE" => rendition.language = Some(value.to_string()),
            "DEFAULT" => rendition.is_default = is_yes(value),
            "AUTOSELECT" => rendition.autoselect = is_yes(value),
            "FORCED" => rendition.forced = is_yes(value),
            "URI" => rendition.uri = Some(value.to_string()),
            "CHANNELS" => rendition.channels = value.parse().ok(),
            "INSTREAM-ID" => rendition.instream_id = Some(value.to_string()),
            other => debug!(attr = other, "unknown MEDIA attribute"),
        }
    }
    rendition.kind = kind?;
    Some(rendition)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-VERSION:4\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"Spanish\",LANGUAGE=\"es\",URI=\"audio/es.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\",AUDIO=\"aac\"\n\
video/360p.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,FRAME-RATE=29.970,AUDIO=\"aac\"\n\
video/720p.m3u8\n\
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=250000,RESOLUTION=640x360,URI=\"video/iframe.m3u8\"\n";

    #[test]
    fn parses_profiles_and_renditions() {
        let master = MasterManifest::parse(MASTER).unwrap();
        assert_eq!(master.profiles.len(), 3);
        assert_eq!(master.renditions.len(), 2);

        let p0 = &master.profiles[0];
        assert_eq!(p0.bandwidth_bps, 1_000_000);
        assert_eq!((p0.width, p0.height), (640, 360));
        assert_eq!(p0.uri, "video/360p.m3u8");
        assert_eq!(p0.audio_group.as_deref(), Some("aac"));
        assert!(!p0.is_iframe);

        let iframe = &master.profiles[2];
        assert!(iframe.is_iframe);
        assert_eq!(iframe.uri, "video/iframe.m3u8");

        assert!(master.has_iframe_profile());
        assert_eq!(master.playable_bandwidths(), vec![1_000_000, 3_000_000]);
    }

    #[test]
    fn rejects_non_m3u8() {
        assert!(matches!(
            MasterManifest::parse("<html>not a playlist</html>"),
            Err(HlsError::InvalidManifest(_))
        ));
    }

    #[rstest]
    #[case("es", "audio/es.m3u8", "es")]
    #[case("fr", "audio/en.m3u8", "en")] // falls back to DEFAULT
    #[case("", "audio/en.m3u8", "en")]
    fn audio_rendition_selection(
        #[case] preferred: &str,
        #[case] expected_uri: &str,
        #[case] expected_lang: &str,
    ) {
        let master = MasterManifest::parse(MASTER).unwrap();
        let (rendition, lang) = master
            .select_audio_rendition("aac", preferred)
            .expect("rendition");
        assert_eq!(rendition.uri.as_deref(), Some(expected_uri));
        assert_eq!(lang, expected_lang);
    }

    #[test]
    fn languages_deduplicated() {
        let master = MasterManifest::parse(MASTER).unwrap();
        assert_eq!(master.audio_languages(), vec!["en", "es"]);
    }

    #[test]
    fn single_variant_master() {
        let master = MasterManifest::parse(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360\nvideo.m3u8\n",
        )
        .unwrap();
        assert_eq!(master.profiles.len(), 1);
        assert_eq!(master.profiles[0].bandwidth_bps, 1_000_000);
        assert_eq!(master.profiles[0].uri, "video.m3u8");
    }
}
