//! Playlist tokenizer and attribute-list parsing.
//!
//! Both the master-manifest and media-playlist paths run on this tokenizer.
//! Lines end with LF or CRLF; `#EXT…` lines are tags, other `#` lines are
//! comments, remaining non-empty lines are URIs. Parsing never panics on
//! malformed input; bad pieces are logged and skipped.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

/// Tags the collector understands. Anything else surfaces as `Unknown` and is
/// skipped (logged once per occurrence at debug level).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagKind {
    ExtM3u,
    Version,
    StreamInf,
    IFrameStreamInf,
    Media,
    IndependentSegments,
    Inf,
    ByteRange,
    TargetDuration,
    MediaSequence,
    Key,
    ProgramDateTime,
    AllowCache,
    PlaylistType,
    EndList,
    Discontinuity,
    IFramesOnly,
    Map,
    /// `EXT-X-FAXS-CM`: rotating-key DRM metadata payload (base64).
    FaxsCm,
    /// `EXT-X-X1-LIN-CK`: defer-license-by-N-seconds directive.
    DeferLicense,
    Unknown,
}

impl TagKind {
    fn from_name(name: &str) -> Self {
        match name {
            "EXTM3U" => Self::ExtM3u,
            "EXT-X-VERSION" => Self::Version,
            "EXT-X-STREAM-INF" => Self::StreamInf,
            "EXT-X-I-FRAME-STREAM-INF" => Self::IFrameStreamInf,
            "EXT-X-MEDIA" => Self::Media,
            "EXT-X-INDEPENDENT-SEGMENTS" => Self::IndependentSegments,
            "EXTINF" => Self::Inf,
            "EXT-X-BYTERANGE" => Self::ByteRange,
            "EXT-X-TARGETDURATION" => Self::TargetDuration,
            "EXT-X-MEDIA-SEQUENCE" => Self::MediaSequence,
            "EXT-X-KEY" => Self::Key,
            "EXT-X-PROGRAM-DATE-TIME" => Self::ProgramDateTime,
            "EXT-X-ALLOW-CACHE" => Self::AllowCache,
            "EXT-X-PLAYLIST-TYPE" => Self::PlaylistType,
            "EXT-X-ENDLIST" => Self::EndList,
            "EXT-X-DISCONTINUITY" => Self::Discontinuity,
            "EXT-X-I-FRAMES-ONLY" => Self::IFramesOnly,
            "EXT-X-MAP" => Self::Map,
            "EXT-X-FAXS-CM" => Self::FaxsCm,
            "EXT-X-X1-LIN-CK" => Self::DeferLicense,
            _ => Self::Unknown,
        }
    }
}

/// One tokenized playlist line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaylistLine<'a> {
    /// `#EXT…` tag; `rest` is everything after the first `:` (empty if none).
    Tag {
        kind: TagKind,
        name: &'a str,
        rest: &'a str,
    },
    /// Non-tag `#` line.
    Comment(&'a str),
    Uri(&'a str),
}

/// A tokenized line plus the byte offset of its first character.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEntry<'a> {
    pub offset: usize,
    pub line: PlaylistLine<'a>,
}

/// Forward line cursor over a playlist buffer.
///
/// Resumable: `pos()` after a `next()` points past the consumed line, and a
/// cursor can be re-created at that offset, which is how the fetch-loop walk
/// continues from the last returned URI across calls.
#[derive(Clone, Debug)]
pub struct Lines<'a> {
    buf: &'a str,
    pos: usize,
}

impl<'a> Lines<'a> {
    #[must_use]
    pub fn new(buf: &'a str) -> Self {
        Self { buf, pos: 0 }
    }

    /// Resume tokenizing at a byte offset previously obtained from `pos()`.
    #[must_use]
    pub fn at_offset(buf: &'a str, offset: usize) -> Self {
        Self {
            buf,
            pos: offset.min(buf.len()),
        }
    }

    /// Offset of the next unread byte.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = LineEntry<'a>;

    fn next(&mut self) -> Option<LineEntry<'a>> {
        loop {
            if self.pos >= self.buf.len() {
                return None;
            }
            let start = self.pos;
            let remainder = &self.buf[start..];
            let (raw, advance) = match remainder.find('\n') {
                Some(lf) => (&remainder[..lf], lf + 1),
                None => (remainder, remainder.len()),
            };
            self.pos = start + advance;

            let line = raw.strip_suffix('\r').unwrap_or(raw).trim_end_matches('\0');
            if line.trim().is_empty() {
                continue;
            }

            let parsed = if let Some(tag) = line.strip_prefix('#') {
                if tag.starts_with("EXT") {
                    let (name, rest) = match tag.find(':') {
                        Some(colon) => (&tag[..colon], &tag[colon + 1..]),
                        None => (tag, ""),
                    };
                    let kind = TagKind::from_name(name);
                    if kind == TagKind::Unknown {
                        debug!(tag = name, "skipping unrecognized tag");
                    }
                    PlaylistLine::Tag { kind, name, rest }
                } else {
                    PlaylistLine::Comment(line)
                }
            } else {
                PlaylistLine::Uri(line.trim())
            };

            return Some(LineEntry {
                offset: start,
                line: parsed,
            });
        }
    }
}

/// Iterator over an attribute list: `NAME=value,NAME="quoted,value",…`.
///
/// Splits on unquoted commas, on the first `=` within a field, and strips
/// surrounding double quotes from values. Malformed fields (no `=`) are
/// logged and skipped.
#[derive(Clone, Debug)]
pub struct AttrIter<'a> {
    rest: &'a str,
}

impl<'a> AttrIter<'a> {
    #[must_use]
    pub fn new(attr_list: &'a str) -> Self {
        Self { rest: attr_list }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        loop {
            let field_start = self.rest.trim_start_matches(' ');
            if field_start.is_empty() {
                return None;
            }

            // Field runs to the first comma outside double quotes.
            let mut in_quote = false;
            let mut field_end = field_start.len();
            for (i, c) in field_start.char_indices() {
                match c {
                    '"' => in_quote = !in_quote,
                    ',' if !in_quote => {
                        field_end = i;
                        break;
                    }
                    _ => {}
                }
            }
            let field = &field_start[..field_end];
            self.rest = field_start[field_end..].strip_prefix(',').unwrap_or("");

            let Some(eq) = field.find('=') else {
                warn!(field, "malformed attribute (no '='), skipping");
                continue;
            };
            let name = field[..eq].trim();
            let mut value = field[eq + 1..].trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            return Some((name, value));
        }
    }
}

/// `RESOLUTION=WxH`.
#[must_use]
pub fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Hex IV attribute (`0x…`, 32 hex digits).
#[must_use]
pub fn parse_iv(value: &str) -> Option<[u8; 16]> {
    let hex_digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))?;
    if hex_digits.len() != 32 {
        return None;
    }
    let mut iv = [0u8; 16];
    for (i, chunk) in hex_digits.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        iv[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(iv)
}

/// `EXT-X-BYTERANGE` payload: `<length>[@<offset>]`. Without an explicit
/// offset the range starts where the previous one ended.
#[must_use]
pub fn parse_byte_range(value: &str, running_offset: u64) -> Option<(u64, u64)> {
    match value.split_once('@') {
        Some((len, off)) => Some((len.trim().parse().ok()?, off.trim().parse().ok()?)),
        None => Some((value.trim().parse().ok()?, running_offset)),
    }
}

/// `EXT-X-PROGRAM-DATE-TIME` payload. Accepts RFC 3339; a missing zone is
/// read as UTC (tracks are only compared against each other).
#[must_use]
pub fn parse_program_date_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    warn!(value, "unparseable PROGRAM-DATE-TIME");
    None
}

/// Leading float of an `EXTINF` payload (`<duration>[,<title>]`).
#[must_use]
pub fn parse_extinf_duration(rest: &str) -> f64 {
    let numeric = rest.split(',').next().unwrap_or("").trim();
    numeric.parse().unwrap_or(0.0)
}

/// YES/NO attribute values.
#[must_use]
pub fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("YES")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    #[test]
    fn tokenizes_lf_and_crlf() {
        let buf = "#EXTM3U\r\n#EXTINF:4.0,\nseg0.ts\r\n\n#EXT-X-ENDLIST";
        let lines: Vec<_> = Lines::new(buf).map(|e| e.line).collect();
        assert_eq!(
            lines,
            vec![
                PlaylistLine::Tag {
                    kind: TagKind::ExtM3u,
                    name: "EXTM3U",
                    rest: ""
                },
                PlaylistLine::Tag {
                    kind: TagKind::Inf,
                    name: "EXTINF",
                    rest: "4.0,"
                },
                PlaylistLine::Uri("seg0.ts"),
                PlaylistLine::Tag {
                    kind: TagKind::EndList,
                    name: "EXT-X-ENDLIST",
                    rest: ""
                },
            ]
        );
    }

    #[test]
    fn cursor_resumes_at_offset() {
        let buf = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n";
        let mut cursor = Lines::new(buf);
        // Consume through the first URI.
        loop {
            let entry = cursor.next().expect("line");
            if matches!(entry.line, PlaylistLine::Uri(_)) {
                break;
            }
        }
        let resumed: Vec<_> = Lines::at_offset(buf, cursor.pos()).map(|e| e.line).collect();
        assert_eq!(
            resumed,
            vec![
                PlaylistLine::Tag {
                    kind: TagKind::Inf,
                    name: "EXTINF",
                    rest: "4.0,"
                },
                PlaylistLine::Uri("seg1.ts"),
            ]
        );
    }

    #[test]
    fn non_ext_hash_lines_are_comments() {
        let lines: Vec<_> = Lines::new("# just a comment\nseg.ts\n").map(|e| e.line).collect();
        assert_eq!(
            lines,
            vec![PlaylistLine::Comment("# just a comment"), PlaylistLine::Uri("seg.ts")]
        );
    }

    #[test]
    fn unknown_ext_tag_is_reported_not_dropped() {
        let lines: Vec<_> = Lines::new("#EXT-X-CUE:ad=1\n").map(|e| e.line).collect();
        assert_eq!(
            lines,
            vec![PlaylistLine::Tag {
                kind: TagKind::Unknown,
                name: "EXT-X-CUE",
                rest: "ad=1"
            }]
        );
    }

    #[test]
    fn attr_list_round_trip() {
        let input = r#"METHOD=AES-128,URI="https://kms/key?ids=a,b,c",IV=0xAB,CMSha1Hash=0x12"#;
        let attrs: HashMap<_, _> = AttrIter::new(input).collect();
        assert_eq!(attrs["METHOD"], "AES-128");
        assert_eq!(attrs["URI"], "https://kms/key?ids=a,b,c");
        assert_eq!(attrs["IV"], "0xAB");
        assert_eq!(attrs["CMSha1Hash"], "0x12");
        assert_eq!(attrs.len(), 4);
    }

    #[test]
    fn malformed_attr_fields_are_skipped() {
        let attrs: Vec<_> = AttrIter::new("BANDWIDTH=1000,garbage,CODECS=\"avc1\"").collect();
        assert_eq!(attrs, vec![("BANDWIDTH", "1000"), ("CODECS", "avc1")]);
    }

    #[test]
    fn attr_whitespace_is_tolerated() {
        let attrs: Vec<_> = AttrIter::new(" TYPE = AUDIO , NAME = \"English\" ").collect();
        assert_eq!(attrs, vec![("TYPE", "AUDIO"), ("NAME", "English")]);
    }

    #[rstest]
    #[case("640x360", Some((640, 360)))]
    #[case("1920x1080", Some((1920, 1080)))]
    #[case("bogus", None)]
    fn resolution_parse(#[case] input: &str, #[case] expected: Option<(u32, u32)>) {
        assert_eq!(parse_resolution(input), expected);
    }

    #[test]
    fn iv_parse() {
        let iv = parse_iv("0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(iv[0], 0x00);
        assert_eq!(iv[15], 0x0f);
        assert!(parse_iv("0xdeadbeef").is_none());
        assert!(parse_iv("no-prefix").is_none());
    }

    #[rstest]
    #[case("1024@2048", 0, (1024, 2048))]
    #[case("512", 4096, (512, 4096))]
    fn byte_range_parse(
        #[case] input: &str,
        #[case] running: u64,
        #[case] expected: (u64, u64),
    ) {
        assert_eq!(parse_byte_range(input, running), Some(expected));
    }

    #[rstest]
    #[case("2023-01-01T10:00:00.500Z")]
    #[case("2023-01-01T10:00:00.500+00:00")]
    #[case("2023-01-01T10:00:00.500")]
    fn program_date_time_variants(#[case] input: &str) {
        let dt = parse_program_date_time(input).expect("parsed");
        assert_eq!(dt.timestamp(), 1_672_567_200);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }

    #[rstest]
    #[case("4.0,", 4.0)]
    #[case("6", 6.0)]
    #[case("2.002,segment title", 2.002)]
    #[case("not a number", 0.0)]
    fn extinf_duration(#[case] input: &str, #[case] expected: f64) {
        assert!((parse_extinf_duration(input) - expected).abs() < f64::EPSILON);
    }
}
