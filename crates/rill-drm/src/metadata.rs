use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::error::{DrmError, DrmResult};

/// SHA-1 digest identifying a DRM metadata blob.
///
/// Playlists reference it base16-encoded (`CMSha1Hash=0x…`, 40 hex chars);
/// internally the raw 20 bytes are kept.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataHash([u8; 20]);

impl MetadataHash {
    pub const LEN: usize = 20;

    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        Self(digest.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Base16 (lowercase hex) form, 40 characters.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the base16 form, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> DrmResult<Self> {
        let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let raw = hex::decode(s.trim())
            .map_err(|e| DrmError::InvalidMetadata(format!("bad hash hex: {e}")))?;
        let arr: [u8; 20] = raw
            .try_into()
            .map_err(|_| DrmError::InvalidMetadata("hash is not 20 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for MetadataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataHash({})", self.to_hex())
    }
}

impl fmt::Display for MetadataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One `EXT-X-FAXS-CM` metadata blob and its digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrmMetadata {
    pub data: Bytes,
    pub hash: MetadataHash,
}

impl DrmMetadata {
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        let hash = MetadataHash::of(&data);
        Self { data, hash }
    }

    /// Decode the base64 payload of an `EXT-X-FAXS-CM:` tag.
    pub fn from_base64(payload: &str) -> DrmResult<Self> {
        let data = BASE64
            .decode(payload.trim().as_bytes())
            .map_err(|e| DrmError::InvalidMetadata(format!("base64 decode failed: {e}")))?;
        Ok(Self::new(Bytes::from(data)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn hex_round_trip_is_identity() {
        let hash = MetadataHash::of(b"some metadata bytes");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(MetadataHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(MetadataHash::from_hex(&format!("0x{hex}")).unwrap(), hash);
    }

    #[rstest]
    #[case("deadbeef")] // too short
    #[case("zz00000000000000000000000000000000000000")] // bad digit
    fn bad_hex_rejected(#[case] input: &str) {
        assert!(MetadataHash::from_hex(input).is_err());
    }

    #[test]
    fn base64_payload_hashes_decoded_bytes() {
        let payload = BASE64.encode(b"metadata-blob");
        let meta = DrmMetadata::from_base64(&payload).unwrap();
        assert_eq!(meta.data.as_ref(), b"metadata-blob");
        assert_eq!(meta.hash, MetadataHash::of(b"metadata-blob"));
    }

    #[test]
    fn invalid_base64_rejected() {
        assert!(DrmMetadata::from_base64("!!! not base64 !!!").is_err());
    }
}
