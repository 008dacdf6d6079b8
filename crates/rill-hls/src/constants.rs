//! Collector tuning constants.

use std::time::Duration;

/// Fragment-selection slack when walking the playlist toward `play_target`.
pub const PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS: f64 = 0.1;

/// Manifest download retries before surfacing a failure.
pub const MAX_MANIFEST_DOWNLOAD_RETRY: u32 = 3;

/// Pause between master-manifest retry attempts.
pub const MANIFEST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Live playlist refresh cadence bounds.
pub const MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS: u64 = 6 * 1000;
pub const MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS: u64 = 500;

/// Consecutive fragment download failures tolerated on one track.
pub const MAX_SEG_DOWNLOAD_FAIL_COUNT: u32 = 10;

/// Consecutive decrypt failures tolerated before giving up.
pub const MAX_SEG_DRM_DECRYPT_FAIL_COUNT: u32 = 10;

/// Sequence-number distance treated as already in sync.
pub const MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC: u64 = 2;

/// Upper bound on one-fragment-at-a-time catch-up during sequence sync.
pub const MAX_SEQ_NUMBER_LAG_COUNT: u64 = 50;

/// Window for matching discontinuities across tracks.
pub const DISCONTINUITY_DISCARD_TOLERANCE_SECONDS: f64 = 30.0;

/// Playlist refreshes to wait for a matching discontinuity (event/TSB vs
/// plain live).
pub const MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT: u32 = 5;
pub const MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE: u32 = 1;

/// AES-128 IV length.
pub const DRM_IV_LEN: usize = 16;
