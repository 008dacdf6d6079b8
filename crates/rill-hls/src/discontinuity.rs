//! Cross-track discontinuity matching.
//!
//! Before honoring a discontinuity flag, a track asks whether the *other*
//! track carries a matching discontinuity in a ±30 s window. On live
//! presentations the answer may legitimately be "not yet" (the other track's
//! playlist just hasn't slid far enough), so the check can wait through a
//! bounded number of refresh publications before giving up.

use std::sync::Arc;

use tracing::{debug, info};

use crate::constants::{
    DISCONTINUITY_DISCARD_TOLERANCE_SECONDS, MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT,
    MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE,
};
use crate::state::{CollectorShared, SharedTrack};

/// Result of a cross-track discontinuity probe.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DiscontinuityMatch {
    /// `other_discontinuity_time - position`, when program-date-time drove
    /// the comparison. `None` for window-relative matches, where only the
    /// existence of the discontinuity matters.
    pub diff_s: Option<f64>,
}

impl SharedTrack {
    /// Look for a discontinuity around `position` (±30 s), newer than the
    /// last one already matched on this track.
    ///
    /// `position` is window-relative time unless `use_start_time`, in which
    /// case it is epoch seconds from program-date-time. `play_position` and
    /// `live`/`tsb_like` control how long the probe may wait for refreshes.
    pub(crate) async fn has_discontinuity_around(
        &self,
        position: f64,
        use_start_time: bool,
        play_position: f64,
        live: bool,
        tsb_like: bool,
        shared: &Arc<CollectorShared>,
    ) -> Option<DiscontinuityMatch> {
        let low = position - DISCONTINUITY_DISCARD_TOLERANCE_SECONDS;
        let high = position + DISCONTINUITY_DISCARD_TOLERANCE_SECONDS;
        let max_refresh_waits = if tsb_like {
            MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT
        } else {
            MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE
        };
        let mut refresh_waits = 0_u32;

        while shared.downloads_enabled() {
            // Arm the waiter before inspecting state so a publication racing
            // with the check cannot be missed.
            let notified = self.indexed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.snapshot().await;
            let mut last_matched = self.last_matched_discontinuity.lock().await;

            let mut best: Option<DiscontinuityMatch> = None;
            for disc in &snapshot.playlist.discontinuities {
                let absolute = disc.position_from_start_s + snapshot.culled_seconds;
                if *last_matched >= 0.0 && absolute <= *last_matched {
                    continue;
                }
                if use_start_time {
                    let Some(pdt) = disc.program_date_time else {
                        continue;
                    };
                    let disc_pos = pdt.timestamp() as f64
                        + f64::from(pdt.timestamp_subsec_micros()) / 1_000_000.0;
                    if low < disc_pos && high > disc_pos {
                        let diff = disc_pos - position;
                        let better = best
                            .and_then(|b| b.diff_s)
                            .map_or(true, |prev| diff.abs() < prev.abs());
                        if better {
                            best = Some(DiscontinuityMatch { diff_s: Some(diff) });
                            *last_matched = absolute;
                        } else {
                            break;
                        }
                    }
                } else if low < disc.position_from_start_s && high > disc.position_from_start_s {
                    *last_matched = absolute;
                    best = Some(DiscontinuityMatch { diff_s: None });
                    break;
                }
            }
            drop(last_matched);

            if let Some(found) = best {
                debug!(
                    track = self.kind.name(),
                    position,
                    diff = ?found.diff_s,
                    "matching discontinuity found"
                );
                return Some(found);
            }

            // Nothing in the window yet: on live, wait for a refresh as long
            // as the window may still grow toward the probed position.
            let duration = snapshot.playlist.total_duration_s;
            let may_still_arrive = !tsb_like
                || duration < play_position + DISCONTINUITY_DISCARD_TOLERANCE_SECONDS;
            if !live || refresh_waits >= max_refresh_waits || !may_still_arrive {
                info!(
                    track = self.kind.name(),
                    position,
                    refresh_waits,
                    duration,
                    "no matching discontinuity"
                );
                return None;
            }

            debug!(
                track = self.kind.name(),
                position,
                refresh_waits,
                generation = snapshot.generation,
                "waiting for playlist refresh"
            );
            tokio::select! {
                () = notified => refresh_waits += 1,
                () = shared.cancel.cancelled() => return None,
            }
        }
        None
    }
}
