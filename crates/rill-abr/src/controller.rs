use std::time::Instant;

use tracing::{debug, info};

use crate::estimator::ThroughputEstimator;
use crate::types::{AbrOptions, ProfileRegistry, ThroughputSample};

/// Adaptation decision point for the fetch loops.
///
/// Owns the profile registry and the throughput estimate. The video track
/// consults `check_for_ramp_down` after a failed fragment download and
/// `check_for_profile_change` after a successful cycle; both return the new
/// profile index when a switch should happen.
#[derive(Debug)]
pub struct AbrController {
    options: AbrOptions,
    registry: ProfileRegistry,
    estimator: ThroughputEstimator,
    current_profile: usize,
    last_switch_at: Option<Instant>,
}

impl AbrController {
    #[must_use]
    pub fn new(options: AbrOptions) -> Self {
        Self {
            options,
            registry: ProfileRegistry::new(),
            estimator: ThroughputEstimator::new(),
            current_profile: 0,
            last_switch_at: None,
        }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProfileRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn current_profile(&self) -> usize {
        self.current_profile
    }

    pub fn set_current_profile(&mut self, index: usize) {
        self.current_profile = index;
    }

    /// Choose the tune-time profile: the persisted bandwidth if it is lower
    /// than the configured default, else the default.
    pub fn select_initial_profile(&mut self) -> Option<usize> {
        let default_bw = self.options.default_bandwidth_bps;
        let ceiling = match self.options.persisted_bandwidth_bps {
            Some(persisted) if persisted < default_bw => persisted,
            _ => default_bw,
        };
        let index = self.registry.profile_for_bandwidth(ceiling)?;
        info!(index, ceiling_bps = ceiling, "initial profile selected");
        self.current_profile = index;
        Some(index)
    }

    pub fn set_persisted_bandwidth(&mut self, bandwidth_bps: u64) {
        self.options.persisted_bandwidth_bps = Some(bandwidth_bps);
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        self.estimator.push_sample(sample);
    }

    #[must_use]
    pub fn estimate_bps(&self) -> Option<u64> {
        self.estimator.estimate_bps()
    }

    /// After a failed video fragment download: step down one profile when one
    /// is available. 404/410 on a single fragment is not worth a ramp-down
    /// (the fragment may simply have been culled); everything else is.
    pub fn check_for_ramp_down(&mut self, http_status: Option<u16>) -> Option<usize> {
        if matches!(http_status, Some(404) | Some(410)) {
            return None;
        }
        let lower = self.registry.lower_profile(self.current_profile)?;
        info!(
            from = self.current_profile,
            to = lower,
            status = ?http_status,
            "ramping down after fragment failure"
        );
        self.current_profile = lower;
        self.last_switch_at = Some(Instant::now());
        Some(lower)
    }

    /// After a successful fetch cycle: move to the best profile the current
    /// throughput estimate sustains, honoring the safety factor and the
    /// minimum switch interval for up-switches.
    pub fn check_for_profile_change(&mut self) -> Option<usize> {
        let estimate = self.estimator.estimate_bps()?;
        let usable = (estimate as f64 / self.options.throughput_safety_factor) as u64;
        let target = self.registry.profile_for_bandwidth(usable)?;
        if target == self.current_profile {
            return None;
        }

        let current_bw = self.registry.get(self.current_profile)?.bandwidth_bps;
        let target_bw = self.registry.get(target)?.bandwidth_bps;
        if target_bw > current_bw {
            if let Some(at) = self.last_switch_at {
                if at.elapsed() < self.options.min_switch_interval {
                    return None;
                }
            }
        }

        debug!(
            from = self.current_profile,
            to = target,
            estimate_bps = estimate,
            "profile change"
        );
        self.current_profile = target;
        self.last_switch_at = Some(Instant::now());
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::types::ProfileEntry;

    fn controller(persisted: Option<u64>, default_bw: u64) -> AbrController {
        let mut c = AbrController::new(AbrOptions {
            default_bandwidth_bps: default_bw,
            persisted_bandwidth_bps: persisted,
            ..AbrOptions::default()
        });
        for (bw, w, h) in [(500_000, 640, 360), (1_000_000, 960, 540), (2_000_000, 1280, 720)] {
            c.registry_mut().add_profile(ProfileEntry {
                is_iframe: false,
                bandwidth_bps: bw,
                width: w,
                height: h,
            });
        }
        c
    }

    #[rstest]
    #[case(None, 1_500_000, 1)] // default ceiling picks the 1 Mbps profile
    #[case(Some(600_000), 1_500_000, 0)] // persisted lower than default wins
    #[case(Some(3_000_000), 1_500_000, 1)] // persisted above default ignored
    fn initial_profile_selection(
        #[case] persisted: Option<u64>,
        #[case] default_bw: u64,
        #[case] expected: usize,
    ) {
        let mut c = controller(persisted, default_bw);
        assert_eq!(c.select_initial_profile(), Some(expected));
    }

    #[test]
    fn ramp_down_steps_one_profile() {
        let mut c = controller(None, 10_000_000);
        c.select_initial_profile();
        assert_eq!(c.current_profile(), 2);
        assert_eq!(c.check_for_ramp_down(Some(500)), Some(1));
        assert_eq!(c.check_for_ramp_down(None), Some(0));
        assert_eq!(c.check_for_ramp_down(Some(500)), None);
    }

    #[test]
    fn ramp_down_ignores_missing_fragment() {
        let mut c = controller(None, 10_000_000);
        c.select_initial_profile();
        assert_eq!(c.check_for_ramp_down(Some(404)), None);
        assert_eq!(c.current_profile(), 2);
    }

    #[test]
    fn profile_change_follows_throughput() {
        let mut c = controller(None, 10_000_000);
        c.select_initial_profile();
        // Sustained ~800 kbps: 100 kB per second-long download.
        for _ in 0..8 {
            c.push_sample(ThroughputSample {
                bytes: 100_000,
                duration: Duration::from_secs(1),
                at: Instant::now(),
            });
        }
        let target = c.check_for_profile_change().expect("switch expected");
        assert_eq!(target, 0);
    }
}
