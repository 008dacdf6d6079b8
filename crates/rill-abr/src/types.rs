use std::time::{Duration, Instant};

/// One selectable variant, as registered from the master manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileEntry {
    pub is_iframe: bool,
    pub bandwidth_bps: u64,
    pub width: u32,
    pub height: u32,
}

/// Ordered registry of variants. Indices are stable and match the master
/// manifest's profile order.
#[derive(Clone, Debug, Default)]
pub struct ProfileRegistry {
    profiles: Vec<ProfileEntry>,
}

impl ProfileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
    }

    pub fn add_profile(&mut self, profile: ProfileEntry) -> usize {
        self.profiles.push(profile);
        self.profiles.len() - 1
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ProfileEntry> {
        self.profiles.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Playable (non-iframe) profile indices in bandwidth order.
    #[must_use]
    pub fn playable_by_bandwidth(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.profiles.len())
            .filter(|&i| !self.profiles[i].is_iframe)
            .collect();
        idx.sort_by_key(|&i| self.profiles[i].bandwidth_bps);
        idx
    }

    /// Iframe profile with the lowest bandwidth, for trick-play.
    #[must_use]
    pub fn iframe_profile(&self) -> Option<usize> {
        (0..self.profiles.len())
            .filter(|&i| self.profiles[i].is_iframe)
            .min_by_key(|&i| self.profiles[i].bandwidth_bps)
    }

    /// Highest playable profile whose bandwidth does not exceed `ceiling_bps`,
    /// falling back to the lowest playable profile.
    #[must_use]
    pub fn profile_for_bandwidth(&self, ceiling_bps: u64) -> Option<usize> {
        let ordered = self.playable_by_bandwidth();
        ordered
            .iter()
            .rev()
            .find(|&&i| self.profiles[i].bandwidth_bps <= ceiling_bps)
            .or_else(|| ordered.first())
            .copied()
    }

    /// Next lower playable profile relative to `current`, if any.
    #[must_use]
    pub fn lower_profile(&self, current: usize) -> Option<usize> {
        let current_bw = self.profiles.get(current)?.bandwidth_bps;
        let ordered = self.playable_by_bandwidth();
        ordered
            .iter()
            .rev()
            .find(|&&i| self.profiles[i].bandwidth_bps < current_bw)
            .copied()
    }

    /// Bandwidths of playable profiles, manifest order.
    #[must_use]
    pub fn playable_bandwidths(&self) -> Vec<u64> {
        self.profiles
            .iter()
            .filter(|p| !p.is_iframe)
            .map(|p| p.bandwidth_bps)
            .collect()
    }
}

/// One throughput observation from a completed download.
#[derive(Clone, Copy, Debug)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration: Duration,
    pub at: Instant,
}

/// Controller tuning knobs.
#[derive(Clone, Debug)]
pub struct AbrOptions {
    /// Bandwidth assumed at startup when nothing is persisted.
    pub default_bandwidth_bps: u64,
    /// Bandwidth remembered from a previous session, if any.
    pub persisted_bandwidth_bps: Option<u64>,
    /// Estimated throughput is divided by this factor before comparison.
    pub throughput_safety_factor: f64,
    /// Minimum interval between up-switches.
    pub min_switch_interval: Duration,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            default_bandwidth_bps: 2_500_000,
            persisted_bandwidth_bps: None,
            throughput_safety_factor: 1.3,
            min_switch_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn registry() -> ProfileRegistry {
        let mut r = ProfileRegistry::new();
        r.add_profile(ProfileEntry {
            is_iframe: false,
            bandwidth_bps: 2_000_000,
            width: 1280,
            height: 720,
        });
        r.add_profile(ProfileEntry {
            is_iframe: false,
            bandwidth_bps: 500_000,
            width: 640,
            height: 360,
        });
        r.add_profile(ProfileEntry {
            is_iframe: true,
            bandwidth_bps: 300_000,
            width: 640,
            height: 360,
        });
        r.add_profile(ProfileEntry {
            is_iframe: false,
            bandwidth_bps: 1_000_000,
            width: 960,
            height: 540,
        });
        r
    }

    #[test]
    fn playable_ordering_skips_iframe() {
        let r = registry();
        assert_eq!(r.playable_by_bandwidth(), vec![1, 3, 0]);
    }

    #[test]
    fn iframe_lookup() {
        let r = registry();
        assert_eq!(r.iframe_profile(), Some(2));
    }

    #[rstest]
    #[case(400_000, Some(1))] // below everything -> lowest
    #[case(600_000, Some(1))]
    #[case(1_500_000, Some(3))]
    #[case(10_000_000, Some(0))]
    fn bandwidth_ceiling(#[case] ceiling: u64, #[case] expected: Option<usize>) {
        assert_eq!(registry().profile_for_bandwidth(ceiling), expected);
    }

    #[test]
    fn lower_profile_walks_down() {
        let r = registry();
        assert_eq!(r.lower_profile(0), Some(3));
        assert_eq!(r.lower_profile(3), Some(1));
        assert_eq!(r.lower_profile(1), None);
    }
}
