use crate::types::ThroughputSample;

/// EWMA throughput estimator over completed downloads.
///
/// Two half-lives are tracked and the pessimistic one wins, so short spikes
/// don't trigger up-switches while sustained drops are noticed quickly.
#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    fast: Ewma,
    slow: Ewma,
}

impl ThroughputEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    const MIN_CHUNK_BYTES: u64 = 16_000;
    const MIN_DURATION_MS: f64 = 0.5;

    #[must_use]
    pub fn new() -> Self {
        Self {
            fast: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
        }
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        if sample.bytes < Self::MIN_CHUNK_BYTES {
            return;
        }
        let dur_ms = (sample.duration.as_secs_f64() * 1000.0).max(Self::MIN_DURATION_MS);
        let bps = (sample.bytes as f64) * 8000.0 / dur_ms;
        let weight_secs = dur_ms / 1000.0;
        self.fast.add_sample(weight_secs, bps);
        self.slow.add_sample(weight_secs, bps);
    }

    #[must_use]
    pub fn estimate_bps(&self) -> Option<u64> {
        let est = self.fast.get_estimate().min(self.slow.get_estimate());
        (est > 0.0).then(|| est.round() as u64)
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn add_sample(&mut self, weight: f64, val: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last_estimate = val * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight.max(0.0);
    }

    fn get_estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.last_estimate / zero_factor.max(1e-6)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn sample(bytes: u64, ms: u64) -> ThroughputSample {
        ThroughputSample {
            bytes,
            duration: Duration::from_millis(ms),
            at: Instant::now(),
        }
    }

    #[test]
    fn no_estimate_without_samples() {
        assert_eq!(ThroughputEstimator::new().estimate_bps(), None);
    }

    #[test]
    fn small_chunks_ignored() {
        let mut est = ThroughputEstimator::new();
        est.push_sample(sample(1_000, 100));
        assert_eq!(est.estimate_bps(), None);
    }

    #[test]
    fn stable_samples_converge() {
        let mut est = ThroughputEstimator::new();
        for _ in 0..5 {
            // 1 MB over 1 s = 8 Mbps
            est.push_sample(sample(1_000_000, 1000));
        }
        let bps = est.estimate_bps().expect("estimate after samples");
        assert!(bps > 6_000_000, "estimate {bps} too low");
    }
}
