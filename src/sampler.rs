use std::cmp::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling priority attached to every event at creation. Values start in
/// `[0, 1)`; a sampled transaction gets a `+1` boost so it wins reservoir
/// eviction against unsampled peers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priority(f32);

impl Priority {
    /// Draw a fresh priority, rounded to six digits so heap comparisons are
    /// stable across serialization.
    pub(crate) fn random() -> Self {
        Priority((rand::rng().random::<f32>() * 1e6).floor() / 1e6)
    }

    pub(crate) fn boost(self) -> Self {
        Priority(self.0 + 1.0)
    }

    pub(crate) fn value(self) -> f32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn fixed(v: f32) -> Self {
        Priority(v)
    }
}

impl Eq for Priority {}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SamplerState {
    period_end: Instant,
    num_sampled: u64,
    num_seen: u64,
    priority_min: f32,
    rng: StdRng,
}

/// Per-application sampling decision over a target budget. The first period
/// accepts everything until the target is hit (`priority_min` starts at 0);
/// later periods raise the floor from the previous period's traffic and fall
/// back to an exponential-backoff draw once the target is exceeded.
///
/// Owns the only RNG shared across transactions, behind its own mutex.
pub(crate) struct AdaptiveSampler {
    target: u64,
    period: Duration,
    state: Mutex<SamplerState>,
}

impl AdaptiveSampler {
    pub(crate) fn new(target: u64, period: Duration, now: Instant) -> Self {
        AdaptiveSampler {
            target,
            period,
            state: Mutex::new(SamplerState {
                period_end: now + period,
                num_sampled: 0,
                num_seen: 0,
                priority_min: 0.0,
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    pub(crate) fn compute_sampled(&self, priority: Priority, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Advance periods; a fully skipped window resets the floor to zero
        // because it saw no traffic.
        while now > state.period_end {
            state.priority_min = 0.0;
            if state.num_seen > 0 {
                let ratio = self.target as f32 / state.num_seen as f32;
                state.priority_min = (1.0 - ratio).max(0.0);
            }
            state.num_sampled = 0;
            state.num_seen = 0;
            state.period_end += self.period;
        }

        state.num_seen += 1;

        if state.num_sampled > self.target {
            if self.backoff_sampled(&mut state) {
                state.num_sampled += 1;
                return true;
            }
            return false;
        }
        if priority.value() >= state.priority_min {
            state.num_sampled += 1;
            return true;
        }
        false
    }

    // Exponential backoff once the period's target is exceeded: acceptance
    // probability decays with num_sampled.
    fn backoff_sampled(&self, state: &mut SamplerState) -> bool {
        let target = self.target as f64;
        let ratio = target / state.num_sampled as f64;
        let threshold = target.powf(ratio) - target.sqrt();
        state.rng.random::<f64>() * (state.num_seen as f64) < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(target: u64, period_secs: u64, now: Instant) -> AdaptiveSampler {
        AdaptiveSampler::new(target, Duration::from_secs(period_secs), now)
    }

    #[test]
    fn first_period_accepts_everything_up_to_target() {
        let now = Instant::now();
        let s = sampler(10, 60, now);
        for _ in 0..5 {
            assert!(s.compute_sampled(Priority::fixed(0.0), now));
        }
    }

    #[test]
    fn priority_floor_rises_after_busy_period() {
        let now = Instant::now();
        let s = sampler(10, 60, now);
        for _ in 0..100 {
            s.compute_sampled(Priority::random(), now);
        }
        // Next period: floor becomes 1 - 10/100 = 0.9.
        let later = now + Duration::from_secs(61);
        assert!(!s.compute_sampled(Priority::fixed(0.5), later));
        assert!(s.compute_sampled(Priority::fixed(0.95), later));
    }

    #[test]
    fn skipped_windows_reset_the_floor() {
        let now = Instant::now();
        let s = sampler(10, 60, now);
        for _ in 0..100 {
            s.compute_sampled(Priority::random(), now);
        }
        // Two full periods of silence: the floor from the busy period is
        // recomputed from an empty window back to zero.
        let much_later = now + Duration::from_secs(185);
        assert!(s.compute_sampled(Priority::fixed(0.0), much_later));
    }

    #[test]
    fn sampled_count_stays_near_target_under_load() {
        let now = Instant::now();
        let s = sampler(10, 60, now);
        // Warm-up period establishes the floor.
        for _ in 0..200 {
            s.compute_sampled(Priority::random(), now);
        }
        let later = now + Duration::from_secs(61);
        let mut sampled = 0;
        for _ in 0..200 {
            if s.compute_sampled(Priority::random(), later) {
                sampled += 1;
            }
        }
        assert!(sampled >= 1, "sampler starved a busy period");
        assert!(sampled <= 40, "sampler accepted {sampled} of 200 with target 10");
    }

    #[test]
    fn priority_ordering_is_total() {
        assert!(Priority::fixed(0.2) < Priority::fixed(0.9));
        assert!(Priority::fixed(0.5).boost() > Priority::fixed(0.9));
    }
}
