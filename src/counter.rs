//! A byte counter that keeps a running per-second average, used to score how
//! fast a peer is serving us.

/// The number of rounds the average is smoothed over.
const AVG_WINDOW_SECS: u64 = 5;

/// Counts bytes and maintains an exponentially weighted moving average of the
/// per-second rate.
///
/// [`ThruputRate::tick`] must be called once a second; bytes recorded since
/// the previous tick are folded into the average with a weight of
/// 1/[`AVG_WINDOW_SECS`], so a silent peer decays towards zero rather than
/// keeping its historical rate forever.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputRate {
    /// All bytes ever recorded.
    total: u64,
    /// Bytes recorded since the last tick.
    round: u64,
    /// The smoothed per-second rate.
    avg: f64,
    /// The number of ticks seen so far, used to tell a fresh session from
    /// a genuinely slow one.
    rounds: u64,
}

impl ThruputRate {
    pub fn record(&mut self, bytes: u32) {
        self.round += u64::from(bytes);
        self.total += u64::from(bytes);
    }

    /// Folds the current round into the average. Call once a second.
    pub fn tick(&mut self) {
        let weight = 1.0 / AVG_WINDOW_SECS as f64;
        self.avg = self.avg * (1.0 - weight) + self.round as f64 * weight;
        self.round = 0;
        self.rounds += 1;
    }

    /// Knocks the average down. Applied when a request times out so that
    /// a peer that accepts requests but never serves them loses its score.
    pub fn penalize(&mut self) {
        self.avg /= 2.0;
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// True once enough rounds have passed for the average to mean anything.
    pub fn is_warmed_up(&self) -> bool {
        self.rounds >= 2 * AVG_WINDOW_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_converges_to_steady_rate() {
        let mut rate = ThruputRate::default();
        for _ in 0..50 {
            rate.record(10_000);
            rate.tick();
        }
        assert!((rate.avg() - 10_000.0).abs() < 1.0);
        assert_eq!(rate.total(), 50 * 10_000);
        assert!(rate.is_warmed_up());
    }

    #[test]
    fn test_avg_decays_when_idle() {
        let mut rate = ThruputRate::default();
        rate.record(100_000);
        rate.tick();
        let initial = rate.avg();
        for _ in 0..20 {
            rate.tick();
        }
        assert!(rate.avg() < initial / 10.0);
    }

    #[test]
    fn test_penalize_halves_avg() {
        let mut rate = ThruputRate::default();
        rate.record(50_000);
        rate.tick();
        let before = rate.avg();
        rate.penalize();
        assert!((rate.avg() - before / 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_not_warmed_up_initially() {
        let mut rate = ThruputRate::default();
        assert!(!rate.is_warmed_up());
        rate.tick();
        assert!(!rate.is_warmed_up());
    }
}
