//! Anti-entropy helpers
//!
//! Devices periodically broadcast a digest of the tokens they hold. A device
//! that sees a digest suggesting it is missing something pulls the full
//! history from the store after a random delay. The check only detects
//! "I may be missing records", never "I have records the peer lacks"; a
//! false positive costs one extra read.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Summary of an assignment register
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Digest {
    pub count: usize,
    pub tokens: Vec<u32>,
}

impl Digest {
    /// Digest of a set of tokens
    pub fn of<I: IntoIterator<Item = u32>>(tokens: I) -> Self {
        let tokens: Vec<u32> = tokens.into_iter().collect();
        Self {
            count: tokens.len(),
            tokens,
        }
    }

    /// Whether a peer's digest suggests this one is missing records
    pub fn needs_sync(&self, peer: &Digest) -> bool {
        if peer.count != self.count {
            return true;
        }
        let mine: BTreeSet<u32> = self.tokens.iter().copied().collect();
        peer.tokens.iter().any(|t| !mine.contains(t))
    }
}

/// A random delay within a range, used to spread out follow-up work so a
/// group of devices does not answer in lockstep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jitter {
    range: RangeInclusive<Duration>,
}

impl Jitter {
    pub fn between(min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { range: min..=max }
    }

    /// No delay at all
    pub fn none() -> Self {
        Self::between(Duration::ZERO, Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        *self.range.start()
    }

    pub fn max(&self) -> Duration {
        *self.range.end()
    }

    /// Draw a delay
    pub fn sample(&self) -> Duration {
        let min = self.min().as_millis() as u64;
        let max = self.max().as_millis() as u64;
        if min == max {
            return self.min();
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_digests_need_nothing() {
        let mine = Digest::of([1, 2, 3]);
        let theirs = Digest::of([3, 2, 1]);
        assert!(!mine.needs_sync(&theirs));
    }

    #[test]
    fn test_count_mismatch_needs_sync() {
        let mine = Digest::of([1, 2, 3]);
        let theirs = Digest::of([1, 2, 3, 4]);
        assert!(mine.needs_sync(&theirs));
    }

    #[test]
    fn test_unknown_token_needs_sync() {
        let mine = Digest::of([1, 2, 3]);
        let theirs = Digest::of([1, 2, 9]);
        assert!(mine.needs_sync(&theirs));
    }

    #[test]
    fn test_extra_local_records_go_unnoticed_when_counts_match() {
        // Only a peer holding tokens we lack triggers a pull
        let mine = Digest::of([1, 2, 3, 4]);
        let theirs = Digest {
            count: 4,
            tokens: vec![1, 2, 3],
        };
        assert!(!mine.needs_sync(&theirs));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let jitter = Jitter::between(Duration::from_millis(500), Duration::from_millis(1500));
        for _ in 0..100 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
        assert_eq!(Jitter::none().sample(), Duration::ZERO);
    }

    #[test]
    fn test_jitter_swapped_bounds() {
        let jitter = Jitter::between(Duration::from_millis(600), Duration::from_millis(100));
        assert_eq!(jitter.min(), Duration::from_millis(100));
        assert_eq!(jitter.max(), Duration::from_millis(600));
    }
}
