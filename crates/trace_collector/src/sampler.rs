//! Reservoir sampling (Algorithm R).
//!
//! Bounds the number of traces kept per flush interval regardless of traffic:
//! every item offered since the last `clear` has the same `capacity / count`
//! probability of being in the sample at flush time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of the uniform draws behind replacement decisions.
///
/// Implemented for every [`rand::Rng`]; tests substitute a scripted source.
pub trait Draw {
    /// Returns a uniformly distributed integer in `[0, upper)`.
    fn draw_below(&mut self, upper: u64) -> u64;
}

impl<R: Rng> Draw for R {
    fn draw_below(&mut self, upper: u64) -> u64 {
        self.gen_range(0..upper)
    }
}

/// Fixed-capacity uniform random sample of an unbounded stream.
#[derive(Debug)]
pub struct ReservoirSampler<T, R = StdRng> {
    capacity: usize,
    /// Items offered since the last clear
    count: u64,
    slots: Vec<T>,
    rng: R,
}

impl<T> ReservoirSampler<T> {
    /// Creates a sampler seeded from system entropy.
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, StdRng::from_entropy())
    }
}

impl<T, R: Draw> ReservoirSampler<T, R> {
    /// Creates a sampler drawing from `rng`.
    pub fn with_rng(capacity: usize, rng: R) -> Self {
        Self {
            capacity,
            count: 0,
            slots: Vec::with_capacity(capacity),
            rng,
        }
    }

    /// Offers an item to the sample.
    ///
    /// The first `capacity` items are always kept. After that the n-th item
    /// replaces a random slot with probability `capacity / n`, otherwise it
    /// is dropped.
    pub fn offer(&mut self, item: T) {
        self.count += 1;

        if self.count <= self.capacity as u64 {
            self.slots.push(item);
            return;
        }

        let r = self.rng.draw_below(self.count);
        if r < self.capacity as u64 {
            self.slots[r as usize] = item;
        }
    }

    /// Iterates the sampled items in slot order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Takes the current sample, leaving the sampler cleared.
    pub fn drain(&mut self) -> Vec<T> {
        self.count = 0;
        std::mem::replace(&mut self.slots, Vec::with_capacity(self.capacity))
    }

    /// Discards the sample and resets the offered count.
    pub fn clear(&mut self) {
        self.count = 0;
        self.slots.clear();
    }

    /// Number of sampled items, `min(count, capacity)`.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Items offered since the last clear.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<'a, T, R> IntoIterator for &'a ReservoirSampler<T, R> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of draws.
    struct Scripted(VecDeque<u64>);

    impl Draw for Scripted {
        fn draw_below(&mut self, upper: u64) -> u64 {
            let r = self.0.pop_front().expect("script exhausted");
            assert!(r < upper, "scripted draw {} out of range {}", r, upper);
            r
        }
    }

    #[test]
    fn test_algorithm_r_by_hand() {
        // Draws for the 3rd, 4th and 5th offers
        let rng = Scripted(VecDeque::from([2, 0, 3]));
        let mut sampler = ReservoirSampler::with_rng(2, rng);

        for item in ["A", "B", "C", "D", "E"] {
            sampler.offer(item);
        }

        // C: r=2 >= 2, dropped. D: r=0, replaces A. E: r=3 >= 2, dropped.
        let sample: Vec<_> = sampler.iter().copied().collect();
        assert_eq!(sample, ["D", "B"]);
        assert_eq!(sampler.count(), 5);
        assert_eq!(sampler.len(), 2);
    }

    #[test]
    fn test_clear_resets() {
        let mut sampler = ReservoirSampler::new(3);
        assert!(sampler.is_empty());

        for i in 0..10 {
            sampler.offer(i);
        }
        assert!(!sampler.is_empty());
        assert_eq!(sampler.len(), 3);

        sampler.clear();
        assert!(sampler.is_empty());
        assert_eq!(sampler.len(), 0);
        assert_eq!(sampler.count(), 0);

        // Fills sequentially again after a clear
        sampler.offer(42);
        assert_eq!(sampler.iter().collect::<Vec<_>>(), [&42]);
    }

    #[test]
    fn test_drain_takes_sample() {
        let mut sampler = ReservoirSampler::new(4);
        sampler.offer('a');
        sampler.offer('b');

        assert_eq!(sampler.drain(), vec!['a', 'b']);
        assert!(sampler.is_empty());
    }

    #[test]
    fn test_roughly_uniform() {
        // 10 items into a 5-slot reservoir, many trials: each item should
        // survive about half the time.
        let mut hits = [0u32; 10];
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..4000 {
            let mut sampler = ReservoirSampler::with_rng(5, &mut rng);
            for i in 0..10usize {
                sampler.offer(i);
            }
            for &i in &sampler {
                hits[i] += 1;
            }
        }

        for (item, &count) in hits.iter().enumerate() {
            assert!(
                (1700..=2300).contains(&count),
                "item {} kept {} times out of 4000",
                item,
                count
            );
        }
    }

    proptest! {
        #[test]
        fn prop_len_is_min_of_count_and_capacity(
            capacity in 0usize..20,
            offers in 0usize..100,
            seed in any::<u64>(),
        ) {
            let mut sampler = ReservoirSampler::with_rng(capacity, StdRng::seed_from_u64(seed));
            for i in 0..offers {
                sampler.offer(i);
            }

            prop_assert_eq!(sampler.len(), offers.min(capacity));
            prop_assert_eq!(sampler.count(), offers as u64);

            // Every sampled item was offered, and none twice
            let mut seen: Vec<_> = sampler.iter().copied().collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), sampler.len());
            prop_assert!(seen.iter().all(|&i| i < offers));
        }
    }
}
