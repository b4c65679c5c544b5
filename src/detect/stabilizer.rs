use std::collections::{HashMap, VecDeque};

use crate::{RawClassification, SpotDetection, SpotId};

/// Default number of recent verdicts kept per spot.
pub const DEFAULT_WINDOW: usize = 5;

/// Per-spot sliding-window majority vote.
///
/// History is keyed by `(generation, spot_id)`: switching to another generation
/// drops every window, so verdicts never leak across reconfigurations.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    capacity: usize,
    generation: u64,
    windows: HashMap<SpotId, VecDeque<bool>>,
}

impl Stabilizer {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self::for_generation(capacity, 0)
    }

    pub fn for_generation(capacity: usize, generation: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            generation,
            windows: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Switch to `generation`, clearing all history if it differs from the current one.
    pub fn reset_generation(&mut self, generation: u64) {
        if generation != self.generation {
            self.windows.clear();
            self.generation = generation;
        }
    }

    /// Append a raw verdict, evicting the oldest once the window is full.
    pub fn update(&mut self, spot_id: SpotId, occupied: bool) {
        let window = self
            .windows
            .entry(spot_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        window.push_back(occupied);
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    /// Strict majority over the current window; `None` if the spot was never observed.
    ///
    /// A tie in an even-length window resolves to unoccupied.
    pub fn stable(&self, spot_id: SpotId) -> Option<bool> {
        let window = self.windows.get(&spot_id)?;
        if window.is_empty() {
            return None;
        }
        let occupied = window.iter().filter(|v| **v).count();
        Some(occupied * 2 > window.len())
    }

    /// Record a verdict and return the stabilized one.
    pub fn observe(&mut self, spot_id: SpotId, occupied: bool) -> bool {
        self.update(spot_id, occupied);
        self.stable(spot_id).unwrap_or(occupied)
    }

    /// Feed one frame's raw classifications and return their stabilized detections,
    /// in input order. Confidence is carried over from the raw verdict.
    pub fn detections(&mut self, raw: &[RawClassification]) -> Vec<SpotDetection> {
        raw.iter()
            .map(|c| SpotDetection {
                spot_id: c.spot_id,
                is_occupied: self.observe(c.spot_id, c.occupied),
                confidence: c.confidence,
                license_plate: None,
            })
            .collect()
    }

    pub fn window_len(&self, spot_id: SpotId) -> usize {
        self.windows.get(&spot_id).map_or(0, VecDeque::len)
    }
}

impl Default for Stabilizer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(stabilizer: &mut Stabilizer, spot: SpotId, seq: &[bool]) {
        for v in seq {
            stabilizer.update(spot, *v);
        }
    }

    #[test]
    fn unseen_spot_has_no_verdict() {
        let s = Stabilizer::default();
        assert_eq!(s.stable(1), None);
    }

    #[test]
    fn three_of_five_is_occupied() {
        let mut s = Stabilizer::new(5);
        feed(&mut s, 1, &[true, true, true, false, false]);
        assert_eq!(s.stable(1), Some(true));
    }

    #[test]
    fn even_window_tie_is_vacant() {
        let mut s = Stabilizer::new(4);
        feed(&mut s, 1, &[true, false, true, false]);
        assert_eq!(s.window_len(1), 4);
        assert_eq!(s.stable(1), Some(false));

        let mut partial = Stabilizer::new(5);
        feed(&mut partial, 9, &[true, false]);
        assert_eq!(partial.stable(9), Some(false));
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut s = Stabilizer::new(3);
        feed(&mut s, 1, &[true, true, true]);
        assert_eq!(s.stable(1), Some(true));
        feed(&mut s, 1, &[false, false]);
        assert_eq!(s.window_len(1), 3);
        assert_eq!(s.stable(1), Some(false));
    }

    #[test]
    fn matches_majority_over_recent_history() {
        let history = [
            true, false, false, true, true, false, true, true, false, false, false, true,
        ];
        for capacity in 1..=6 {
            let mut s = Stabilizer::new(capacity);
            for (i, v) in history.iter().enumerate() {
                s.update(7, *v);
                let start = (i + 1).saturating_sub(capacity);
                let window = &history[start..=i];
                let occupied = window.iter().filter(|b| **b).count();
                assert_eq!(s.stable(7), Some(occupied * 2 > window.len()));
            }
        }
    }

    #[test]
    fn spots_are_independent() {
        let mut s = Stabilizer::new(3);
        feed(&mut s, 1, &[true, true]);
        feed(&mut s, 2, &[false]);
        assert_eq!(s.stable(1), Some(true));
        assert_eq!(s.stable(2), Some(false));
    }

    #[test]
    fn new_generation_drops_history() {
        let mut s = Stabilizer::for_generation(5, 1);
        feed(&mut s, 1, &[true, true, true]);
        s.reset_generation(1);
        assert_eq!(s.stable(1), Some(true));

        s.reset_generation(2);
        assert_eq!(s.generation(), 2);
        assert_eq!(s.stable(1), None);
        assert!(!s.observe(1, false));
    }

    #[test]
    fn detections_follow_the_majority() {
        use chrono::Utc;

        let raw = |occupied| RawClassification {
            spot_id: 3,
            occupied,
            confidence: 0.75,
            pixel_count: 0,
            observed_at: Utc::now(),
        };
        let mut s = Stabilizer::new(3);
        assert!(s.detections(&[raw(true)])[0].is_occupied);
        assert!(!s.detections(&[raw(false)])[0].is_occupied);
        let out = s.detections(&[raw(false)]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_occupied);
        assert_eq!(out[0].confidence, 0.75);
        assert_eq!(out[0].license_plate, None);
    }

    #[test]
    fn zero_capacity_acts_as_single_entry() {
        let mut s = Stabilizer::new(0);
        assert_eq!(s.capacity(), 1);
        assert!(s.observe(4, true));
        assert!(!s.observe(4, false));
    }
}
