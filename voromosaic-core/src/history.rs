//! Bounded, bidirectional frame history for scrubbing.
//!
//! Stores site-position snapshots only (velocities and RNG state stay live
//! in the collection, which always reflects the head frame). The ring is
//! sized so total memory stays near 2 MiB regardless of site count.

use std::collections::VecDeque;

const MEMORY_BUDGET: usize = 2 * 1024 * 1024;
const BYTES_PER_SITE: usize = 20;
const MIN_FRAMES: usize = 50;

#[derive(Debug, Clone)]
struct Snapshot {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

/// Bounded FIFO of past site positions with a scrub cursor.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    frames: VecDeque<Snapshot>,
    cursor: usize,
    max_frames: usize,
}

impl HistoryRing {
    pub fn new(num_sites: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            cursor: 0,
            max_frames: max_frames_for(num_sites),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// True when the cursor sits on the most recent frame (or no frames).
    pub fn at_head(&self) -> bool {
        self.frames.is_empty() || self.cursor + 1 == self.frames.len()
    }

    /// Drop all frames and reseed with the current positions as the sole
    /// frame. Called on any mutation that invalidates stored positions
    /// (site-count change, image change, seed change).
    pub fn reset(&mut self, xs: &[f64], ys: &[f64]) {
        self.max_frames = max_frames_for(xs.len());
        self.frames.clear();
        self.frames.push_back(Snapshot {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
        });
        self.cursor = 0;
    }

    /// Append a new head frame (after a physics step). Trims the front
    /// when over budget and leaves the cursor on the new head.
    pub fn record(&mut self, xs: &[f64], ys: &[f64]) {
        self.frames.push_back(Snapshot {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
        });
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
        }
        self.cursor = self.frames.len() - 1;
    }

    /// Move the cursor one frame back; returns the positions to display.
    pub fn step_back(&mut self) -> Option<(&[f64], &[f64])> {
        if self.cursor == 0 || self.frames.is_empty() {
            return None;
        }
        self.cursor -= 1;
        let frame = &self.frames[self.cursor];
        Some((&frame.xs, &frame.ys))
    }

    /// Move the cursor one frame forward; `None` at the head (the caller
    /// advances physics instead).
    pub fn step_forward(&mut self) -> Option<(&[f64], &[f64])> {
        if self.cursor + 1 >= self.frames.len() {
            return None;
        }
        self.cursor += 1;
        let frame = &self.frames[self.cursor];
        Some((&frame.xs, &frame.ys))
    }
}

fn max_frames_for(num_sites: usize) -> usize {
    if num_sites == 0 {
        return MIN_FRAMES;
    }
    MIN_FRAMES.max(MEMORY_BUDGET / (BYTES_PER_SITE * num_sites))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        (vec![v; n], vec![v + 0.5; n])
    }

    #[test]
    fn sizing_follows_memory_budget() {
        // Few sites: capped by the 2 MiB budget formula's large quotient.
        assert_eq!(HistoryRing::new(100).max_frames(), 1048);
        // Many sites: floor of 50 frames.
        assert_eq!(HistoryRing::new(20_000).max_frames(), 50);
        assert_eq!(HistoryRing::new(0).max_frames(), 50);
    }

    #[test]
    fn scrub_back_and_forward() {
        let mut ring = HistoryRing::new(4);
        let (xs, ys) = frame(0.0, 4);
        ring.reset(&xs, &ys);
        for i in 1..=3 {
            let (xs, ys) = frame(i as f64, 4);
            ring.record(&xs, &ys);
        }
        assert!(ring.at_head());

        let (xs, _) = ring.step_back().unwrap();
        assert_eq!(xs[0], 2.0);
        let (xs, _) = ring.step_back().unwrap();
        assert_eq!(xs[0], 1.0);
        assert!(!ring.at_head());

        let (xs, _) = ring.step_forward().unwrap();
        assert_eq!(xs[0], 2.0);
        let (xs, _) = ring.step_forward().unwrap();
        assert_eq!(xs[0], 3.0);
        assert!(ring.at_head());
        assert!(ring.step_forward().is_none());
    }

    #[test]
    fn cannot_step_before_oldest_frame() {
        let mut ring = HistoryRing::new(2);
        let (xs, ys) = frame(0.0, 2);
        ring.reset(&xs, &ys);
        assert!(ring.step_back().is_none());
    }

    #[test]
    fn trims_oldest_when_full() {
        let mut ring = HistoryRing::new(20_000);
        let (xs, ys) = frame(0.0, 2);
        ring.reset(&xs, &ys);
        for i in 1..200 {
            let (xs, ys) = frame(i as f64, 2);
            ring.record(&xs, &ys);
        }
        assert_eq!(ring.len(), 50);

        // Walk all the way back: oldest retained frame is 150.
        let mut oldest = f64::NAN;
        while let Some((xs, _)) = ring.step_back() {
            oldest = xs[0];
        }
        assert_eq!(oldest, 150.0);
    }

    #[test]
    fn reset_clears_and_reseeds() {
        let mut ring = HistoryRing::new(2);
        let (xs, ys) = frame(0.0, 2);
        ring.reset(&xs, &ys);
        for i in 1..10 {
            let (xs, ys) = frame(i as f64, 2);
            ring.record(&xs, &ys);
        }
        let (xs, ys) = frame(99.0, 3);
        ring.reset(&xs, &ys);
        assert_eq!(ring.len(), 1);
        assert!(ring.at_head());
        assert!(ring.step_back().is_none());
    }
}
