//! Fixed-capacity sample window

use serde::Serialize;
use std::collections::VecDeque;

/// Direction of a windowed series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// Keeps the most recent `capacity` samples
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    /// Compares the mean of the newer half against the older half
    ///
    /// Differences within `tolerance` (relative to the older mean) are `Stable`.
    pub fn trend(&self, tolerance: f64) -> Trend {
        if self.samples.len() < 4 {
            return Trend::Stable;
        }
        let mid = self.samples.len() / 2;
        let older = self.samples.iter().take(mid).sum::<f64>() / mid as f64;
        let newer =
            self.samples.iter().skip(mid).sum::<f64>() / (self.samples.len() - mid) as f64;

        let scale = older.abs().max(f64::EPSILON);
        let change = (newer - older) / scale;
        if change > tolerance {
            Trend::Increasing
        } else if change < -tolerance {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut window = SlidingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.min(), Some(2.0));
        assert_eq!(window.max(), Some(4.0));
        assert_eq!(window.average(), Some(3.0));
    }

    #[test]
    fn test_empty_window() {
        let window = SlidingWindow::new(5);
        assert!(window.is_empty());
        assert_eq!(window.average(), None);
        assert_eq!(window.trend(0.05), Trend::Stable);
    }

    #[test]
    fn test_trend() {
        let mut rising = SlidingWindow::new(10);
        let mut flat = SlidingWindow::new(10);
        for i in 0..10 {
            rising.push(100.0 + i as f64 * 10.0);
            flat.push(100.0);
        }
        assert_eq!(rising.trend(0.05), Trend::Increasing);
        assert_eq!(flat.trend(0.05), Trend::Stable);
    }
}
