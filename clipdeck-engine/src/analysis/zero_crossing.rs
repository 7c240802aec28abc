//! Zero-crossing detection and cut-point optimization
//!
//! Snaps sample-region boundaries to nearby sign changes so that starting
//! or stopping playback there does not produce an audible click.
//!
//! **Detection rules** (applied to the mono mix):
//! - A crossing is a sign change between consecutive samples; the sample
//!   closer to zero is reported
//! - Crossings closer than `min_distance` samples to the previous accepted
//!   crossing are skipped
//! - Local RMS must reach `amplitude_threshold` (crossings in near-silence
//!   are not perceptually significant)
//! - Sample-to-sample slope must reach `slope_threshold`
//!
//! Crossing lists are cached per [`BufferIdentity`].

use crate::audio::SampleBuffer;
use crate::error::ValidationError;
use clipdeck_common::config::ZeroCrossingConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A detected low-click cut point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZeroCrossing {
    pub sample_index: usize,
    pub time_seconds: f64,
    /// 0 = marginal, 1 = ideal cut point
    pub quality_score: f32,
    /// Sample value at `sample_index`
    pub amplitude: f32,
    /// Signed difference across the crossing
    pub slope: f32,
}

/// Content-derived cache key for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferIdentity {
    pub length: usize,
    pub sample_rate: u32,
    pub channel_count: usize,
    pub checksum: u64,
}

impl BufferIdentity {
    /// FNV-1a over every sample's bit pattern
    pub fn of(buffer: &SampleBuffer) -> Self {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for channel in buffer.channels() {
            for sample in channel {
                for byte in sample.to_bits().to_le_bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(FNV_PRIME);
                }
            }
        }

        Self {
            length: buffer.len(),
            sample_rate: buffer.sample_rate(),
            channel_count: buffer.channel_count(),
            checksum: hash,
        }
    }
}

/// Label for how much a cut-point optimization helped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutQuality {
    /// Average improvement above 0.7
    Excellent,
    /// Average improvement above 0.4
    Good,
    /// Some boundary moved
    Improved,
    /// Both boundaries kept
    Original,
}

impl CutQuality {
    fn from_improvement(average: f32, changed: bool) -> Self {
        if !changed {
            CutQuality::Original
        } else if average > 0.7 {
            CutQuality::Excellent
        } else if average > 0.4 {
            CutQuality::Good
        } else {
            CutQuality::Improved
        }
    }
}

/// Result of [`ZeroCrossingDetector::optimize_cut_points`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CutPoints {
    pub start: f64,
    pub end: f64,
    pub quality: CutQuality,
    /// Mean click-risk reduction over both boundaries (unmoved count as 0)
    pub average_improvement: f32,
}

struct CrossingCache {
    capacity: usize,
    entries: HashMap<BufferIdentity, Arc<Vec<ZeroCrossing>>>,
    /// Least recently used at the front
    order: VecDeque<BufferIdentity>,
}

impl CrossingCache {
    fn get(&mut self, identity: &BufferIdentity) -> Option<Arc<Vec<ZeroCrossing>>> {
        let found = self.entries.get(identity).cloned()?;
        if let Some(pos) = self.order.iter().position(|k| k == identity) {
            self.order.remove(pos);
        }
        self.order.push_back(*identity);
        Some(found)
    }

    fn insert(&mut self, identity: BufferIdentity, crossings: Arc<Vec<ZeroCrossing>>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(identity, crossings).is_none() {
            self.order.push_back(identity);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

/// Finds and caches zero crossings
pub struct ZeroCrossingDetector {
    config: ZeroCrossingConfig,
    cache: Mutex<CrossingCache>,
}

impl ZeroCrossingDetector {
    pub fn new(config: ZeroCrossingConfig) -> Self {
        let capacity = config.result_cache_capacity;
        Self {
            config,
            cache: Mutex::new(CrossingCache {
                capacity,
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &ZeroCrossingConfig {
        &self.config
    }

    /// All accepted crossings, ordered by sample index
    pub fn find_zero_crossings(&self, buffer: &SampleBuffer) -> Arc<Vec<ZeroCrossing>> {
        let identity = BufferIdentity::of(buffer);
        if let Some(hit) = self.lock_cache().get(&identity) {
            return hit;
        }

        let crossings = Arc::new(detect(
            &buffer.mono_mix(),
            buffer.sample_rate(),
            &self.config,
        ));
        debug!(
            "Detected {} zero crossings over {} frames",
            crossings.len(),
            buffer.len()
        );
        self.lock_cache().insert(identity, Arc::clone(&crossings));
        crossings
    }

    /// Crossing closest to `target_time`, if one lies within `tolerance` seconds
    pub fn find_nearest(
        &self,
        buffer: &SampleBuffer,
        target_time: f64,
        tolerance: f64,
    ) -> Option<ZeroCrossing> {
        if !target_time.is_finite() || !(tolerance >= 0.0) {
            return None;
        }
        let crossings = self.find_zero_crossings(buffer);
        nearest_in(&crossings, target_time, tolerance)
    }

    /// Move each boundary to a nearby crossing when that reduces click risk
    /// by more than `min_improvement`
    ///
    /// Boundaries already on a crossing stay put, so a second call returns
    /// the same times.
    ///
    /// # Errors
    /// - `start < 0`, `end <= start`, or `end` past the buffer duration
    pub fn optimize_cut_points(
        &self,
        buffer: &SampleBuffer,
        start: f64,
        end: f64,
    ) -> Result<CutPoints, ValidationError> {
        validate_region(buffer, start, end)?;

        let crossings = self.find_zero_crossings(buffer);
        let signal = buffer.mono_mix();
        let window_seconds = self.config.search_window_ms / 1000.0;

        let (new_start, start_gain) =
            self.snap_boundary(buffer, &signal, &crossings, start, window_seconds);
        let (new_end, end_gain) =
            self.snap_boundary(buffer, &signal, &crossings, end, window_seconds);

        // Never collapse or invert the region
        let (new_start, new_end, start_gain, end_gain) = if new_end > new_start {
            (new_start, new_end, start_gain, end_gain)
        } else {
            (start, end, 0.0, 0.0)
        };

        let changed = start_gain > 0.0 || end_gain > 0.0;
        let average_improvement = (start_gain + end_gain) / 2.0;

        Ok(CutPoints {
            start: new_start,
            end: new_end,
            quality: CutQuality::from_improvement(average_improvement, changed),
            average_improvement,
        })
    }

    /// Returns the (possibly moved) time and the improvement applied
    fn snap_boundary(
        &self,
        buffer: &SampleBuffer,
        signal: &[f32],
        crossings: &[ZeroCrossing],
        time: f64,
        window_seconds: f64,
    ) -> (f64, f32) {
        let original_index = buffer.frame_at(time);
        let Some(candidate) = nearest_in(crossings, time, window_seconds) else {
            return (time, 0.0);
        };
        if candidate.sample_index == original_index {
            return (time, 0.0);
        }

        let window = self.config.rms_window.max(1);
        let improvement = click_risk(signal, original_index, window)
            - click_risk(signal, candidate.sample_index, window);

        if improvement > self.config.min_improvement {
            (candidate.time_seconds, improvement)
        } else {
            (time, 0.0)
        }
    }

    /// Buffers with cached crossing lists
    pub fn cached_buffers(&self) -> usize {
        self.lock_cache().entries.len()
    }

    pub fn clear_cache(&self) {
        let mut cache = self.lock_cache();
        cache.entries.clear();
        cache.order.clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, CrossingCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_region(buffer: &SampleBuffer, start: f64, end: f64) -> Result<(), ValidationError> {
    if !start.is_finite() || !end.is_finite() {
        return Err(ValidationError::new("cut points must be finite"));
    }
    if start < 0.0 {
        return Err(ValidationError::new(format!("start {} is negative", start)));
    }
    if end <= start {
        return Err(ValidationError::new(format!(
            "end {} must be after start {}",
            end, start
        )));
    }
    if end > buffer.duration() {
        return Err(ValidationError::new(format!(
            "end {} exceeds buffer duration {}",
            end,
            buffer.duration()
        )));
    }
    Ok(())
}

fn nearest_in(crossings: &[ZeroCrossing], target: f64, tolerance: f64) -> Option<ZeroCrossing> {
    let split = crossings.partition_point(|c| c.time_seconds < target);
    let after = crossings.get(split);
    let before = split.checked_sub(1).and_then(|i| crossings.get(i));

    let best = match (before, after) {
        (Some(b), Some(a)) => {
            if (target - b.time_seconds) <= (a.time_seconds - target) {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    if (best.time_seconds - target).abs() <= tolerance {
        Some(*best)
    } else {
        None
    }
}

/// Relative discontinuity of cutting at `index`: |sample| / local peak
fn click_risk(signal: &[f32], index: usize, window: usize) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let index = index.min(signal.len() - 1);
    let lo = index.saturating_sub(window);
    let hi = (index + window + 1).min(signal.len());
    let peak = signal[lo..hi].iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak <= f32::EPSILON {
        return 0.0;
    }
    (signal[index].abs() / peak).min(1.0)
}

fn detect(signal: &[f32], sample_rate: u32, config: &ZeroCrossingConfig) -> Vec<ZeroCrossing> {
    let n = signal.len();
    if n < 2 {
        return Vec::new();
    }

    // Prefix sums of squares for O(1) windowed RMS
    let mut energy = Vec::with_capacity(n + 1);
    energy.push(0.0f64);
    for s in signal {
        let last = energy[energy.len() - 1];
        energy.push(last + (*s as f64) * (*s as f64));
    }
    let window = config.rms_window.max(1);
    let local_rms = |center: usize| -> f32 {
        let lo = center.saturating_sub(window);
        let hi = (center + window + 1).min(n);
        ((energy[hi] - energy[lo]) / (hi - lo) as f64).max(0.0).sqrt() as f32
    };

    let mut crossings = Vec::new();
    let mut last_accepted: Option<usize> = None;

    for i in 1..n {
        let prev = signal[i - 1];
        let cur = signal[i];
        let crosses = (prev < 0.0 && cur >= 0.0) || (prev > 0.0 && cur <= 0.0);
        if !crosses {
            continue;
        }

        let index = if prev.abs() <= cur.abs() { i - 1 } else { i };
        if let Some(last) = last_accepted {
            if index.saturating_sub(last) < config.min_distance {
                continue;
            }
        }

        let rms = local_rms(index);
        if rms < config.amplitude_threshold {
            continue;
        }
        let slope = cur - prev;
        if slope.abs() < config.slope_threshold {
            continue;
        }

        crossings.push(ZeroCrossing {
            sample_index: index,
            time_seconds: index as f64 / sample_rate as f64,
            quality_score: crossing_quality(signal[index], slope, rms),
            amplitude: signal[index],
            slope,
        });
        last_accepted = Some(index);
    }

    crossings
}

/// Near-zero amplitude dominates; a gentle slope relative to the local
/// level scores higher than a steep one
fn crossing_quality(amplitude: f32, slope: f32, rms: f32) -> f32 {
    if rms <= f32::EPSILON {
        return 0.0;
    }
    let proximity = 1.0 - (amplitude.abs() / rms).min(1.0);
    let gentleness = 1.0 - (slope.abs() / (2.0 * rms)).min(1.0);
    (0.7 * proximity + 0.3 * gentleness).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sample_rate: u32, seconds: f32, amplitude: f32) -> SampleBuffer {
        let frames = (sample_rate as f32 * seconds) as usize;
        let samples = (0..frames)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32 + 0.3).sin() * amplitude)
            .collect();
        SampleBuffer::mono(samples, sample_rate).unwrap()
    }

    fn detector() -> ZeroCrossingDetector {
        ZeroCrossingDetector::new(ZeroCrossingConfig::default())
    }

    #[test]
    fn test_finds_two_crossings_per_period() {
        // 100 Hz at 8 kHz: 80-sample period, crossings 40 apart
        let buffer = sine(100.0, 8000, 1.0, 0.8);
        let crossings = detector().find_zero_crossings(&buffer);
        assert!(
            (198..=201).contains(&crossings.len()),
            "found {}",
            crossings.len()
        );
        for pair in crossings.windows(2) {
            assert!(pair[1].sample_index > pair[0].sample_index);
            assert!(pair[1].sample_index - pair[0].sample_index >= 32);
        }
        for c in crossings.iter() {
            assert!((0.0..=1.0).contains(&c.quality_score));
            assert!(c.amplitude.abs() < 0.05);
        }
    }

    #[test]
    fn test_silence_has_no_crossings() {
        let buffer = sine(100.0, 8000, 0.5, 0.001);
        assert!(detector().find_zero_crossings(&buffer).is_empty());
    }

    #[test]
    fn test_min_distance_suppresses_close_crossings() {
        // 1 kHz at 8 kHz: crossings every 4 samples, min distance 32
        let buffer = sine(1000.0, 8000, 0.1, 0.8);
        let crossings = detector().find_zero_crossings(&buffer);
        for pair in crossings.windows(2) {
            assert!(pair[1].sample_index - pair[0].sample_index >= 32);
        }
    }

    #[test]
    fn test_find_nearest_respects_tolerance() {
        let buffer = sine(100.0, 8000, 1.0, 0.8);
        let det = detector();

        let hit = det.find_nearest(&buffer, 0.5, 0.01).unwrap();
        assert!((hit.time_seconds - 0.5).abs() <= 0.01);

        // Crossings are 5 ms apart, so a 0.1 ms window can miss
        let tight = det.find_nearest(&buffer, 0.5025, 0.0001);
        if let Some(c) = tight {
            assert!((c.time_seconds - 0.5025).abs() <= 0.0001);
        }
    }

    #[test]
    fn test_results_are_cached_per_buffer() {
        let det = detector();
        let a = sine(100.0, 8000, 0.5, 0.8);
        let b = sine(150.0, 8000, 0.5, 0.8);

        let first = det.find_zero_crossings(&a);
        let again = det.find_zero_crossings(&a);
        assert!(Arc::ptr_eq(&first, &again));

        det.find_zero_crossings(&b);
        assert_eq!(det.cached_buffers(), 2);
    }

    #[test]
    fn test_cache_capacity_is_bounded() {
        let config = ZeroCrossingConfig {
            result_cache_capacity: 2,
            ..Default::default()
        };
        let det = ZeroCrossingDetector::new(config);
        for freq in [100.0, 110.0, 120.0] {
            det.find_zero_crossings(&sine(freq, 8000, 0.1, 0.8));
        }
        assert_eq!(det.cached_buffers(), 2);
    }

    #[test]
    fn test_optimize_moves_boundary_off_a_peak() {
        let buffer = sine(100.0, 8000, 1.0, 0.8);
        let det = detector();
        // Phase 0.3 rad offset: a peak sits near 2.0 ms into each period
        let peak_time = (PI / 2.0 - 0.3) as f64 / (2.0 * std::f64::consts::PI * 100.0) + 0.2;

        let cut = det.optimize_cut_points(&buffer, peak_time, 0.8).unwrap();
        assert!(cut.start != peak_time);
        assert!((cut.start - peak_time).abs() <= 0.010);
        assert_ne!(cut.quality, CutQuality::Original);
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let buffer = sine(100.0, 8000, 1.0, 0.8);
        let det = detector();

        let once = det.optimize_cut_points(&buffer, 0.2123, 0.7777).unwrap();
        let twice = det.optimize_cut_points(&buffer, once.start, once.end).unwrap();
        assert_eq!(once.start, twice.start);
        assert_eq!(once.end, twice.end);
    }

    #[test]
    fn test_optimize_keeps_boundaries_in_silence() {
        let buffer = SampleBuffer::mono(vec![0.0; 8000], 8000).unwrap();
        let cut = detector().optimize_cut_points(&buffer, 0.25, 0.5).unwrap();
        assert_eq!(cut.start, 0.25);
        assert_eq!(cut.end, 0.5);
        assert_eq!(cut.quality, CutQuality::Original);
    }

    #[test]
    fn test_optimize_validates_range() {
        let buffer = sine(100.0, 8000, 1.0, 0.8);
        let det = detector();
        assert!(det.optimize_cut_points(&buffer, -0.1, 0.5).is_err());
        assert!(det.optimize_cut_points(&buffer, 0.5, 0.5).is_err());
        assert!(det.optimize_cut_points(&buffer, 0.5, 1.5).is_err());
    }

    #[test]
    fn test_identity_distinguishes_content() {
        let a = SampleBuffer::mono(vec![0.1, 0.2, 0.3], 8000).unwrap();
        let b = SampleBuffer::mono(vec![0.1, 0.2, 0.31], 8000).unwrap();
        assert_ne!(BufferIdentity::of(&a), BufferIdentity::of(&b));
        assert_eq!(BufferIdentity::of(&a), BufferIdentity::of(&a.clone()));
    }
}
