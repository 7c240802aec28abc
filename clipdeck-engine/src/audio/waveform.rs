//! Amplitude envelope for visual display

use super::types::SampleBuffer;

/// Peak envelope of `buffer` over `points` equal-width buckets
///
/// Each value is the largest absolute sample across all channels in its
/// bucket. Buffers shorter than `points` frames yield one value per frame.
pub fn extract_peaks(buffer: &SampleBuffer, points: usize) -> Vec<f32> {
    let frames = buffer.len();
    let points = points.min(frames);
    if points == 0 {
        return Vec::new();
    }

    let mut peaks = Vec::with_capacity(points);
    for bucket in 0..points {
        let start = bucket * frames / points;
        let end = ((bucket + 1) * frames / points).max(start + 1);
        let peak = buffer
            .channels()
            .iter()
            .flat_map(|c| c[start..end].iter())
            .fold(0.0f32, |m, s| m.max(s.abs()));
        peaks.push(peak.min(1.0));
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peaks_per_bucket() {
        let buffer = SampleBuffer::mono(vec![0.1, -0.9, 0.3, 0.2, -0.4, 0.05], 6).unwrap();
        assert_eq!(extract_peaks(&buffer, 3), vec![0.9, 0.3, 0.4]);
    }

    #[test]
    fn test_short_buffer_yields_one_point_per_frame() {
        let buffer = SampleBuffer::mono(vec![0.5, -0.25], 8000).unwrap();
        assert_eq!(extract_peaks(&buffer, 2000), vec![0.5, 0.25]);
    }

    #[test]
    fn test_takes_loudest_channel() {
        let buffer = SampleBuffer::new(vec![vec![0.1, 0.1], vec![-0.8, 0.2]], 8000).unwrap();
        assert_eq!(extract_peaks(&buffer, 1), vec![0.8]);
    }
}
