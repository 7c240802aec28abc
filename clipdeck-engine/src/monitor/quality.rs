//! Degradation level → quality settings table

use clipdeck_common::events::QualitySettings;

struct Row {
    resolution_scale: f32,
    antialiasing: bool,
    batch_size: u32,
    animations_enabled: bool,
    waveform_points: usize,
    cache_compression: bool,
    analysis_workers: usize,
}

const TABLE: [Row; 4] = [
    Row {
        resolution_scale: 1.0,
        antialiasing: true,
        batch_size: 100,
        animations_enabled: true,
        waveform_points: 2000,
        cache_compression: false,
        analysis_workers: 4,
    },
    Row {
        resolution_scale: 0.75,
        antialiasing: true,
        batch_size: 50,
        animations_enabled: true,
        waveform_points: 1000,
        cache_compression: false,
        analysis_workers: 2,
    },
    Row {
        resolution_scale: 0.5,
        antialiasing: false,
        batch_size: 25,
        animations_enabled: false,
        waveform_points: 500,
        cache_compression: true,
        analysis_workers: 1,
    },
    Row {
        resolution_scale: 0.25,
        antialiasing: false,
        batch_size: 10,
        animations_enabled: false,
        waveform_points: 250,
        cache_compression: true,
        analysis_workers: 1,
    },
];

/// Settings for `level` on a `0..=max_level` scale
///
/// The four table rows are spread across the configured range, so level 0
/// is always full quality and `max_level` is always the lowest row.
pub fn settings_for_level(level: u8, max_level: u8) -> QualitySettings {
    let level = level.min(max_level);
    let last = TABLE.len() - 1;
    let row = if max_level == 0 {
        0
    } else {
        ((level as f64 / max_level as f64) * last as f64).round() as usize
    };
    let row = &TABLE[row.min(last)];

    QualitySettings {
        level,
        resolution_scale: row.resolution_scale,
        antialiasing: row.antialiasing,
        batch_size: row.batch_size,
        animations_enabled: row.animations_enabled,
        waveform_points: row.waveform_points,
        cache_compression: row.cache_compression,
        analysis_workers: row.analysis_workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scale_maps_one_to_one() {
        assert_eq!(settings_for_level(0, 3).resolution_scale, 1.0);
        assert_eq!(settings_for_level(1, 3).batch_size, 50);
        assert!(settings_for_level(2, 3).cache_compression);
        assert_eq!(settings_for_level(3, 3).waveform_points, 250);
    }

    #[test]
    fn test_level_is_clamped() {
        let s = settings_for_level(9, 3);
        assert_eq!(s.level, 3);
        assert_eq!(s.resolution_scale, 0.25);
    }

    #[test]
    fn test_custom_max_level_spans_table() {
        assert_eq!(settings_for_level(0, 6).resolution_scale, 1.0);
        assert_eq!(settings_for_level(6, 6).resolution_scale, 0.25);
        assert_eq!(settings_for_level(3, 6).resolution_scale, 0.5);
        assert!(settings_for_level(0, 0).antialiasing);
    }

    #[test]
    fn test_quality_never_improves_with_level() {
        for level in 1..=3u8 {
            let prev = settings_for_level(level - 1, 3);
            let next = settings_for_level(level, 3);
            assert!(next.resolution_scale <= prev.resolution_scale);
            assert!(next.waveform_points <= prev.waveform_points);
        }
    }
}
