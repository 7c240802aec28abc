//! Adaptive quality controller
//!
//! Frame hooks feed sliding windows of fps and render time. On each
//! evaluation the monitor computes a weighted score:
//!
//! ```text
//! score = 0.4·fps + 0.3·render + 0.2·memory + 0.1·cpu
//! ```
//!
//! and moves the degradation level one step: down when the score is above
//! the recovery threshold, up when below the degradation threshold.
//!
//! Hard floors are checked per frame independently of the level machine.
//! When fps, render time and memory are all breached at once the monitor
//! jumps straight to the maximum level (emergency mode).
//!
//! Frame hooks run on the render thread; they only update windows and never log.

use super::quality::settings_for_level;
use super::window::{SlidingWindow, Trend};
use crate::memory::MemoryManager;
use chrono::{DateTime, Utc};
use clipdeck_common::config::PerformanceConfig;
use clipdeck_common::events::{
    PerformanceWarning, QualityChange, QualityChangeReason, QualitySettings, WarningKind,
};
use clipdeck_common::{Clock, ObserverRegistry, Subscription};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FPS_WEIGHT: f64 = 0.4;
const RENDER_WEIGHT: f64 = 0.3;
const MEMORY_WEIGHT: f64 = 0.2;
const CPU_WEIGHT: f64 = 0.1;

/// Relative change treated as a memory trend
const TREND_TOLERANCE: f64 = 0.05;

/// Source of heap statistics
pub trait MemoryProbe: Send + Sync {
    /// `(used_bytes, limit_bytes)`, or None if unavailable
    fn sample(&self) -> Option<(u64, u64)>;
}

impl MemoryProbe for MemoryManager {
    fn sample(&self) -> Option<(u64, u64)> {
        Some((self.current_usage(), self.config().max_bytes))
    }
}

/// Snapshot of monitor state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub frames: usize,
    pub average_fps: Option<f64>,
    pub min_fps: Option<f64>,
    pub average_render_ms: Option<f64>,
    pub max_render_ms: Option<f64>,
    /// Estimated from render time against the frame budget (0-1)
    pub cpu_load: f64,
    pub memory_ratio: Option<f64>,
    pub memory_trend: Trend,
    pub last_score: Option<f64>,
    pub level: u8,
    pub emergency: bool,
}

#[derive(Debug)]
struct MonitorState {
    frame_started_at: Option<DateTime<Utc>>,
    previous_frame_start: Option<DateTime<Utc>>,
    fps: SlidingWindow,
    render_ms: SlidingWindow,
    memory_used: SlidingWindow,
    memory_ratio: Option<f64>,
    level: u8,
    last_score: Option<f64>,
    emergency: bool,
}

impl MonitorState {
    fn new(window_size: usize) -> Self {
        Self {
            frame_started_at: None,
            previous_frame_start: None,
            fps: SlidingWindow::new(window_size),
            render_ms: SlidingWindow::new(window_size),
            memory_used: SlidingWindow::new(window_size),
            memory_ratio: None,
            level: 0,
            last_score: None,
            emergency: false,
        }
    }
}

/// Observes frame timings and publishes quality settings
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    probe: Mutex<Option<Arc<dyn MemoryProbe>>>,
    quality_observers: ObserverRegistry<QualityChange>,
    warning_observers: ObserverRegistry<PerformanceWarning>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig, clock: Arc<dyn Clock>) -> Self {
        let state = MonitorState::new(config.window_size);
        Self {
            config,
            clock,
            state: Mutex::new(state),
            probe: Mutex::new(None),
            quality_observers: ObserverRegistry::new(),
            warning_observers: ObserverRegistry::new(),
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// Attach a heap statistics source sampled on each evaluation
    pub fn set_memory_probe(&self, probe: Arc<dyn MemoryProbe>) {
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    pub fn on_quality_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QualityChange) + Send + Sync + 'static,
    {
        self.quality_observers.subscribe(callback)
    }

    pub fn on_performance_warning<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PerformanceWarning) + Send + Sync + 'static,
    {
        self.warning_observers.subscribe(callback)
    }

    /// Mark the start of a rendered frame
    pub fn frame_render_start(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        if let Some(previous) = state.previous_frame_start {
            let interval_ms = (now - previous)
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
                .unwrap_or(f64::MAX);
            if interval_ms > 0.0 {
                state.fps.push(1000.0 / interval_ms);
            }
        }
        state.previous_frame_start = Some(now);
        state.frame_started_at = Some(now);
    }

    /// Mark the end of the frame started by the last `frame_render_start`
    pub fn frame_render_end(&self) {
        let now = self.clock.now();
        let (warnings, change) = {
            let mut state = self.lock_state();
            let Some(started) = state.frame_started_at.take() else {
                return;
            };
            let render_ms = (now - started)
                .num_microseconds()
                .map(|us| us.max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            state.render_ms.push(render_ms);

            let mut warnings = Vec::new();
            let fps = state.fps.last();
            if let Some(fps) = fps.filter(|f| *f < self.config.hard_min_fps) {
                warnings.push(self.warning(WarningKind::LowFps, fps, self.config.hard_min_fps, now));
            }
            if render_ms > self.config.hard_max_render_ms {
                warnings.push(self.warning(
                    WarningKind::SlowRender,
                    render_ms,
                    self.config.hard_max_render_ms,
                    now,
                ));
            }
            let memory_breached = state
                .memory_ratio
                .is_some_and(|r| r > self.config.hard_memory_ratio);

            let change = if warnings.len() == 2 && memory_breached {
                self.enter_emergency(&mut state, now)
            } else {
                None
            };
            (warnings, change)
        };

        for warning in &warnings {
            self.warning_observers.notify(warning);
        }
        if let Some(change) = change {
            warn!(
                "Performance emergency: forcing quality level {}",
                change.level
            );
            self.quality_observers.notify(&change);
        }
    }

    /// Feed heap statistics directly
    pub fn record_memory(&self, used_bytes: u64, limit_bytes: u64) {
        if limit_bytes == 0 {
            return;
        }
        let ratio = used_bytes as f64 / limit_bytes as f64;
        {
            let mut state = self.lock_state();
            state.memory_used.push(used_bytes as f64);
            state.memory_ratio = Some(ratio);
        }
        if ratio > self.config.hard_memory_ratio {
            let warning = self.warning(
                WarningKind::HighMemory,
                ratio,
                self.config.hard_memory_ratio,
                self.clock.now(),
            );
            self.warning_observers.notify(&warning);
        }
    }

    pub fn level(&self) -> u8 {
        self.lock_state().level
    }

    pub fn adaptive_settings(&self) -> QualitySettings {
        settings_for_level(self.level(), self.config.max_degradation_level)
    }

    /// Score the current windows and step the level at most once
    pub fn evaluate(&self) -> Option<QualityChange> {
        let probe = self.probe.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some((used, limit)) = probe.and_then(|p| p.sample()) {
            self.record_memory(used, limit);
        }

        let now = self.clock.now();
        let change = {
            let mut state = self.lock_state();
            let score = self.score(&state);
            state.last_score = Some(score);

            let previous = state.level;
            if score < self.config.degradation_threshold
                && state.level < self.config.max_degradation_level
            {
                state.level += 1;
                Some(self.change(previous, state.level, score, QualityChangeReason::Degraded, now))
            } else if score > self.config.recovery_threshold && state.level > 0 {
                state.level -= 1;
                state.emergency = false;
                Some(self.change(previous, state.level, score, QualityChangeReason::Recovered, now))
            } else {
                None
            }
        };

        if let Some(change) = &change {
            info!(
                "Quality level {} -> {} ({:?}, score {:.2})",
                change.previous_level, change.level, change.reason, change.score
            );
            self.quality_observers.notify(change);
        }
        change
    }

    pub fn report(&self) -> PerformanceReport {
        let state = self.lock_state();
        PerformanceReport {
            frames: state.render_ms.len(),
            average_fps: state.fps.average(),
            min_fps: state.fps.min(),
            average_render_ms: state.render_ms.average(),
            max_render_ms: state.render_ms.max(),
            cpu_load: self.cpu_load(&state),
            memory_ratio: state.memory_ratio,
            memory_trend: state.memory_used.trend(TREND_TOLERANCE),
            last_score: state.last_score,
            level: state.level,
            emergency: state.emergency,
        }
    }

    /// Return to full quality and forget collected samples
    pub fn reset(&self) {
        let now = self.clock.now();
        let change = {
            let mut state = self.lock_state();
            let previous = state.level;
            *state = MonitorState::new(self.config.window_size);
            (previous != 0).then(|| self.change(previous, 0, 1.0, QualityChangeReason::Reset, now))
        };
        if let Some(change) = change {
            self.quality_observers.notify(&change);
        }
        debug!("Performance monitor reset");
    }

    /// Run `evaluate` every `evaluation_interval` until the monitor is dropped
    pub fn spawn_evaluation_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self
            .config
            .evaluation_interval()
            .max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.evaluate();
            }
            debug!("Performance evaluation loop stopped");
        })
    }

    fn score(&self, state: &MonitorState) -> f64 {
        let fps_score = state
            .fps
            .average()
            .map(|fps| (fps / self.config.target_fps).clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let budget = self.config.target_frame_ms();
        let render_score = state
            .render_ms
            .average()
            .map(|ms| if ms <= budget { 1.0 } else { (budget / ms).clamp(0.0, 1.0) })
            .unwrap_or(1.0);
        let memory_score = state
            .memory_ratio
            .map(|r| (1.0 - r).clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let cpu_score = 1.0 - self.cpu_load(state);

        FPS_WEIGHT * fps_score
            + RENDER_WEIGHT * render_score
            + MEMORY_WEIGHT * memory_score
            + CPU_WEIGHT * cpu_score
    }

    fn cpu_load(&self, state: &MonitorState) -> f64 {
        state
            .render_ms
            .average()
            .map(|ms| (ms / self.config.target_frame_ms()).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    fn enter_emergency(&self, state: &mut MonitorState, now: DateTime<Utc>) -> Option<QualityChange> {
        let max = self.config.max_degradation_level;
        if state.emergency && state.level == max {
            return None;
        }
        let previous = state.level;
        state.level = max;
        state.emergency = true;
        let score = state.last_score.unwrap_or(0.0);
        Some(self.change(previous, max, score, QualityChangeReason::Emergency, now))
    }

    fn change(
        &self,
        previous_level: u8,
        level: u8,
        score: f64,
        reason: QualityChangeReason,
        timestamp: DateTime<Utc>,
    ) -> QualityChange {
        QualityChange {
            previous_level,
            level,
            settings: settings_for_level(level, self.config.max_degradation_level),
            score,
            reason,
            timestamp,
        }
    }

    fn warning(
        &self,
        kind: WarningKind,
        value: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    ) -> PerformanceWarning {
        PerformanceWarning {
            kind,
            value,
            threshold,
            timestamp,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipdeck_common::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor() -> (PerformanceMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let monitor = PerformanceMonitor::new(PerformanceConfig::default(), clock.clone());
        (monitor, clock)
    }

    /// Render `count` frames taking `render_ms` each at `interval_ms` spacing
    fn frames(monitor: &PerformanceMonitor, clock: &ManualClock, count: usize, interval_ms: u64, render_ms: u64) {
        for _ in 0..count {
            monitor.frame_render_start();
            clock.advance_ms(render_ms);
            monitor.frame_render_end();
            clock.advance_ms(interval_ms.saturating_sub(render_ms));
        }
    }

    #[test]
    fn test_healthy_frames_keep_full_quality() {
        let (monitor, clock) = monitor();
        frames(&monitor, &clock, 30, 16, 5);

        assert!(monitor.evaluate().is_none());
        assert_eq!(monitor.level(), 0);
        let report = monitor.report();
        assert!(report.average_fps.unwrap() > 55.0);
        assert!(report.last_score.unwrap() > 0.8);
    }

    #[test]
    fn test_slow_frames_degrade_one_step_per_evaluation() {
        let (monitor, clock) = monitor();
        frames(&monitor, &clock, 30, 40, 35);

        let change = monitor.evaluate().unwrap();
        assert_eq!(change.previous_level, 0);
        assert_eq!(change.level, 1);
        assert_eq!(change.reason, QualityChangeReason::Degraded);
        assert_eq!(monitor.adaptive_settings().resolution_scale, 0.75);

        monitor.evaluate();
        monitor.evaluate();
        monitor.evaluate();
        assert_eq!(monitor.level(), 3);
    }

    #[test]
    fn test_recovery_steps_back_down() {
        let (monitor, clock) = monitor();
        frames(&monitor, &clock, 60, 40, 35);
        monitor.evaluate();
        monitor.evaluate();
        assert_eq!(monitor.level(), 2);

        frames(&monitor, &clock, 60, 16, 4);
        let change = monitor.evaluate().unwrap();
        assert_eq!(change.reason, QualityChangeReason::Recovered);
        assert_eq!(monitor.level(), 1);
    }

    #[test]
    fn test_hard_breaches_raise_warnings() {
        let (monitor, clock) = monitor();
        let warnings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&warnings);
        let _sub = monitor.on_performance_warning(move |w| {
            assert_eq!(w.kind, WarningKind::SlowRender);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // One slow frame at an otherwise acceptable rate
        frames(&monitor, &clock, 1, 60, 55);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.level(), 0);
    }

    #[test]
    fn test_triple_breach_forces_emergency() {
        let (monitor, clock) = monitor();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = monitor.on_quality_change(move |c| sink.lock().unwrap().push(c.clone()));

        monitor.record_memory(95, 100);
        frames(&monitor, &clock, 3, 100, 80);

        assert_eq!(monitor.level(), 3);
        assert!(monitor.report().emergency);
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, QualityChangeReason::Emergency);
    }

    #[test]
    fn test_memory_probe_feeds_trend() {
        let (monitor, _) = monitor();
        let memory = Arc::new(MemoryManager::new(
            clipdeck_common::config::MemoryConfig::default(),
            Arc::new(ManualClock::new()),
        ));
        monitor.set_memory_probe(memory.clone());

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(memory.track(1024 * 1024, crate::audio::BufferKind::Float32, &[]).unwrap());
            monitor.evaluate();
        }
        let report = monitor.report();
        assert_eq!(report.memory_trend, Trend::Increasing);
        assert!(report.memory_ratio.unwrap() > 0.0);
    }

    #[test]
    fn test_reset_returns_to_full_quality() {
        let (monitor, clock) = monitor();
        frames(&monitor, &clock, 30, 40, 35);
        monitor.evaluate();
        assert_eq!(monitor.level(), 1);

        monitor.reset();
        assert_eq!(monitor.level(), 0);
        assert_eq!(monitor.report().frames, 0);
    }
}
