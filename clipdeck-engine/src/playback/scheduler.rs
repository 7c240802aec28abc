//! Trigger, jump and stop API over the voice mixer
//!
//! **Latency:** buffers made resident by `preload`/`load` are triggered
//! without suspending. A non-resident source falls back to the cache, which
//! may suspend on the persistent tier.
//!
//! **Validation:** time range and gain are checked before any mixer state
//! changes; a rejected trigger leaves no trace.
//!
//! **Playhead ordering:** every `jump_to` takes a generation number when it
//! is called. Before touching the mixer it re-checks the generation under
//! the playhead lock, so a jump overtaken by a later call returns
//! `Superseded` instead of starting a stale voice. The stop of the old voice
//! and the start of the new one happen under the same lock, inside a single
//! render quantum.

use super::mixer::VoiceMixer;
use super::voice::{validate_gain, validate_region, StopTarget, VoiceHandle};
use crate::audio::SampleBuffer;
use crate::cache::PersistentCache;
use crate::error::{PlaybackError, ValidationError};
use crate::source::SourceKey;
use chrono::{DateTime, Utc};
use clipdeck_common::config::PlaybackConfig;
use clipdeck_common::events::{StopReason, VoiceEvent};
use clipdeck_common::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Playhead {
    source: Option<SourceKey>,
    voice: Option<Uuid>,
    /// Last jump target in seconds
    position: f64,
}

#[derive(Debug, Clone, Copy)]
struct PadState {
    voice: Uuid,
    triggered_at: DateTime<Utc>,
}

/// Schedules voices for the UI layer
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<PersistentCache>,
    loaded: RwLock<HashMap<SourceKey, Arc<SampleBuffer>>>,
    mixer: Mutex<VoiceMixer>,
    voices: Mutex<HashMap<Uuid, VoiceHandle>>,
    pads: Mutex<HashMap<u32, PadState>>,
    playhead: Mutex<Playhead>,
    jump_generation: AtomicU64,
    events: broadcast::Sender<VoiceEvent>,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, cache: Arc<PersistentCache>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mixer = VoiceMixer::new(config.sample_rate, config.max_voices);
        Self {
            config,
            clock,
            cache,
            loaded: RwLock::new(HashMap::new()),
            mixer: Mutex::new(mixer),
            voices: Mutex::new(HashMap::new()),
            pads: Mutex::new(HashMap::new()),
            playhead: Mutex::new(Playhead::default()),
            jump_generation: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Voice lifecycle stream
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Make a cached source resident and pin it; false if not cached
    pub async fn preload(&self, key: &SourceKey) -> bool {
        if self.is_loaded(key) {
            return true;
        }
        let Some(entry) = self.cache.get(key).await else {
            debug!("Cannot preload {}: not cached", key);
            return false;
        };
        self.cache.pin(key);
        self.write_loaded().insert(key.clone(), entry.buffer);
        debug!("Preloaded {}", key);
        true
    }

    /// Register an already decoded buffer (e.g. fresh from acquisition)
    pub fn load(&self, key: SourceKey, buffer: Arc<SampleBuffer>) {
        self.write_loaded().insert(key, buffer);
    }

    /// Drop a resident buffer; active voices keep their own reference
    pub fn unload(&self, key: &SourceKey) -> bool {
        let removed = self.write_loaded().remove(key).is_some();
        if removed {
            self.cache.unpin(key);
        }
        removed
    }

    pub fn is_loaded(&self, key: &SourceKey) -> bool {
        self.read_loaded().contains_key(key)
    }

    /// Start a voice over `start..end` seconds of a source
    ///
    /// # Errors
    /// - `Validation` for an invalid range or gain (no voice is created)
    /// - `NotLoaded` if the source is neither resident nor cached
    pub async fn trigger(
        &self,
        key: &SourceKey,
        start_time: f64,
        end_time: f64,
        gain: f32,
    ) -> Result<VoiceHandle, PlaybackError> {
        validate_gain(gain)?;
        let buffer = self.buffer_for(key).await?;
        validate_region(start_time, end_time, buffer.duration())?;
        Ok(self.start_voice(key, buffer, start_time, end_time, gain, None))
    }

    /// Non-suspending trigger for resident sources
    ///
    /// # Errors
    /// As [`PlaybackScheduler::trigger`]; a cached but non-resident source is `NotLoaded`.
    pub fn trigger_resident(
        &self,
        key: &SourceKey,
        start_time: f64,
        end_time: f64,
        gain: f32,
    ) -> Result<VoiceHandle, PlaybackError> {
        validate_gain(gain)?;
        let buffer = self
            .resident_buffer(key)
            .ok_or_else(|| PlaybackError::NotLoaded(key.to_string()))?;
        validate_region(start_time, end_time, buffer.duration())?;
        Ok(self.start_voice(key, buffer, start_time, end_time, gain, None))
    }

    /// Trigger from a pad, coalescing re-triggers inside the debounce window
    ///
    /// A trigger arriving within `min_trigger_interval_ms` of the pad's
    /// previous one replaces that voice, so only the latest survives.
    pub async fn trigger_pad(
        &self,
        pad: u32,
        key: &SourceKey,
        start_time: f64,
        end_time: f64,
        gain: f32,
    ) -> Result<VoiceHandle, PlaybackError> {
        validate_gain(gain)?;
        let buffer = self.buffer_for(key).await?;
        validate_region(start_time, end_time, buffer.duration())?;

        let now = self.clock.now();
        let window = self.config.min_trigger_interval_ms as f64;
        let mut pads = self.lock_pads();
        if let Some(previous) = pads.get(&pad).copied() {
            if self.clock.millis_since(previous.triggered_at) < window {
                debug!("Pad {} re-triggered inside debounce window", pad);
                self.stop_voice(previous.voice, 0, StopReason::Debounced);
            }
        }

        let handle = self.start_voice(key, buffer, start_time, end_time, gain, Some(pad));
        pads.insert(
            pad,
            PadState {
                voice: handle.id,
                triggered_at: now,
            },
        );
        Ok(handle)
    }

    /// Select the source the playhead channel plays from
    pub fn set_active_source(&self, key: SourceKey) {
        let mut playhead = self.lock_playhead();
        info!("Active playhead source: {}", key);
        playhead.source = Some(key);
        playhead.position = 0.0;
    }

    pub fn active_source(&self) -> Option<SourceKey> {
        self.lock_playhead().source.clone()
    }

    /// Last jump target in seconds
    pub fn playhead_position(&self) -> f64 {
        self.lock_playhead().position
    }

    /// Move the playhead to `timestamp` seconds
    ///
    /// Stops the current playhead voice and, if `continue_playback`, starts
    /// a new one from `timestamp` to the end of the source. With
    /// `continue_playback = false` the playhead moves silently and
    /// `Ok(None)` is returned.
    ///
    /// # Errors
    /// - `NoActiveSource` if no source was selected
    /// - `Validation` if `timestamp` is outside the source
    /// - `Superseded` if a later `jump_to` was issued before this one applied
    pub async fn jump_to(
        &self,
        timestamp: f64,
        continue_playback: bool,
    ) -> Result<Option<VoiceHandle>, PlaybackError> {
        let generation = self.jump_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let key = self
            .lock_playhead()
            .source
            .clone()
            .ok_or(PlaybackError::NoActiveSource)?;

        let buffer = self.buffer_for(&key).await?;
        let duration = buffer.duration();
        if !timestamp.is_finite() || timestamp < 0.0 || timestamp >= duration {
            return Err(ValidationError::new(format!(
                "jump target {} outside 0-{:.3}s",
                timestamp, duration
            ))
            .into());
        }

        let mut playhead = self.lock_playhead();
        if self.jump_generation.load(Ordering::Acquire) != generation {
            debug!("Jump to {:.3}s superseded", timestamp);
            return Err(PlaybackError::Superseded);
        }
        if playhead.source.as_ref() != Some(&key) {
            return Err(PlaybackError::Superseded);
        }

        if let Some(previous) = playhead.voice.take() {
            self.stop_voice(previous, 0, StopReason::Superseded);
        }
        playhead.position = timestamp;

        if !continue_playback {
            return Ok(None);
        }
        let handle = self.start_voice(&key, buffer, timestamp, duration, 1.0, None);
        playhead.voice = Some(handle.id);
        Ok(Some(handle))
    }

    /// Stop one voice or all voices, optionally with a linear fade
    ///
    /// Returns the number of voices stopped.
    pub fn stop(&self, target: StopTarget, fade: Option<Duration>) -> usize {
        let fade_frames = fade
            .map(|d| (d.as_secs_f64() * self.config.sample_rate as f64).round() as usize)
            .unwrap_or(0);

        match target {
            StopTarget::Voice(id) => {
                usize::from(self.stop_voice(id, fade_frames, StopReason::Explicit))
            }
            StopTarget::All => {
                let ids = self.lock_mixer().stop_all(fade_frames);
                let now = self.clock.now();
                {
                    let mut voices = self.lock_voices();
                    for id in &ids {
                        voices.remove(id);
                    }
                }
                for id in &ids {
                    self.emit(VoiceEvent::Stopped {
                        voice_id: *id,
                        reason: StopReason::StopAll,
                        timestamp: now,
                    });
                }
                self.lock_playhead().voice = None;
                if !ids.is_empty() {
                    info!("Stopped all {} voices", ids.len());
                }
                ids.len()
            }
        }
    }

    /// Host audio callback: mix into interleaved stereo `out`
    pub fn render(&self, out: &mut [f32]) {
        let finished = self.lock_mixer().render(out);
        if finished.is_empty() {
            return;
        }

        let now = self.clock.now();
        {
            let mut voices = self.lock_voices();
            for id in &finished {
                voices.remove(id);
            }
        }
        {
            let mut playhead = self.lock_playhead();
            if playhead.voice.is_some_and(|v| finished.contains(&v)) {
                playhead.voice = None;
            }
        }
        for id in finished {
            self.emit(VoiceEvent::Ended {
                voice_id: id,
                timestamp: now,
            });
        }
    }

    pub fn active_voices(&self) -> Vec<VoiceHandle> {
        let mut voices: Vec<VoiceHandle> = self.lock_voices().values().cloned().collect();
        voices.sort_by_key(|v| v.started_at);
        voices
    }

    pub fn active_voice_count(&self) -> usize {
        self.lock_voices().len()
    }

    fn resident_buffer(&self, key: &SourceKey) -> Option<Arc<SampleBuffer>> {
        if let Some(buffer) = self.read_loaded().get(key) {
            return Some(Arc::clone(buffer));
        }
        self.cache.get_resident(key)
    }

    async fn buffer_for(&self, key: &SourceKey) -> Result<Arc<SampleBuffer>, PlaybackError> {
        if let Some(buffer) = self.resident_buffer(key) {
            return Ok(buffer);
        }
        debug!("{} not resident, loading from cache", key);
        let entry = self
            .cache
            .get(key)
            .await
            .ok_or_else(|| PlaybackError::NotLoaded(key.to_string()))?;
        Ok(entry.buffer)
    }

    fn start_voice(
        &self,
        key: &SourceKey,
        buffer: Arc<SampleBuffer>,
        start_time: f64,
        end_time: f64,
        gain: f32,
        pad: Option<u32>,
    ) -> VoiceHandle {
        let handle = VoiceHandle {
            id: Uuid::new_v4(),
            source_key: key.clone(),
            start_time,
            end_time,
            gain,
            started_at: self.clock.now(),
            pad,
        };

        let stolen = self
            .lock_mixer()
            .add(handle.id, buffer, start_time, end_time, gain);
        {
            let mut voices = self.lock_voices();
            if let Some(stolen) = stolen {
                voices.remove(&stolen);
            }
            voices.insert(handle.id, handle.clone());
        }

        if let Some(stolen) = stolen {
            debug!("Voice limit reached, stole {}", stolen);
            self.emit(VoiceEvent::Stolen {
                voice_id: stolen,
                timestamp: handle.started_at,
            });
        }
        self.emit(VoiceEvent::Started {
            voice_id: handle.id,
            source_key: key.to_string(),
            start_time,
            end_time,
            gain,
            pad,
            timestamp: handle.started_at,
        });
        handle
    }

    fn stop_voice(&self, id: Uuid, fade_frames: usize, reason: StopReason) -> bool {
        let stopped = self.lock_mixer().stop(id, fade_frames);
        self.lock_voices().remove(&id);
        if stopped {
            self.emit(VoiceEvent::Stopped {
                voice_id: id,
                reason,
                timestamp: self.clock.now(),
            });
        }
        stopped
    }

    fn emit(&self, event: VoiceEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn read_loaded(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SourceKey, Arc<SampleBuffer>>> {
        self.loaded.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_loaded(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SourceKey, Arc<SampleBuffer>>> {
        self.loaded.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_mixer(&self) -> MutexGuard<'_, VoiceMixer> {
        self.mixer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_voices(&self) -> MutexGuard<'_, HashMap<Uuid, VoiceHandle>> {
        self.voices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pads(&self) -> MutexGuard<'_, HashMap<u32, PadState>> {
        self.pads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_playhead(&self) -> MutexGuard<'_, Playhead> {
        self.playhead.lock().unwrap_or_else(|e| e.into_inner())
    }
}
