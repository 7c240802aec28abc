//! Voice mixer for the host audio callback
//!
//! Sums every active voice into an interleaved stereo buffer at the output
//! rate. Source buffers at other rates are resampled by linear
//! interpolation; mono sources feed both channels.
//!
//! Runs on the audio thread: no logging, no awaiting, and no allocation
//! unless a voice finishes during the call.

use crate::audio::SampleBuffer;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
struct Fade {
    remaining: usize,
    total: usize,
}

#[derive(Debug)]
struct ActiveVoice {
    id: Uuid,
    buffer: Arc<SampleBuffer>,
    /// Fractional read position in source frames
    position: f64,
    end_frame: f64,
    /// Source frames advanced per output frame
    step: f64,
    gain: f32,
    fade_out: Option<Fade>,
    /// Start order; lowest is oldest
    seq: u64,
}

impl ActiveVoice {
    fn sample(&self, channel: usize) -> f32 {
        let Some(data) = self
            .buffer
            .channel(channel)
            .or_else(|| self.buffer.channel(0))
        else {
            return 0.0;
        };
        let index = self.position.floor() as usize;
        let frac = (self.position - index as f64) as f32;
        let a = data.get(index).copied().unwrap_or(0.0);
        let b = data.get(index + 1).copied().unwrap_or(a);
        a + (b - a) * frac
    }
}

/// Active voices and their read positions
#[derive(Debug)]
pub struct VoiceMixer {
    voices: Vec<ActiveVoice>,
    output_rate: u32,
    max_voices: usize,
    next_seq: u64,
}

impl VoiceMixer {
    pub fn new(output_rate: u32, max_voices: usize) -> Self {
        let max_voices = max_voices.max(1);
        Self {
            voices: Vec::with_capacity(max_voices),
            output_rate: output_rate.max(1),
            max_voices,
            next_seq: 0,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Start a voice over `start..end` seconds of `buffer`
    ///
    /// Returns the id of the oldest voice if it had to be stolen to stay
    /// within the voice limit.
    pub fn add(
        &mut self,
        id: Uuid,
        buffer: Arc<SampleBuffer>,
        start_time: f64,
        end_time: f64,
        gain: f32,
    ) -> Option<Uuid> {
        let stolen = if self.voices.len() >= self.max_voices {
            self.voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.seq)
                .map(|(i, _)| i)
                .map(|i| self.voices.swap_remove(i).id)
        } else {
            None
        };

        let rate = buffer.sample_rate() as f64;
        let end_frame = (end_time * rate).min(buffer.len() as f64);
        let position = (start_time * rate).clamp(0.0, end_frame);
        self.next_seq += 1;
        self.voices.push(ActiveVoice {
            id,
            step: rate / self.output_rate as f64,
            buffer,
            position,
            end_frame,
            gain,
            fade_out: None,
            seq: self.next_seq,
        });
        stolen
    }

    /// Stop a voice, immediately or with a linear fade of `fade_frames`
    pub fn stop(&mut self, id: Uuid, fade_frames: usize) -> bool {
        let Some(index) = self.voices.iter().position(|v| v.id == id) else {
            return false;
        };
        if fade_frames == 0 {
            self.voices.swap_remove(index);
        } else {
            let voice = &mut self.voices[index];
            if voice.fade_out.is_none() {
                voice.fade_out = Some(Fade {
                    remaining: fade_frames,
                    total: fade_frames,
                });
            }
        }
        true
    }

    /// Stop every voice; returns the ids that were playing
    pub fn stop_all(&mut self, fade_frames: usize) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self.voices.iter().map(|v| v.id).collect();
        for id in &ids {
            self.stop(*id, fade_frames);
        }
        ids
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.voices.iter().any(|v| v.id == id)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Source-time position of a voice in seconds
    pub fn position_of(&self, id: Uuid) -> Option<f64> {
        self.voices
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.position / v.buffer.sample_rate() as f64)
    }

    /// Mix into `out` (interleaved stereo, overwritten)
    ///
    /// Returns voices that reached the end of their region. Voices whose
    /// fade-out completed are dropped without being reported.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<Uuid> {
        out.fill(0.0);
        let mut finished = Vec::new();
        let frames = out.len() / 2;

        self.voices.retain_mut(|voice| {
            for frame in 0..frames {
                if voice.position >= voice.end_frame {
                    finished.push(voice.id);
                    return false;
                }

                let mut gain = voice.gain;
                if let Some(fade) = voice.fade_out.as_mut() {
                    if fade.remaining == 0 {
                        return false;
                    }
                    gain *= fade.remaining as f32 / fade.total as f32;
                    fade.remaining -= 1;
                }

                out[frame * 2] += voice.sample(0) * gain;
                out[frame * 2 + 1] += voice.sample(1) * gain;
                voice.position += voice.step;
            }

            if voice.position >= voice.end_frame {
                finished.push(voice.id);
                return false;
            }
            !matches!(voice.fade_out, Some(Fade { remaining: 0, .. }))
        });

        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, rate: u32) -> Arc<SampleBuffer> {
        let samples = (0..frames).map(|i| i as f32 / frames as f32).collect();
        Arc::new(SampleBuffer::mono(samples, rate).unwrap())
    }

    fn constant(value: f32, frames: usize, rate: u32) -> Arc<SampleBuffer> {
        Arc::new(SampleBuffer::mono(vec![value; frames], rate).unwrap())
    }

    #[test]
    fn test_mono_voice_feeds_both_channels() {
        let mut mixer = VoiceMixer::new(100, 4);
        mixer.add(Uuid::new_v4(), constant(0.5, 100, 100), 0.0, 1.0, 1.0);

        let mut out = vec![0.0; 8];
        mixer.render(&mut out);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_voices_are_summed_with_gain() {
        let mut mixer = VoiceMixer::new(100, 4);
        mixer.add(Uuid::new_v4(), constant(0.25, 100, 100), 0.0, 1.0, 1.0);
        mixer.add(Uuid::new_v4(), constant(0.25, 100, 100), 0.0, 1.0, 2.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert!((out[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_voice_ends_at_region_end() {
        let mut mixer = VoiceMixer::new(100, 4);
        let id = Uuid::new_v4();
        mixer.add(id, constant(1.0, 100, 100), 0.0, 0.05, 1.0);

        let mut out = vec![0.0; 20];
        let finished = mixer.render(&mut out);
        assert_eq!(finished, vec![id]);
        assert!(mixer.is_empty());
        // 5 frames of signal, then silence
        assert_eq!(out[8], 1.0);
        assert_eq!(out[10], 0.0);
    }

    #[test]
    fn test_resampling_advances_by_rate_ratio() {
        let mut mixer = VoiceMixer::new(100, 4);
        let id = Uuid::new_v4();
        mixer.add(id, ramp(200, 200), 0.0, 1.0, 1.0);

        let mut out = vec![0.0; 20];
        mixer.render(&mut out);
        // 10 output frames at 100 Hz = 0.1s of a 200 Hz source
        let pos = mixer.position_of(id).unwrap();
        assert!((pos - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_linear_interpolation_between_frames() {
        let buffer = Arc::new(SampleBuffer::mono(vec![0.0, 1.0, 0.0, 1.0], 2).unwrap());
        let mut mixer = VoiceMixer::new(4, 4);
        mixer.add(Uuid::new_v4(), buffer, 0.0, 2.0, 1.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_oldest_voice_is_stolen() {
        let mut mixer = VoiceMixer::new(100, 2);
        let first = Uuid::new_v4();
        mixer.add(first, constant(0.1, 100, 100), 0.0, 1.0, 1.0);
        mixer.add(Uuid::new_v4(), constant(0.1, 100, 100), 0.0, 1.0, 1.0);

        let stolen = mixer.add(Uuid::new_v4(), constant(0.1, 100, 100), 0.0, 1.0, 1.0);
        assert_eq!(stolen, Some(first));
        assert_eq!(mixer.len(), 2);
        assert!(!mixer.contains(first));
    }

    #[test]
    fn test_fade_out_ramps_to_silence() {
        let mut mixer = VoiceMixer::new(100, 4);
        let id = Uuid::new_v4();
        mixer.add(id, constant(1.0, 100, 100), 0.0, 1.0, 1.0);
        assert!(mixer.stop(id, 4));

        let mut out = vec![0.0; 12];
        let finished = mixer.render(&mut out);
        assert!(finished.is_empty());
        assert_eq!(out[0], 1.0);
        assert!((out[2] - 0.75).abs() < 1e-6);
        assert!((out[6] - 0.25).abs() < 1e-6);
        assert_eq!(out[8], 0.0);
        assert!(mixer.is_empty());
    }

    #[test]
    fn test_immediate_stop() {
        let mut mixer = VoiceMixer::new(100, 4);
        let id = Uuid::new_v4();
        mixer.add(id, constant(1.0, 100, 100), 0.0, 1.0, 1.0);
        assert!(mixer.stop(id, 0));
        assert!(!mixer.stop(id, 0));

        let mut out = vec![1.0; 4];
        mixer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
