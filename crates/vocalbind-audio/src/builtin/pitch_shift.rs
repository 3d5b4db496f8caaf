//! Pitch shifter - granular delay-line pitch shifting for live voice.

use std::sync::Arc;
use vocalbind_comms::{PITCH_PARAM_ID, PitchParameter};
use vocalbind_core::{Frames, Sample, SampleRate, semitones};
use vocalbind_plugin::{AudioBuffer, ParameterInfo, Plugin, PluginError, PluginInfo};

/// Shortest and longest grain accepted, in milliseconds
const GRAIN_MS_RANGE: (f32, f32) = (10.0, 100.0);

/// Time constant for gliding toward a new semitone target
const SMOOTHING_SECONDS: f32 = 0.02;

/// Below this shift the wet path fades out and the voice passes through dry
const BYPASS_EPSILON: f32 = 1e-3;

/// Mono pitch shifter that preserves duration.
///
/// Two read taps sweep through a short circular delay line at the shifted
/// rate, half a grain apart, each under a triangular window. The windows sum
/// to one, so the taps crossfade without gaps.
///
/// The semitone target is read once per block from the shared
/// [`PitchParameter`] and approached with a one-pole glide, so a preset
/// switch never jumps. At zero shift the output crossfades to the dry input.
///
/// ## Parameter Range
///
/// Pitch: -12.0 to +12.0 semitones (parameter id 0)
pub struct PitchShiftProcessor {
    pitch: Arc<PitchParameter>,
    info: PluginInfo,
    sample_rate: SampleRate,
    grain_ms: f32,
    /// Grain length in samples
    window: f32,
    delay: Vec<Sample>,
    write_pos: usize,
    /// Delay of the first tap, in [0, window)
    phasor: f32,
    /// Smoothed semitone value actually applied
    current: f32,
    /// Smoothed wet amount (0 = dry passthrough)
    wet: f32,
    /// Per-sample glide coefficient
    glide: f32,
}

impl PitchShiftProcessor {
    /// Create a shifter driven by `pitch` with the given grain length
    pub fn new(pitch: Arc<PitchParameter>, grain_ms: f32) -> Self {
        let current = pitch.get();
        let mut processor = Self {
            pitch,
            info: PluginInfo {
                name: "Pitch Shift".to_string(),
                vendor: "vocalbind".to_string(),
                version: "1.0.0".to_string(),
                unique_id: "vocalbind.builtin.pitch_shift".to_string(),
            },
            sample_rate: 48000,
            grain_ms: grain_ms.clamp(GRAIN_MS_RANGE.0, GRAIN_MS_RANGE.1),
            window: 0.0,
            delay: Vec::new(),
            write_pos: 0,
            phasor: 0.0,
            current,
            wet: if current.abs() > BYPASS_EPSILON { 1.0 } else { 0.0 },
            glide: 0.0,
        };
        processor.configure(48000);
        processor
    }

    /// Semitone value currently applied (after smoothing)
    pub fn applied_semitones(&self) -> f32 {
        self.current
    }

    /// Grain length in samples at the current sample rate
    pub fn window_samples(&self) -> f32 {
        self.window
    }

    /// Size buffers and coefficients for a sample rate. Allocates.
    fn configure(&mut self, sample_rate: SampleRate) {
        self.sample_rate = sample_rate;
        let rate = sample_rate as f32;
        self.window = (self.grain_ms * rate / 1000.0).max(4.0);
        self.delay = vec![0.0; self.window.ceil() as usize + 2];
        self.glide = 1.0 - (-1.0 / (SMOOTHING_SECONDS * rate)).exp();
        self.write_pos = 0;
        self.phasor = 0.0;
    }

    /// Linear-interpolated read `delay` samples behind the write head
    #[inline]
    fn tap(&self, delay: f32) -> Sample {
        let len = self.delay.len();
        let mut pos = self.write_pos as f32 - delay;
        if pos < 0.0 {
            pos += len as f32;
        }
        let index = (pos as usize) % len;
        let frac = pos.fract();
        let a = self.delay[index];
        let b = self.delay[(index + 1) % len];
        a + frac * (b - a)
    }

    /// Triangular window gain for a tap at `delay`
    #[inline]
    fn window_gain(&self, delay: f32) -> f32 {
        let x = delay / self.window;
        if x < 0.5 { 2.0 * x } else { 2.0 * (1.0 - x) }
    }

    /// Process one block. Real-time safe: no allocation, no locks.
    pub fn process_block(&mut self, input: &[Sample], output: &mut [Sample]) {
        let target = self.pitch.get();
        let target_wet = if target.abs() > BYPASS_EPSILON { 1.0 } else { 0.0 };

        for (out, &dry) in output.iter_mut().zip(input) {
            self.current += (target - self.current) * self.glide;
            self.wet += (target_wet - self.wet) * self.glide;

            self.delay[self.write_pos] = dry;

            let ratio = semitones::ratio(self.current);
            self.phasor += 1.0 - ratio;
            if self.phasor >= self.window {
                self.phasor -= self.window;
            } else if self.phasor < 0.0 {
                self.phasor += self.window;
            }

            let delay1 = self.phasor;
            let mut delay2 = self.phasor + self.window * 0.5;
            if delay2 >= self.window {
                delay2 -= self.window;
            }

            let shifted = self.tap(delay1) * self.window_gain(delay1)
                + self.tap(delay2) * self.window_gain(delay2);

            *out = dry + (shifted - dry) * self.wet;

            self.write_pos = (self.write_pos + 1) % self.delay.len();
        }
    }
}

impl Plugin for PitchShiftProcessor {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        sample_rate: SampleRate,
        _max_block_size: Frames,
    ) -> Result<(), PluginError> {
        if sample_rate == 0 {
            return Err(PluginError::InitializationFailed(
                "sample rate must be non-zero".to_string(),
            ));
        }
        self.configure(sample_rate);
        Ok(())
    }

    fn process(&mut self, audio: &mut AudioBuffer) -> Result<(), PluginError> {
        // Mono in, mono out
        if audio.inputs.is_empty() || audio.outputs.is_empty() {
            return Err(PluginError::ProcessingFailed(format!(
                "Pitch shifter requires 1 input and 1 output, got {} and {}",
                audio.inputs.len(),
                audio.outputs.len()
            )));
        }
        if audio.inputs[0].len() < audio.frames || audio.outputs[0].len() < audio.frames {
            return Err(PluginError::ProcessingFailed(format!(
                "Buffers shorter than {} frames",
                audio.frames
            )));
        }

        let frames = audio.frames;
        self.process_block(&audio.inputs[0][..frames], &mut audio.outputs[0][..frames]);
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), PluginError> {
        match id {
            PITCH_PARAM_ID => {
                self.pitch.set(value);
                Ok(())
            }
            _ => Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn get_parameter(&self, id: u32) -> Result<f32, PluginError> {
        match id {
            PITCH_PARAM_ID => Ok(self.pitch.get()),
            _ => Err(PluginError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![PitchParameter::info()]
    }

    fn input_channels(&self) -> usize {
        1 // Mono voice
    }

    fn output_channels(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.delay.fill(0.0);
        self.write_pos = 0;
        self.phasor = 0.0;
        self.current = self.pitch.get();
        self.wet = if self.current.abs() > BYPASS_EPSILON { 1.0 } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (std::f32::consts::TAU * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    /// Count upward zero crossings, a rough frequency estimate
    fn zero_crossings(signal: &[f32]) -> usize {
        signal
            .windows(2)
            .filter(|w| w[0] < 0.0 && w[1] >= 0.0)
            .count()
    }

    #[test]
    fn test_zero_shift_passes_through() {
        let pitch = Arc::new(PitchParameter::default());
        let mut shifter = PitchShiftProcessor::new(pitch, 40.0);
        shifter.initialize(48000, 256).unwrap();

        let input = sine(220.0, 48000.0, 256);
        let mut output = vec![0.0; 256];
        shifter.process_block(&input, &mut output);

        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_octave_up_doubles_frequency() {
        let pitch = Arc::new(PitchParameter::new(12.0));
        let mut shifter = PitchShiftProcessor::new(Arc::clone(&pitch), 40.0);
        shifter.initialize(48000, 4800).unwrap();

        let input = sine(200.0, 48000.0, 48000);
        let mut output = vec![0.0; 48000];
        for (inp, out) in input.chunks(256).zip(output.chunks_mut(256)) {
            shifter.process_block(inp, out);
        }

        // Skip the first 100ms while the delay line fills
        let tail = &output[4800..];
        let input_crossings = zero_crossings(&input[4800..]) as f32;
        let output_crossings = zero_crossings(tail) as f32;
        let ratio = output_crossings / input_crossings;
        assert!(ratio > 1.7 && ratio < 2.3, "crossing ratio {ratio}");
    }

    #[test]
    fn test_output_stays_bounded() {
        let pitch = Arc::new(PitchParameter::new(-6.0));
        let mut shifter = PitchShiftProcessor::new(pitch, 30.0);
        shifter.initialize(44100, 512).unwrap();

        let input = sine(330.0, 44100.0, 8192);
        let mut output = vec![0.0; 8192];
        shifter.process_block(&input, &mut output);

        assert!(output.iter().all(|s| s.is_finite() && s.abs() <= 1.0 + 1e-4));
    }

    #[test]
    fn test_parameter_changes_glide() {
        let pitch = Arc::new(PitchParameter::default());
        let mut shifter = PitchShiftProcessor::new(Arc::clone(&pitch), 40.0);
        shifter.initialize(48000, 64).unwrap();

        pitch.set(7.0);
        let input = vec![0.0; 64];
        let mut output = vec![0.0; 64];
        shifter.process_block(&input, &mut output);

        let applied = shifter.applied_semitones();
        assert!(applied > 0.0 && applied < 7.0, "applied {applied}");

        for _ in 0..200 {
            shifter.process_block(&input, &mut output);
        }
        assert!((shifter.applied_semitones() - 7.0).abs() < 1e-3);
    }

    #[test]
    fn test_parameter_routes_to_shared_value() {
        let pitch = Arc::new(PitchParameter::default());
        let mut shifter = PitchShiftProcessor::new(Arc::clone(&pitch), 40.0);

        shifter.set_parameter(PITCH_PARAM_ID, 30.0).unwrap();
        assert_eq!(pitch.get(), 12.0);
        assert_eq!(shifter.get_parameter(PITCH_PARAM_ID).unwrap(), 12.0);

        assert!(shifter.set_parameter(9, 1.0).is_err());
        assert!(shifter.get_parameter(9).is_err());
    }

    #[test]
    fn test_plugin_process_validates_buffers() {
        let pitch = Arc::new(PitchParameter::default());
        let mut shifter = PitchShiftProcessor::new(pitch, 40.0);
        shifter.initialize(48000, 64).unwrap();

        let input = vec![0.5; 32];
        let mut output = vec![0.0; 64];
        let inputs: Vec<&[f32]> = vec![&input];
        let mut outputs: Vec<&mut [f32]> = vec![&mut output];
        let mut audio = AudioBuffer {
            inputs: &inputs,
            outputs: &mut outputs,
            frames: 64,
        };

        assert!(shifter.process(&mut audio).is_err());
    }

    #[test]
    fn test_grain_length_is_clamped() {
        let pitch = Arc::new(PitchParameter::default());
        let mut shifter = PitchShiftProcessor::new(pitch, 1000.0);
        shifter.initialize(48000, 64).unwrap();
        assert_eq!(shifter.window_samples(), 4800.0);
    }
}
