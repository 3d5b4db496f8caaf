//! Real-time readable pitch parameter.

use std::sync::atomic::{AtomicU32, Ordering};
use vocalbind_core::semitones;
use vocalbind_plugin::ParameterInfo;

/// Parameter ID the pitch processor exposes for its semitone value
pub const PITCH_PARAM_ID: u32 = 0;

/// Active pitch-shift amount in semitones.
///
/// The value lives in an `AtomicU32` as the bit pattern of an `f32`, so a
/// reader on the render thread always observes one complete published value.
/// Writers may be on any thread; last write wins.
///
/// ## Range
///
/// [-12.0, +12.0] semitones (one octave either way). Out-of-range writes are
/// clamped silently. NaN writes are ignored and leave the previous value.
#[derive(Debug)]
pub struct PitchParameter {
    bits: AtomicU32,
}

impl PitchParameter {
    /// Create a parameter holding `initial` (clamped)
    #[must_use]
    pub fn new(initial: f32) -> Self {
        let value = if initial.is_nan() {
            0.0
        } else {
            semitones::clamp(initial)
        };
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    /// Publish a new semitone value for the next render cycle
    pub fn set(&self, value: f32) {
        if value.is_nan() {
            return;
        }
        self.bits
            .store(semitones::clamp(value).to_bits(), Ordering::Release);
    }

    /// Read the current semitone value.
    ///
    /// Wait-free: safe to call from the render callback.
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Current value in cents (hundredths of a semitone)
    pub fn cents(&self) -> f32 {
        self.get() * semitones::CENTS_PER_SEMITONE
    }

    /// Current playback-rate ratio (`2^(semitones/12)`)
    pub fn ratio(&self) -> f32 {
        semitones::ratio(self.get())
    }

    /// Parameter description for processors exposing this value
    #[must_use]
    pub fn info() -> ParameterInfo {
        ParameterInfo {
            id: PITCH_PARAM_ID,
            name: "Pitch (semitones)".to_string(),
            min_value: semitones::MIN,
            max_value: semitones::MAX,
            default_value: 0.0,
        }
    }
}

impl Default for PitchParameter {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_is_zero() {
        assert_eq!(PitchParameter::default().get(), 0.0);
    }

    #[test]
    fn test_set_get_clamps() {
        let param = PitchParameter::default();
        for v in [-40.0, -12.0, -6.0, 0.0, 3.5, 7.0, 12.0, 12.01, 1e9] {
            param.set(v);
            assert_eq!(param.get(), v.clamp(-12.0, 12.0), "input {v}");
        }
    }

    #[test]
    fn test_infinities_clamp_to_bounds() {
        let param = PitchParameter::default();
        param.set(f32::INFINITY);
        assert_eq!(param.get(), 12.0);
        param.set(f32::NEG_INFINITY);
        assert_eq!(param.get(), -12.0);
    }

    #[test]
    fn test_nan_is_ignored() {
        let param = PitchParameter::new(5.0);
        param.set(f32::NAN);
        assert_eq!(param.get(), 5.0);
        assert_eq!(PitchParameter::new(f32::NAN).get(), 0.0);
    }

    #[test]
    fn test_cents_and_ratio() {
        let param = PitchParameter::new(-6.0);
        assert_eq!(param.cents(), -600.0);
        assert!((param.ratio() - 0.707_106_8).abs() < 1e-5);
    }

    #[test]
    fn test_values_are_never_torn() {
        // Readers only ever see one of the two published values
        let param = Arc::new(PitchParameter::default());
        let writer = {
            let param = Arc::clone(&param);
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    param.set(if i % 2 == 0 { -7.25 } else { 11.5 });
                }
            })
        };

        for _ in 0..10_000 {
            let v = param.get();
            assert!(v == 0.0 || v == -7.25 || v == 11.5, "torn read: {v}");
        }
        writer.join().unwrap();
    }
}
