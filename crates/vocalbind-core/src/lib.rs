//! Core types, traits, and constants shared across the vocalbind crates.
//!
//! This crate provides the vocabulary every other vocalbind crate speaks:
//! sample types, the semitone range, preset names, engine states and the
//! error taxonomy surfaced to the control surface.

use std::fmt;

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (32-bit float throughout the processing chain)
pub type Sample = f32;

/// Number of audio channels
pub type ChannelCount = usize;

/// Pitch-shift range, in semitones
pub mod semitones {
    /// Lowest supported shift (one octave down)
    pub const MIN: f32 = -12.0;
    /// Highest supported shift (one octave up)
    pub const MAX: f32 = 12.0;
    /// Cents per semitone
    pub const CENTS_PER_SEMITONE: f32 = 100.0;

    /// Clamp a semitone amount into the supported range.
    ///
    /// NaN is passed through unchanged; callers decide what it means.
    #[must_use]
    pub fn clamp(value: f32) -> f32 {
        value.clamp(MIN, MAX)
    }

    /// Playback-rate ratio for a semitone shift (`2^(s/12)`)
    #[must_use]
    pub fn ratio(value: f32) -> f32 {
        (value / 12.0).exp2()
    }
}

/// Default processing block size (~5.3ms @ 48kHz)
pub const DEFAULT_BLOCK_SIZE: Frames = 256;

/// Named presets selectable from the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresetName {
    /// Lowered voice (user-configurable, default -6)
    Deep,
    /// Unprocessed pitch (always 0)
    Normal,
    /// Raised voice (user-configurable, default +7)
    High,
}

impl PresetName {
    /// All presets in menu order
    pub const ALL: [Self; 3] = [Self::Deep, Self::Normal, Self::High];

    /// Whether the user may change this preset's semitone value
    #[must_use]
    pub const fn is_configurable(self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// Lowercase identifier used by the control surface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deep => "deep",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for PresetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PresetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deep" => Ok(Self::Deep),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(Error::UnknownPreset(other.to_string())),
        }
    }
}

/// Which pitch setting is currently driving the pitch parameter.
///
/// Exactly one variant is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivePreset {
    /// A named preset
    Named(PresetName),
    /// A value set directly, outside of any preset
    Custom,
}

impl fmt::Display for ActivePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => name.fmt(f),
            Self::Custom => f.write_str("custom"),
        }
    }
}

/// Failure categories surfaced through `lastError` and `EngineState::Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Microphone access refused; terminal until access is granted externally
    PermissionDenied,
    /// Input or output device missing or failed to open; retried on reconnect
    DeviceUnavailable,
    /// Input and output formats cannot be matched
    FormatNegotiationFailed,
    /// Node wiring failed for any other reason
    GraphBuildFailed,
}

impl ErrorKind {
    /// Whether a "device reconnected" notification should retry automatically
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::DeviceUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PermissionDenied => "microphone permission denied",
            Self::DeviceUnavailable => "audio device unavailable",
            Self::FormatNegotiationFailed => "audio format negotiation failed",
            Self::GraphBuildFailed => "audio graph build failed",
        })
    }
}

/// Lifecycle state of the audio engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineState {
    /// No graph, no device I/O
    #[default]
    Stopped,
    /// Permission check and graph construction in progress
    Starting,
    /// Device I/O active, audio flowing through the pitch stage
    Running,
    /// Graph being rebuilt after a device or format change
    Reconfiguring,
    /// Unusable until the reason is resolved
    Failed(ErrorKind),
}

impl EngineState {
    /// Whether the graph is live or about to be
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Reconfiguring)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Reconfiguring => f.write_str("reconfiguring"),
            Self::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Common error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Text that names no preset
    #[error("unknown preset: {0}")]
    UnknownPreset(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semitone_clamp() {
        assert_eq!(semitones::clamp(20.0), 12.0);
        assert_eq!(semitones::clamp(-20.0), -12.0);
        assert_eq!(semitones::clamp(3.5), 3.5);
    }

    #[test]
    fn test_ratio_octave() {
        assert!((semitones::ratio(12.0) - 2.0).abs() < 1e-6);
        assert!((semitones::ratio(-12.0) - 0.5).abs() < 1e-6);
        assert_eq!(semitones::ratio(0.0), 1.0);
    }

    #[test]
    fn test_preset_parse() {
        assert_eq!("Deep".parse::<PresetName>().unwrap(), PresetName::Deep);
        assert_eq!(" high ".parse::<PresetName>().unwrap(), PresetName::High);
        assert_eq!(
            "loud".parse::<PresetName>(),
            Err(Error::UnknownPreset("loud".to_string()))
        );
    }

    #[test]
    fn test_only_device_unavailable_is_transient() {
        assert!(ErrorKind::DeviceUnavailable.is_transient());
        assert!(!ErrorKind::PermissionDenied.is_transient());
        assert!(!ErrorKind::FormatNegotiationFailed.is_transient());
        assert!(!ErrorKind::GraphBuildFailed.is_transient());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Running.to_string(), "running");
        assert_eq!(
            EngineState::Failed(ErrorKind::PermissionDenied).to_string(),
            "failed (microphone permission denied)"
        );
    }
}
