//! Live voice processing graph and its lifecycle.
//!
//! This crate wires microphone capture through the pitch-shift stage to the
//! output device, keeps that graph alive across device changes, and maps
//! preset selections onto the shared pitch parameter.
//!
//! - [`graph`]: capture -> pitch -> render nodes and their hosting
//! - [`device`]: cpal and virtual backends, device watcher
//! - [`lifecycle`]: the engine state machine
//! - [`preset`]: preset selection with exclusive activation
//! - [`engine`]: the process-wide control loop tying it all together

pub mod builtin;
pub mod device;
pub mod engine;
pub mod graph;
pub mod lifecycle;
pub mod permission;
pub mod preset;
pub mod settings;

pub use device::{AudioBackend, CpalBackend, DeviceWatcher, VirtualBackend, VirtualDevice};
pub use engine::{EngineStatus, VoiceEngine};
pub use graph::{AudioGraph, GraphError, WiredGraph};
pub use lifecycle::{EngineError, EngineLifecycle};
pub use permission::{PermissionGate, PermissionStatus, SharedPermission};
pub use preset::{PresetError, PresetSelector};
pub use settings::{MemorySettings, RonSettingsFile, SettingsError, SettingsStore};

use std::time::Duration;
use vocalbind_core::{ChannelCount, DEFAULT_BLOCK_SIZE, Frames, SampleRate};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Preferred device buffer size and internal processing block
    pub block_size: Frames,
    /// Captured audio older than this is discarded to bound latency
    pub max_latency_ms: u32,
    /// Pitch-shifter grain length
    pub grain_ms: f32,
    /// How often the device watcher polls the default input device
    pub watch_interval: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_latency_ms: 40,
            grain_ms: 40.0,
            watch_interval: Duration::from_secs(1),
        }
    }
}

/// Format negotiated between the input and output devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: SampleRate,
    pub input_channels: ChannelCount,
    pub output_channels: ChannelCount,
    /// Largest block the render node processes in one pass
    pub max_block_frames: Frames,
}

impl AudioFormat {
    /// Check the format can carry audio at all
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.sample_rate == 0 {
            return Err(GraphError::FormatNegotiationFailed(
                "sample rate is zero".to_string(),
            ));
        }
        if self.input_channels == 0 || self.output_channels == 0 {
            return Err(GraphError::FormatNegotiationFailed(format!(
                "unusable channel layout ({} in, {} out)",
                self.input_channels, self.output_channels
            )));
        }
        if self.max_block_frames == 0 {
            return Err(GraphError::FormatNegotiationFailed(
                "block size is zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of frames covering `ms` milliseconds at this sample rate
    #[must_use]
    pub fn frames_for_ms(&self, ms: u32) -> Frames {
        (u64::from(self.sample_rate) * u64::from(ms) / 1000) as Frames
    }
}
