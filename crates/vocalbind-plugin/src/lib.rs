//! Processor abstraction layer.
//!
//! This crate defines the `Plugin` trait implemented by every processing
//! stage of the voice chain. The audio graph drives stages through this trait
//! so the render path never depends on a concrete processor type.

use vocalbind_core::{ChannelCount, Frames, Sample, SampleRate};

/// Audio buffer for processing
pub struct AudioBuffer<'a> {
    pub inputs: &'a [&'a [Sample]],
    pub outputs: &'a mut [&'a mut [Sample]],
    pub frames: Frames,
}

/// Information about a parameter
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub id: u32,
    pub name: String,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
}

/// Processor metadata
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub unique_id: String,
}

/// Processing stage trait.
///
/// `process` runs on the real-time render path: implementations must not
/// allocate, lock or block there. Everything else runs on the control thread.
pub trait Plugin: Send {
    /// Get processor information
    fn info(&self) -> &PluginInfo;

    /// Prepare for processing at the given sample rate and max block size.
    ///
    /// This is where buffers get allocated.
    fn initialize(
        &mut self,
        sample_rate: SampleRate,
        max_block_size: Frames,
    ) -> Result<(), PluginError>;

    /// Process audio
    fn process(&mut self, audio: &mut AudioBuffer) -> Result<(), PluginError>;

    /// Set a parameter value (thread-safe, can be called from the control thread)
    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), PluginError>;

    /// Get a parameter value
    fn get_parameter(&self, id: u32) -> Result<f32, PluginError>;

    /// Get all parameters
    fn parameters(&self) -> Vec<ParameterInfo>;

    /// Get number of input channels
    fn input_channels(&self) -> ChannelCount;

    /// Get number of output channels
    fn output_channels(&self) -> ChannelCount;

    /// Clear internal state (delay lines, smoothers) without deallocating
    fn reset(&mut self);
}

/// Processor-related errors
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Processor initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
