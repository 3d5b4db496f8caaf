//! Built-in audio processors.
//!
//! These implement the `Plugin` trait and sit in the graph's processing slot
//! between capture and render.

pub mod pitch_shift;

pub use pitch_shift::PitchShiftProcessor;

use std::sync::Arc;
use vocalbind_comms::PitchParameter;
use vocalbind_plugin::Plugin;

/// Create a built-in processor by name
///
/// Returns `None` if the name doesn't match any known built-in processor.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vocalbind_audio::builtin;
/// use vocalbind_comms::PitchParameter;
///
/// let pitch = Arc::new(PitchParameter::default());
/// let _shifter = builtin::create_builtin("pitch_shift", pitch, 40.0).expect("pitch shifter exists");
/// ```
pub fn create_builtin(
    name: &str,
    pitch: Arc<PitchParameter>,
    grain_ms: f32,
) -> Option<Box<dyn Plugin>> {
    match name {
        "pitch_shift" => Some(Box::new(PitchShiftProcessor::new(pitch, grain_ms))),
        _ => None,
    }
}
