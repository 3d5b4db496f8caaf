//! Level metering from the render thread to the control thread.
//!
//! Backed by a triple buffer: the render side overwrites the latest snapshot
//! without waiting, the control side reads whatever was published last.

use vocalbind_core::Sample;

/// Snapshot of render-side activity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    /// Peak absolute value of the captured (pre-shift) signal in the last buffer
    pub input_peak: Sample,
    /// Peak absolute value written to the device in the last buffer
    pub output_peak: Sample,
    /// Frames rendered since the graph was built
    pub frames_rendered: u64,
    /// Frames filled with silence because capture had not delivered yet
    pub underrun_frames: u64,
}

/// Render-side half (owned by the render node)
pub struct MeterWriter {
    input: triple_buffer::Input<Levels>,
}

impl MeterWriter {
    /// Publish a new snapshot. Wait-free.
    #[inline]
    pub fn publish(&mut self, levels: Levels) {
        self.input.write(levels);
    }
}

/// Control-side half
pub struct MeterReader {
    output: triple_buffer::Output<Levels>,
}

impl MeterReader {
    /// Latest published snapshot
    pub fn latest(&mut self) -> Levels {
        *self.output.read()
    }
}

/// Create a connected writer/reader pair
pub fn create_meter() -> (MeterWriter, MeterReader) {
    let (input, output) = triple_buffer::triple_buffer(&Levels::default());
    (MeterWriter { input }, MeterReader { output })
}
