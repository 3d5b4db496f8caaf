//! Audio processing graph.
//!
//! The graph is always the same three nodes:
//!
//! ```text
//! capture (input callback) --ring--> pitch shift --> render (output callback)
//! ```
//!
//! [`WiredGraph`] is one fully connected, not yet running instance of that
//! topology for a negotiated [`AudioFormat`]. [`AudioGraph`] hosts at most one
//! live instance at a time on top of an [`AudioBackend`], and swaps instances
//! whole on rebuild so a half-wired graph is never observable.

use std::sync::Arc;

use dasp::sample::{FromSample, ToSample};
use vocalbind_comms::{
    CaptureConsumer, CaptureProducer, Levels, MeterReader, MeterWriter, PitchParameter,
    create_capture_ring, create_meter,
};
use vocalbind_core::{ChannelCount, ErrorKind, Frames, Sample};
use vocalbind_plugin::{AudioBuffer, Plugin};

use crate::device::{ActiveStreams, AudioBackend};
use crate::{AudioConfig, AudioFormat, builtin};

/// Graph construction and device errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Input or output device missing, or it refused to open
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Input and output formats cannot be matched
    #[error("Format negotiation failed: {0}")]
    FormatNegotiationFailed(String),

    /// Node construction or wiring failed
    #[error("Graph build failed: {0}")]
    GraphBuildFailed(String),
}

impl GraphError {
    /// Category reported through `lastError`
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::FormatNegotiationFailed(_) => ErrorKind::FormatNegotiationFailed,
            Self::GraphBuildFailed(_) => ErrorKind::GraphBuildFailed,
        }
    }
}

/// The three nodes of the voice chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Capture,
    PitchShift,
    Render,
}

/// Connection between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub from: NodeKind,
    pub to: NodeKind,
}

/// capture -> pitch -> render, in processing order
pub const TOPOLOGY: [Connection; 2] = [
    Connection {
        from: NodeKind::Capture,
        to: NodeKind::PitchShift,
    },
    Connection {
        from: NodeKind::PitchShift,
        to: NodeKind::Render,
    },
];

/// Input side of the graph, driven by the device's input callback.
///
/// Downmixes each interleaved input frame to mono and queues it for the
/// render node.
pub struct CaptureNode {
    producer: CaptureProducer,
    channels: ChannelCount,
    gain: Sample,
}

impl CaptureNode {
    fn new(producer: CaptureProducer, channels: ChannelCount) -> Self {
        Self {
            producer,
            channels,
            gain: 1.0 / channels as Sample,
        }
    }

    /// Number of interleaved input channels expected
    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    /// Queue interleaved input frames.
    ///
    /// Real-time safe. Frames that do not fit in the ring are dropped; a
    /// trailing partial frame is ignored.
    pub fn capture<T>(&mut self, data: &[T])
    where
        T: ToSample<Sample> + Copy,
    {
        for frame in data.chunks_exact(self.channels) {
            let sum: Sample = frame
                .iter()
                .map(|&s| <T as ToSample<Sample>>::to_sample_(s))
                .sum();
            if self.producer.push(sum * self.gain).is_err() {
                // Render side is behind; it trims its own backlog
                break;
            }
        }
    }
}

/// Output side of the graph, driven by the device's output callback.
///
/// Owns the pitch stage. Rendering is a function of the captured frames and
/// the pitch parameter snapshot only; its single side effect is writing the
/// output buffer (and the level meter).
pub struct RenderNode {
    consumer: CaptureConsumer,
    pitch: Box<dyn Plugin>,
    channels: ChannelCount,
    max_block: Frames,
    max_backlog: usize,
    // Pre-allocated mono scratch buffers, `max_block` long
    mono_in: Vec<Sample>,
    mono_out: Vec<Sample>,
    meter: MeterWriter,
    frames_rendered: u64,
    underrun_frames: u64,
}

impl RenderNode {
    /// Number of interleaved output channels written
    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    /// Captured frames waiting to be rendered
    pub fn backlog(&self) -> usize {
        self.consumer.slots()
    }

    /// Fill an interleaved output buffer.
    ///
    /// Real-time safe: works in `max_block` chunks over pre-allocated
    /// buffers, never blocks. Missing captured audio renders as silence.
    pub fn render<T>(&mut self, data: &mut [T])
    where
        T: FromSample<Sample> + Copy,
    {
        self.trim_backlog();

        let mut input_peak: Sample = 0.0;
        let mut output_peak: Sample = 0.0;
        let silence = T::from_sample_(0.0);

        let chunk_len = self.max_block * self.channels;
        for chunk in data.chunks_mut(chunk_len) {
            let frames = chunk.len() / self.channels;

            let got = self.pop_captured(frames);
            self.mono_in[got..frames].fill(0.0);
            self.underrun_frames += (frames - got) as u64;

            input_peak = self.mono_in[..frames]
                .iter()
                .fold(input_peak, |max, &s| max.max(s.abs()));

            {
                let inputs: [&[Sample]; 1] = [&self.mono_in[..frames]];
                let mut outputs: [&mut [Sample]; 1] = [&mut self.mono_out[..frames]];
                let mut audio = AudioBuffer {
                    inputs: &inputs,
                    outputs: &mut outputs,
                    frames,
                };
                if self.pitch.process(&mut audio).is_err() {
                    self.mono_out[..frames].fill(0.0);
                }
            }

            for (frame, &sample) in chunk
                .chunks_exact_mut(self.channels)
                .zip(&self.mono_out[..frames])
            {
                output_peak = output_peak.max(sample.abs());
                frame.fill(T::from_sample_(sample));
            }

            // Trailing partial frame, if the device handed us one
            chunk[frames * self.channels..].fill(silence);
            self.frames_rendered += frames as u64;
        }

        self.meter.publish(Levels {
            input_peak,
            output_peak,
            frames_rendered: self.frames_rendered,
            underrun_frames: self.underrun_frames,
        });
    }

    /// Copy up to `frames` captured samples into `mono_in`
    fn pop_captured(&mut self, frames: Frames) -> usize {
        let wanted = frames.min(self.consumer.slots());
        if wanted == 0 {
            return 0;
        }
        match self.consumer.read_chunk(wanted) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                self.mono_in[..first.len()].copy_from_slice(first);
                self.mono_in[first.len()..first.len() + second.len()].copy_from_slice(second);
                chunk.commit_all();
                wanted
            }
            Err(_) => 0,
        }
    }

    /// Drop the oldest captured audio beyond the latency bound
    fn trim_backlog(&mut self) {
        let backlog = self.consumer.slots();
        if backlog > self.max_backlog {
            if let Ok(chunk) = self.consumer.read_chunk(backlog - self.max_backlog) {
                chunk.commit_all();
            }
        }
    }
}

/// A fully wired capture -> pitch -> render instance, not yet attached to
/// any device
pub struct WiredGraph {
    format: AudioFormat,
    capture: CaptureNode,
    render: RenderNode,
}

impl WiredGraph {
    /// Construct and connect all three nodes for `format`.
    ///
    /// Allocates everything the render path will ever need. Either every node
    /// is built and connected, or an error is returned and nothing is kept.
    pub fn wire(
        format: AudioFormat,
        config: &AudioConfig,
        pitch: Arc<PitchParameter>,
    ) -> Result<(Self, MeterReader), GraphError> {
        format.validate()?;

        let mut shifter = builtin::create_builtin("pitch_shift", pitch, config.grain_ms)
            .ok_or_else(|| GraphError::GraphBuildFailed("pitch shifter unavailable".to_string()))?;
        shifter
            .initialize(format.sample_rate, format.max_block_frames)
            .map_err(|e| GraphError::GraphBuildFailed(e.to_string()))?;

        let max_backlog = format
            .frames_for_ms(config.max_latency_ms)
            .max(format.max_block_frames);
        // Headroom so capture bursts are trimmed by the render side, not dropped
        let capacity = max_backlog + format.max_block_frames * 4;
        let (producer, consumer) = create_capture_ring(capacity);
        let (meter, meter_reader) = create_meter();

        let capture = CaptureNode::new(producer, format.input_channels);
        let render = RenderNode {
            consumer,
            pitch: shifter,
            channels: format.output_channels,
            max_block: format.max_block_frames,
            max_backlog,
            mono_in: vec![0.0; format.max_block_frames],
            mono_out: vec![0.0; format.max_block_frames],
            meter,
            frames_rendered: 0,
            underrun_frames: 0,
        };

        tracing::debug!(
            "Wired graph: {} Hz, {} in -> mono -> {} out, block {}, backlog limit {} frames",
            format.sample_rate,
            format.input_channels,
            format.output_channels,
            format.max_block_frames,
            max_backlog
        );

        Ok((
            Self {
                format,
                capture,
                render,
            },
            meter_reader,
        ))
    }

    /// Format this instance was wired for
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Connections in processing order
    pub fn connections(&self) -> &'static [Connection] {
        &TOPOLOGY
    }

    /// Split into the input-callback and output-callback halves
    pub fn into_nodes(self) -> (CaptureNode, RenderNode) {
        (self.capture, self.render)
    }
}

/// A wired graph attached to open device streams
struct LiveGraph<S> {
    build: u64,
    format: AudioFormat,
    streams: S,
    meter: MeterReader,
    playing: bool,
}

/// Hosts the live graph on top of a device backend.
///
/// Owns the device handles while a graph is built. Only the control thread
/// touches this type; the render path only ever sees the nodes moved into
/// the device callbacks.
pub struct AudioGraph<B: AudioBackend> {
    backend: B,
    config: AudioConfig,
    pitch: Arc<PitchParameter>,
    live: Option<LiveGraph<B::Streams>>,
    builds: u64,
}

impl<B: AudioBackend> AudioGraph<B> {
    /// Create an empty host; nothing is wired until [`build`](Self::build)
    pub fn new(backend: B, config: AudioConfig, pitch: Arc<PitchParameter>) -> Self {
        Self {
            backend,
            config,
            pitch,
            live: None,
            builds: 0,
        }
    }

    /// Ask the backend for the current device format
    pub fn negotiate_format(&mut self) -> Result<AudioFormat, GraphError> {
        self.backend.negotiate_format(&self.config)
    }

    /// Wire the graph for `format` and open (but not start) the devices.
    ///
    /// No-op if a graph is already built.
    pub fn build(&mut self, format: AudioFormat) -> Result<(), GraphError> {
        if self.live.is_some() {
            tracing::debug!("Graph already built, keeping it");
            return Ok(());
        }
        let live = self.open_live(format)?;
        self.live = Some(live);
        Ok(())
    }

    /// Begin device I/O on the built graph
    pub fn start_io(&mut self) -> Result<(), GraphError> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| GraphError::GraphBuildFailed("no graph built".to_string()))?;
        if !live.playing {
            live.streams.play()?;
            live.playing = true;
            tracing::info!("Device I/O started");
        }
        Ok(())
    }

    /// Halt device I/O and release every node. Idempotent.
    pub fn teardown(&mut self) {
        if let Some(live) = self.live.take() {
            Self::release(live);
            tracing::info!("Graph torn down");
        }
    }

    /// Replace the live graph with one wired for `format`.
    ///
    /// The new graph is wired and its devices opened before the old one is
    /// touched. On error the old graph keeps running unchanged.
    pub fn rebuild(&mut self, format: AudioFormat) -> Result<(), GraphError> {
        let was_playing = self.live.as_ref().is_some_and(|live| live.playing);
        let fresh = self.open_live(format)?;

        if let Some(old) = self.live.replace(fresh) {
            Self::release(old);
        }
        tracing::info!("Graph rebuilt for {} Hz", format.sample_rate);

        if was_playing {
            self.start_io()?;
        }
        Ok(())
    }

    /// Whether a graph is currently built
    pub fn is_built(&self) -> bool {
        self.live.is_some()
    }

    /// Whether device I/O is running
    pub fn is_playing(&self) -> bool {
        self.live.as_ref().is_some_and(|live| live.playing)
    }

    /// Format of the live graph
    pub fn format(&self) -> Option<AudioFormat> {
        self.live.as_ref().map(|live| live.format)
    }

    /// Number of graphs wired and opened since creation
    pub fn build_count(&self) -> u64 {
        self.builds
    }

    /// Build number of the live graph (the first graph built is 1)
    pub fn live_build(&self) -> Option<u64> {
        self.live.as_ref().map(|live| live.build)
    }

    /// Latest render-side levels of the live graph
    pub fn levels(&mut self) -> Option<Levels> {
        self.live.as_mut().map(|live| live.meter.latest())
    }

    /// Shared pitch parameter read by every graph this host builds
    pub fn pitch(&self) -> &Arc<PitchParameter> {
        &self.pitch
    }

    /// The device backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn open_live(&mut self, format: AudioFormat) -> Result<LiveGraph<B::Streams>, GraphError> {
        let (wired, meter) = WiredGraph::wire(format, &self.config, Arc::clone(&self.pitch))?;
        let build = self.builds + 1;
        let streams = self.backend.open(wired, build)?;
        self.builds = build;
        Ok(LiveGraph {
            build,
            format,
            streams,
            meter,
            playing: false,
        })
    }

    fn release(live: LiveGraph<B::Streams>) {
        // Pausing lets in-flight callbacks finish before the nodes are dropped
        if let Err(e) = live.streams.pause() {
            tracing::warn!("Failed to pause streams during teardown: {}", e);
        }
        drop(live);
    }
}

impl<B: AudioBackend> Drop for AudioGraph<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualBackend;

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 48000,
            input_channels: 2,
            output_channels: 2,
            max_block_frames: 64,
        }
    }

    fn wire(pitch: f32) -> (CaptureNode, RenderNode, MeterReader) {
        let (graph, meter) = WiredGraph::wire(
            format(),
            &AudioConfig::default(),
            Arc::new(PitchParameter::new(pitch)),
        )
        .unwrap();
        let (capture, render) = graph.into_nodes();
        (capture, render, meter)
    }

    #[test]
    fn test_topology_is_capture_pitch_render() {
        let (graph, _meter) = WiredGraph::wire(
            format(),
            &AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        )
        .unwrap();
        let conns = graph.connections();
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].from, NodeKind::Capture);
        assert_eq!(conns[0].to, NodeKind::PitchShift);
        assert_eq!(conns[1].from, NodeKind::PitchShift);
        assert_eq!(conns[1].to, NodeKind::Render);
    }

    #[test]
    fn test_wire_rejects_bad_format() {
        let bad = AudioFormat {
            input_channels: 0,
            ..format()
        };
        let result = WiredGraph::wire(bad, &AudioConfig::default(), Arc::new(PitchParameter::default()));
        assert!(matches!(result, Err(GraphError::FormatNegotiationFailed(_))));
    }

    #[test]
    fn test_passthrough_at_zero_shift() {
        let (mut capture, mut render, mut meter) = wire(0.0);

        // Stereo input: L = 0.5, R = 0.25 -> mono 0.375
        let input: Vec<f32> = (0..64).flat_map(|_| [0.5, 0.25]).collect();
        capture.capture(&input);

        let mut output = vec![0.0_f32; 128];
        render.render(&mut output);

        assert!(output.iter().all(|&s| (s - 0.375).abs() < 1e-6));
        let levels = meter.latest();
        assert_eq!(levels.frames_rendered, 64);
        assert_eq!(levels.underrun_frames, 0);
        assert!((levels.output_peak - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_underrun_renders_silence() {
        let (mut capture, mut render, mut meter) = wire(0.0);
        capture.capture(&[1.0_f32, 1.0, 1.0, 1.0]); // two frames

        let mut output = vec![0.5_f32; 16]; // eight frames
        render.render(&mut output);

        assert_eq!(&output[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert!(output[4..].iter().all(|&s| s == 0.0));
        assert_eq!(meter.latest().underrun_frames, 6);
    }

    #[test]
    fn test_large_device_buffers_are_chunked() {
        let (mut capture, mut render, _meter) = wire(0.0);
        let input = vec![0.25_f32; 2 * 300];
        capture.capture(&input);

        // 300 frames with a 64-frame block
        let mut output = vec![0.0_f32; 2 * 300];
        render.render(&mut output);
        assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_backlog_is_bounded() {
        let (mut capture, mut render, _meter) = wire(0.0);
        let limit = format().frames_for_ms(AudioConfig::default().max_latency_ms);

        // Far more than the latency bound, in ring-sized bursts
        for _ in 0..10 {
            capture.capture(&vec![0.1_f32; 2 * 1000]);
            let mut output = vec![0.0_f32; 2];
            render.render(&mut output);
            assert!(render.backlog() <= limit);
        }
    }

    #[test]
    fn test_integer_samples_convert() {
        let (mut capture, mut render, _meter) = wire(0.0);
        capture.capture(&[i16::MAX, i16::MAX]);
        let mut output = [0_i16; 2];
        render.render(&mut output);
        assert!(output[0] > i16::MAX - 4);
    }

    #[test]
    fn test_build_is_idempotent_and_teardown_releases() {
        let (backend, device) = VirtualBackend::new(Some(format()));
        let mut graph = AudioGraph::new(
            backend,
            AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        );

        let fmt = graph.negotiate_format().unwrap();
        graph.build(fmt).unwrap();
        graph.build(fmt).unwrap();
        assert_eq!(graph.build_count(), 1);
        assert_eq!(device.open_graphs(), 1);
        assert!(!graph.is_playing());

        graph.start_io().unwrap();
        assert!(graph.is_playing());

        graph.teardown();
        graph.teardown();
        assert!(!graph.is_built());
        assert_eq!(device.open_graphs(), 0);
    }

    #[test]
    fn test_start_io_requires_graph() {
        let (backend, _device) = VirtualBackend::new(Some(format()));
        let mut graph = AudioGraph::new(
            backend,
            AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        );
        assert!(matches!(graph.start_io(), Err(GraphError::GraphBuildFailed(_))));
    }

    #[test]
    fn test_failed_rebuild_keeps_old_graph() {
        let (backend, device) = VirtualBackend::new(Some(format()));
        let mut graph = AudioGraph::new(
            backend,
            AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        );
        graph.build(format()).unwrap();
        graph.start_io().unwrap();

        device.fail_next_open(GraphError::DeviceUnavailable("unplugged".to_string()));
        let new_format = AudioFormat {
            sample_rate: 44100,
            ..format()
        };
        assert!(graph.rebuild(new_format).is_err());

        assert_eq!(graph.format(), Some(format()));
        assert!(graph.is_playing());
        assert_eq!(device.open_graphs(), 1);

        // Still renders
        let mut out = vec![0.0_f32; 8];
        assert!(device.pump(&[0.5; 8], &mut out));
    }

    #[test]
    fn test_rebuild_swaps_and_keeps_playing() {
        let (backend, device) = VirtualBackend::new(Some(format()));
        let mut graph = AudioGraph::new(
            backend,
            AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        );
        graph.build(format()).unwrap();
        graph.start_io().unwrap();

        let new_format = AudioFormat {
            sample_rate: 44100,
            output_channels: 1,
            ..format()
        };
        graph.rebuild(new_format).unwrap();

        assert_eq!(graph.format(), Some(new_format));
        assert!(graph.is_playing());
        assert_eq!(graph.build_count(), 2);
        assert_eq!(graph.live_build(), Some(2));
        assert_eq!(device.open_graphs(), 1);
    }

    #[test]
    fn test_build_numbers_skip_failed_opens() {
        let (backend, device) = VirtualBackend::new(Some(format()));
        let mut graph = AudioGraph::new(
            backend,
            AudioConfig::default(),
            Arc::new(PitchParameter::default()),
        );
        assert_eq!(graph.live_build(), None);

        device.fail_next_open(GraphError::DeviceUnavailable("unplugged".to_string()));
        assert!(graph.build(format()).is_err());
        graph.build(format()).unwrap();
        assert_eq!(graph.live_build(), Some(1));
        assert_eq!(
            device.stream_failure(),
            Some(vocalbind_comms::PlatformEvent::StreamFailed { graph: 1 })
        );

        graph.teardown();
        assert_eq!(graph.live_build(), None);
    }
}
