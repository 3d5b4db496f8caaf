//! Device backends - where a wired graph meets real (or virtual) hardware.
//!
//! [`CpalBackend`] opens the default input and output devices through cpal.
//! [`VirtualBackend`] keeps the nodes in memory and lets a caller pump audio
//! through them by hand, for headless runs and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use crossbeam_channel::Sender;
use dasp::sample::{FromSample, ToSample};
use parking_lot::Mutex;
use smallvec::SmallVec;
use vocalbind_comms::PlatformEvent;
use vocalbind_core::{Sample, SampleRate};

use crate::graph::{CaptureNode, GraphError, RenderNode, WiredGraph};
use crate::{AudioConfig, AudioFormat};

/// Handles to open device streams
pub trait ActiveStreams {
    /// Begin (or resume) device I/O
    fn play(&self) -> Result<(), GraphError>;
    /// Halt device I/O; in-flight callbacks complete before this returns
    fn pause(&self) -> Result<(), GraphError>;
}

/// Source of device formats and streams for [`AudioGraph`](crate::AudioGraph)
pub trait AudioBackend {
    type Streams: ActiveStreams;

    /// Query the current devices for a format both sides can run at
    fn negotiate_format(&mut self, config: &AudioConfig) -> Result<AudioFormat, GraphError>;

    /// Attach a wired graph to the devices. Streams come back paused.
    ///
    /// `build` is the graph's build number; stream failures are reported as
    /// [`PlatformEvent::StreamFailed`] carrying it.
    fn open(&mut self, graph: WiredGraph, build: u64) -> Result<Self::Streams, GraphError>;
}

/// Backend on the default cpal host
pub struct CpalBackend {
    host: cpal::Host,
    platform_tx: Option<Sender<PlatformEvent>>,
    negotiated: Option<Negotiated>,
}

/// Devices and stream configs picked by the last negotiation
struct Negotiated {
    input: cpal::Device,
    output: cpal::Device,
    input_config: cpal::StreamConfig,
    input_format: SampleFormat,
    output_config: cpal::StreamConfig,
    output_format: SampleFormat,
}

impl CpalBackend {
    /// Backend on the default host. Stream failures are forwarded to
    /// `platform_tx` as [`PlatformEvent::StreamFailed`] when given.
    pub fn new(platform_tx: Option<Sender<PlatformEvent>>) -> Self {
        let host = cpal::default_host();
        tracing::debug!("Using audio host: {}", host.id().name());
        Self {
            host,
            platform_tx,
            negotiated: None,
        }
    }

    /// Output config at `rate`, preferring the device's default layout and f32
    fn pick_output_config(
        output: &cpal::Device,
        rate: SampleRate,
    ) -> Result<cpal::SupportedStreamConfig, GraphError> {
        let default = output
            .default_output_config()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))?;
        if default.sample_rate().0 == rate {
            return Ok(default);
        }

        let ranges: SmallVec<[cpal::SupportedStreamConfigRange; 8]> = output
            .supported_output_configs()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))?
            .filter(|range| {
                range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0
            })
            .collect();

        let score = |range: &cpal::SupportedStreamConfigRange| {
            u8::from(range.channels() == default.channels()) * 2
                + u8::from(range.sample_format() == SampleFormat::F32)
        };

        ranges
            .iter()
            .max_by_key(|range| score(range))
            .map(|range| range.with_sample_rate(cpal::SampleRate(rate)))
            .ok_or_else(|| {
                GraphError::FormatNegotiationFailed(format!(
                    "output device does not support {rate} Hz"
                ))
            })
    }

    fn buffer_size(
        supported: &cpal::SupportedBufferSize,
        block: usize,
    ) -> cpal::BufferSize {
        match supported {
            cpal::SupportedBufferSize::Range { min, max }
                if (*min as usize..=*max as usize).contains(&block) =>
            {
                cpal::BufferSize::Fixed(block as u32)
            }
            _ => cpal::BufferSize::Default,
        }
    }
}

impl AudioBackend for CpalBackend {
    type Streams = CpalStreams;

    fn negotiate_format(&mut self, config: &AudioConfig) -> Result<AudioFormat, GraphError> {
        let input = self
            .host
            .default_input_device()
            .ok_or_else(|| GraphError::DeviceUnavailable("no input device".to_string()))?;
        let output = self
            .host
            .default_output_device()
            .ok_or_else(|| GraphError::DeviceUnavailable("no output device".to_string()))?;

        tracing::info!(
            "Using input device: {}",
            input.name().unwrap_or_else(|_| "<unnamed>".to_string())
        );
        tracing::info!(
            "Using output device: {}",
            output.name().unwrap_or_else(|_| "<unnamed>".to_string())
        );

        let input_supported = input
            .default_input_config()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))?;
        let rate = input_supported.sample_rate().0;
        let output_supported = Self::pick_output_config(&output, rate)?;

        let mut input_config = input_supported.config();
        input_config.buffer_size = Self::buffer_size(input_supported.buffer_size(), config.block_size);
        let mut output_config = output_supported.config();
        output_config.buffer_size =
            Self::buffer_size(output_supported.buffer_size(), config.block_size);

        tracing::debug!("Input stream config: {:?}", input_config);
        tracing::debug!("Output stream config: {:?}", output_config);

        let format = AudioFormat {
            sample_rate: rate,
            input_channels: usize::from(input_config.channels),
            output_channels: usize::from(output_config.channels),
            max_block_frames: config.block_size,
        };
        format.validate()?;

        self.negotiated = Some(Negotiated {
            input,
            output,
            input_config,
            input_format: input_supported.sample_format(),
            output_config,
            output_format: output_supported.sample_format(),
        });
        Ok(format)
    }

    fn open(&mut self, graph: WiredGraph, build: u64) -> Result<CpalStreams, GraphError> {
        let negotiated = self.negotiated.as_ref().ok_or_else(|| {
            GraphError::GraphBuildFailed("open called before format negotiation".to_string())
        })?;
        if graph.format().sample_rate != negotiated.input_config.sample_rate.0 {
            return Err(GraphError::FormatNegotiationFailed(
                "graph format differs from negotiated device format".to_string(),
            ));
        }

        let (capture, render) = graph.into_nodes();

        let on_input_error = stream_error_callback(self.platform_tx.clone(), "input", build);
        let input = match negotiated.input_format {
            SampleFormat::F32 => build_input::<f32>(negotiated, capture, on_input_error),
            SampleFormat::I16 => build_input::<i16>(negotiated, capture, on_input_error),
            SampleFormat::U16 => build_input::<u16>(negotiated, capture, on_input_error),
            other => {
                return Err(GraphError::FormatNegotiationFailed(format!(
                    "unsupported input sample format {other:?}"
                )));
            }
        }
        .map_err(map_build_error)?;

        let on_output_error = stream_error_callback(self.platform_tx.clone(), "output", build);
        let output = match negotiated.output_format {
            SampleFormat::F32 => build_output::<f32>(negotiated, render, on_output_error),
            SampleFormat::I16 => build_output::<i16>(negotiated, render, on_output_error),
            SampleFormat::U16 => build_output::<u16>(negotiated, render, on_output_error),
            other => {
                return Err(GraphError::FormatNegotiationFailed(format!(
                    "unsupported output sample format {other:?}"
                )));
            }
        }
        .map_err(map_build_error)?;

        // Some hosts start streams on creation
        let streams = CpalStreams { input, output };
        streams.pause()?;
        Ok(streams)
    }
}

fn build_input<T>(
    negotiated: &Negotiated,
    mut capture: CaptureNode,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + ToSample<Sample>,
{
    negotiated.input.build_input_stream(
        &negotiated.input_config,
        // REAL-TIME SAFE: ring push only
        move |data: &[T], _: &cpal::InputCallbackInfo| capture.capture(data),
        on_error,
        None,
    )
}

fn build_output<T>(
    negotiated: &Negotiated,
    mut render: RenderNode,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<Sample>,
{
    negotiated.output.build_output_stream(
        &negotiated.output_config,
        // REAL-TIME SAFE: pre-allocated buffers, no locks, no tracing
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| render.render(data),
        on_error,
        None,
    )
}

fn stream_error_callback(
    tx: Option<Sender<PlatformEvent>>,
    side: &'static str,
    build: u64,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        tracing::error!("Audio {} stream error (graph #{}): {}", side, build, err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            if let Some(tx) = &tx {
                let _ = tx.send(PlatformEvent::StreamFailed { graph: build });
            }
        }
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> GraphError {
    match err {
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => {
            GraphError::FormatNegotiationFailed(err.to_string())
        }
        _ => GraphError::DeviceUnavailable(err.to_string()),
    }
}

/// Open cpal input and output streams
pub struct CpalStreams {
    input: cpal::Stream,
    output: cpal::Stream,
}

impl ActiveStreams for CpalStreams {
    fn play(&self) -> Result<(), GraphError> {
        // Output first so the ring never fills before anyone drains it
        self.output
            .play()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))?;
        self.input
            .play()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))
    }

    fn pause(&self) -> Result<(), GraphError> {
        self.input
            .pause()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))?;
        self.output
            .pause()
            .map_err(|e| GraphError::DeviceUnavailable(e.to_string()))
    }
}

/// Name, native rate and channel count of one default device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFingerprint {
    pub name: String,
    pub sample_rate: SampleRate,
    pub channels: u16,
}

impl EndpointFingerprint {
    fn of(device: &cpal::Device, config: &cpal::SupportedStreamConfig) -> Self {
        Self {
            name: device.name().unwrap_or_default(),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        }
    }
}

/// What the watcher compares between polls: both default devices.
///
/// The engine needs both sides, so the pair only exists while both are
/// present; losing either one reads as a lost device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub input: EndpointFingerprint,
    pub output: EndpointFingerprint,
}

impl DeviceFingerprint {
    fn take(host: &cpal::Host) -> Option<Self> {
        let input = host.default_input_device()?;
        let input_config = input.default_input_config().ok()?;
        let output = host.default_output_device()?;
        let output_config = output.default_output_config().ok()?;
        Some(Self {
            input: EndpointFingerprint::of(&input, &input_config),
            output: EndpointFingerprint::of(&output, &output_config),
        })
    }
}

/// Platform event implied by two consecutive fingerprints
pub fn classify(
    previous: Option<&DeviceFingerprint>,
    next: Option<&DeviceFingerprint>,
) -> Option<PlatformEvent> {
    match (previous, next) {
        (None, Some(_)) => Some(PlatformEvent::DeviceReconnected),
        (Some(_), None) => Some(PlatformEvent::DeviceLost),
        (Some(a), Some(b)) if a != b => Some(PlatformEvent::DeviceChanged),
        _ => None,
    }
}

/// Background thread polling the default input and output devices for
/// changes
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Granularity of the stop check while sleeping between polls
    const SLEEP_SLICE: Duration = Duration::from_millis(50);

    /// Start polling every `interval`, sending changes to `tx`
    pub fn spawn(interval: Duration, tx: Sender<PlatformEvent>) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("vocalbind-device-watcher".to_string())
            .spawn(move || {
                // cpal hosts are not Send on every platform; own one per thread
                let host = cpal::default_host();
                let mut previous = DeviceFingerprint::take(&host);
                tracing::debug!("Device watcher started: {:?}", previous);

                while !stop_flag.load(Ordering::Acquire) {
                    let mut slept = Duration::ZERO;
                    while slept < interval && !stop_flag.load(Ordering::Acquire) {
                        std::thread::sleep(Self::SLEEP_SLICE);
                        slept += Self::SLEEP_SLICE;
                    }
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }

                    let next = DeviceFingerprint::take(&host);
                    if let Some(event) = classify(previous.as_ref(), next.as_ref()) {
                        tracing::info!("Device watcher: {:?} ({:?})", event, next);
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    previous = next;
                }
                tracing::debug!("Device watcher stopped");
            })
            .context("Failed to spawn device watcher thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop polling and join the thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Device watcher thread panicked");
            }
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Nodes of one graph opened on the virtual device
struct VirtualNodes {
    id: u64,
    build: u64,
    capture: CaptureNode,
    render: RenderNode,
    playing: bool,
}

#[derive(Default)]
struct VirtualState {
    format: Option<AudioFormat>,
    fail_next_open: Option<GraphError>,
    next_id: u64,
    active: Vec<VirtualNodes>,
}

/// In-memory backend: no hardware, audio is pushed through by
/// [`VirtualDevice::pump`]
pub struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
}

/// Test-side handle of a [`VirtualBackend`]: plug, unplug, inject failures,
/// move audio
#[derive(Clone)]
pub struct VirtualDevice {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualBackend {
    /// Backend plus its controller. `format` of `None` means no device.
    pub fn new(format: Option<AudioFormat>) -> (Self, VirtualDevice) {
        let state = Arc::new(Mutex::new(VirtualState {
            format,
            ..VirtualState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            VirtualDevice { state },
        )
    }
}

impl AudioBackend for VirtualBackend {
    type Streams = VirtualStreams;

    fn negotiate_format(&mut self, config: &AudioConfig) -> Result<AudioFormat, GraphError> {
        let state = self.state.lock();
        let format = state
            .format
            .ok_or_else(|| GraphError::DeviceUnavailable("no virtual device".to_string()))?;
        Ok(AudioFormat {
            max_block_frames: config.block_size,
            ..format
        })
    }

    fn open(&mut self, graph: WiredGraph, build: u64) -> Result<VirtualStreams, GraphError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        if state.format.is_none() {
            return Err(GraphError::DeviceUnavailable("no virtual device".to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;
        let (capture, render) = graph.into_nodes();
        state.active.push(VirtualNodes {
            id,
            build,
            capture,
            render,
            playing: false,
        });

        Ok(VirtualStreams {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

impl VirtualDevice {
    /// Change the device format; `None` unplugs it
    pub fn set_format(&self, format: Option<AudioFormat>) {
        self.state.lock().format = format;
    }

    /// Make the next `open` fail with `err`
    pub fn fail_next_open(&self, err: GraphError) {
        self.state.lock().fail_next_open = Some(err);
    }

    /// Number of graphs currently attached
    pub fn open_graphs(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Whether any attached graph is running
    pub fn is_playing(&self) -> bool {
        self.state.lock().active.iter().any(|nodes| nodes.playing)
    }

    /// The notification a failing stream of the most recently attached
    /// graph would raise, or `None` with nothing attached
    pub fn stream_failure(&self) -> Option<PlatformEvent> {
        self.state
            .lock()
            .active
            .last()
            .map(|nodes| PlatformEvent::StreamFailed { graph: nodes.build })
    }

    /// Run one device period: feed interleaved `input` to the playing graph
    /// and render into interleaved `output`. Returns false (and leaves
    /// `output` untouched) when nothing is playing.
    pub fn pump(&self, input: &[f32], output: &mut [f32]) -> bool {
        let mut state = self.state.lock();
        match state.active.iter_mut().rev().find(|nodes| nodes.playing) {
            Some(nodes) => {
                nodes.capture.capture(input);
                nodes.render.render(output);
                true
            }
            None => false,
        }
    }
}

/// Streams of one graph on the virtual device. Dropping them detaches the
/// graph.
pub struct VirtualStreams {
    id: u64,
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualStreams {
    fn set_playing(&self, playing: bool) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        let nodes = state
            .active
            .iter_mut()
            .find(|nodes| nodes.id == self.id)
            .ok_or_else(|| GraphError::DeviceUnavailable("virtual stream detached".to_string()))?;
        nodes.playing = playing;
        Ok(())
    }
}

impl ActiveStreams for VirtualStreams {
    fn play(&self) -> Result<(), GraphError> {
        self.set_playing(true)
    }

    fn pause(&self) -> Result<(), GraphError> {
        self.set_playing(false)
    }
}

impl Drop for VirtualStreams {
    fn drop(&mut self) {
        self.state.lock().active.retain(|nodes| nodes.id != self.id);
    }
}
