//! Lockless communication primitives for audio-thread-safe communication.
//!
//! This crate provides the pieces that cross thread boundaries:
//!
//! - [`PitchParameter`]: the only state the render thread reads
//! - the capture ring: a wait-free SPSC queue from the input callback to the
//!   output callback
//! - [`meter`]: render-side level snapshots for the control thread
//! - control, platform and engine event channels for the control thread

pub mod meter;
pub mod parameter;

pub use rtrb;
pub use triple_buffer;

pub use meter::{Levels, MeterReader, MeterWriter, create_meter};
pub use parameter::{PITCH_PARAM_ID, PitchParameter};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use vocalbind_core::{ActivePreset, EngineState, ErrorKind, PresetName, Sample};

/// Events produced by the control surface (menu, hotkeys, settings dialog)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlEvent {
    /// Switch to a named preset
    SelectPreset(PresetName),
    /// Set an arbitrary semitone value
    SetCustom(f32),
    /// Change the stored value of a configurable preset
    UpdatePresetValue(PresetName, f32),
    /// Re-read preset values from the settings store
    ReloadSettings,
    /// Start audio processing
    Start,
    /// Stop audio processing
    Stop,
    /// Answer with an [`EngineEvent::Status`] snapshot
    ReportStatus,
    /// Stop and leave the event loop
    Shutdown,
}

/// Notifications from the platform audio/OS layer.
///
/// Device and permission notifications carry no payload: each one means
/// "something changed, re-evaluate". Stream failures name the graph whose
/// stream failed so that a late error from a replaced graph can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Default device or its native format changed
    DeviceChanged,
    /// The device in use disappeared
    DeviceLost,
    /// A stream of the graph with this build number reported its device gone
    StreamFailed {
        /// Build number of the graph that owned the stream
        graph: u64,
    },
    /// A usable device is available again
    DeviceReconnected,
    /// Microphone permission was granted, revoked or answered
    PermissionChanged,
}

/// Events sent from the engine back to the control surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// Lifecycle transition
    StateChanged {
        /// Previous state
        from: EngineState,
        /// New state
        to: EngineState,
    },
    /// A preset or custom value now drives the pitch parameter
    PresetApplied {
        /// The active selection
        active: ActivePreset,
        /// The semitone value published to the render path
        semitones: f32,
    },
    /// A failure was recorded as the last error
    Error(ErrorKind),
    /// Answer to [`ControlEvent::ReportStatus`]
    Status {
        /// Lifecycle state
        state: EngineState,
        /// The active selection
        active: ActivePreset,
        /// Current pitch parameter value
        semitones: f32,
        /// Most recent failure, if any
        last_error: Option<ErrorKind>,
    },
}

/// Producer half of the capture ring (input callback)
pub type CaptureProducer = rtrb::Producer<Sample>;
/// Consumer half of the capture ring (output callback)
pub type CaptureConsumer = rtrb::Consumer<Sample>;

/// Create the ring carrying mono captured samples to the render node
pub fn create_capture_ring(capacity: usize) -> (CaptureProducer, CaptureConsumer) {
    rtrb::RingBuffer::new(capacity)
}

/// Create the channel set linking a control surface and the engine
pub fn create_channels(event_capacity: usize) -> (SurfaceChannels, EngineChannels) {
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let (platform_tx, platform_rx) = crossbeam_channel::unbounded();
    let (event_tx, event_rx) = crossbeam_channel::bounded(event_capacity);

    let surface = SurfaceChannels {
        control_tx,
        platform_tx: platform_tx.clone(),
        event_rx,
    };

    let engine = EngineChannels {
        control_rx,
        platform_rx,
        platform_tx,
        events: EventSender { tx: event_tx },
    };

    (surface, engine)
}

/// Channels for the control surface (sends events, receives engine events)
pub struct SurfaceChannels {
    /// Control events (surface -> engine)
    pub control_tx: Sender<ControlEvent>,
    /// Platform notifications (platform layer -> engine)
    pub platform_tx: Sender<PlatformEvent>,
    /// Engine events (engine -> surface)
    pub event_rx: Receiver<EngineEvent>,
}

/// Channels for the engine's control loop
pub struct EngineChannels {
    /// Control events (surface -> engine)
    pub control_rx: Receiver<ControlEvent>,
    /// Platform notifications (platform layer -> engine)
    pub platform_rx: Receiver<PlatformEvent>,
    /// Extra sender handed to device backends and watchers
    pub platform_tx: Sender<PlatformEvent>,
    /// Engine events (engine -> surface)
    pub events: EventSender,
}

/// Non-blocking sender for engine events.
///
/// A slow or absent surface never stalls the engine: events that do not fit
/// are dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
}

impl EventSender {
    /// Wrap an existing sender
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Send without blocking; returns false if the event was dropped
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }
}
