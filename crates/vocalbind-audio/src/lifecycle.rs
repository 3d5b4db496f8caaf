//! Engine lifecycle.
//!
//! ```text
//! Stopped -> Starting -> Running -> Reconfiguring -> Running
//!     ^         |           |            |
//!     |         v           v            v
//!     +----- Failed(kind) <--------------+
//! ```
//!
//! Only `Failed(DeviceUnavailable)` is retried without being asked: a
//! device-reconnected or device-changed notification starts the engine
//! again. A permission refusal latches until a permission-changed
//! notification arrives. Stream failures only count against the graph that
//! raised them.

use vocalbind_comms::{EngineEvent, EventSender, Levels, PlatformEvent};
use vocalbind_core::{EngineState, ErrorKind};

use crate::AudioFormat;
use crate::device::AudioBackend;
use crate::graph::{AudioGraph, GraphError};
use crate::permission::{PermissionGate, PermissionStatus};

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// The permission prompt has not been answered; the start request is
    /// retried when it is
    #[error("Microphone permission pending")]
    PermissionPending,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl EngineError {
    /// Category recorded as `lastError`, if this error is a failure
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::PermissionDenied => Some(ErrorKind::PermissionDenied),
            Self::PermissionPending => None,
            Self::Graph(err) => Some(err.kind()),
        }
    }
}

/// State machine owning the audio graph
pub struct EngineLifecycle<B: AudioBackend> {
    graph: AudioGraph<B>,
    gate: Box<dyn PermissionGate>,
    state: EngineState,
    last_error: Option<ErrorKind>,
    /// Set on a denial; cleared only by a permission-changed notification
    permission_latched: bool,
    /// A start attempt is waiting on a pending permission prompt
    start_requested: bool,
    events: Option<EventSender>,
}

impl<B: AudioBackend> EngineLifecycle<B> {
    pub fn new(graph: AudioGraph<B>, gate: Box<dyn PermissionGate>) -> Self {
        Self {
            graph,
            gate,
            state: EngineState::Stopped,
            last_error: None,
            permission_latched: false,
            start_requested: false,
            events: None,
        }
    }

    /// Publish state changes and errors to `events`
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Most recent failure; survives `stop()`, cleared by a successful start
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Graphs built since creation
    pub fn graphs_built(&self) -> u64 {
        self.graph.build_count()
    }

    /// Format of the live graph
    pub fn format(&self) -> Option<AudioFormat> {
        self.graph.format()
    }

    /// Latest render-side levels
    pub fn levels(&mut self) -> Option<Levels> {
        self.graph.levels()
    }

    pub fn graph(&self) -> &AudioGraph<B> {
        &self.graph
    }

    /// Bring the engine to Running.
    ///
    /// No-op while Starting, Running or Reconfiguring.
    ///
    /// # Errors
    ///
    /// [`EngineError::PermissionDenied`] if microphone access is refused (or
    /// still latched from an earlier refusal), [`EngineError::PermissionPending`]
    /// while the prompt is unanswered, [`EngineError::Graph`] if the devices
    /// cannot be opened or wired
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state.is_active() {
            tracing::debug!("start() ignored in state {}", self.state);
            return Ok(());
        }
        if self.permission_latched {
            tracing::warn!("start() refused: microphone permission still denied");
            self.fail(ErrorKind::PermissionDenied);
            return Err(EngineError::PermissionDenied);
        }

        self.transition(EngineState::Starting);

        match self.gate.check_or_request() {
            PermissionStatus::Granted => {}
            PermissionStatus::Denied => {
                self.permission_latched = true;
                self.start_requested = false;
                self.fail(ErrorKind::PermissionDenied);
                return Err(EngineError::PermissionDenied);
            }
            PermissionStatus::Pending => {
                tracing::info!("Microphone permission pending, start deferred");
                self.start_requested = true;
                self.transition(EngineState::Stopped);
                return Err(EngineError::PermissionPending);
            }
        }
        self.start_requested = false;

        if let Err(err) = self.bring_up() {
            tracing::warn!("Engine start failed: {}", err);
            self.graph.teardown();
            self.fail(err.kind());
            return Err(err.into());
        }

        self.last_error = None;
        self.transition(EngineState::Running);
        Ok(())
    }

    /// Halt I/O, release the graph, and return to Stopped. No-op from
    /// Stopped; from Failed it clears the failure but keeps `last_error`.
    pub fn stop(&mut self) {
        self.start_requested = false;
        if self.state == EngineState::Stopped {
            return;
        }
        self.graph.teardown();
        self.transition(EngineState::Stopped);
    }

    /// React to a platform notification
    pub fn handle_platform(&mut self, event: PlatformEvent) {
        tracing::debug!("Platform event {:?} in state {}", event, self.state);
        match event {
            PlatformEvent::DeviceChanged => self.on_device_changed(),
            PlatformEvent::DeviceLost => self.on_device_lost(),
            PlatformEvent::StreamFailed { graph } => self.on_stream_failed(graph),
            PlatformEvent::DeviceReconnected => self.on_device_reconnected(),
            PlatformEvent::PermissionChanged => self.on_permission_changed(),
        }
    }

    fn bring_up(&mut self) -> Result<(), GraphError> {
        let format = self.graph.negotiate_format()?;
        self.graph.build(format)?;
        self.graph.start_io()
    }

    fn on_device_changed(&mut self) {
        if let EngineState::Failed(kind) = self.state {
            // A new default device after a loss is as good as a reconnect
            if kind.is_transient() {
                tracing::info!("Audio device changed while failed, restarting");
                if let Err(err) = self.start() {
                    tracing::warn!("Restart after device change failed: {}", err);
                }
            }
            return;
        }
        if self.state != EngineState::Running {
            return;
        }
        self.transition(EngineState::Reconfiguring);

        let result = self
            .graph
            .negotiate_format()
            .and_then(|format| self.graph.rebuild(format));

        match result {
            Ok(()) => self.transition(EngineState::Running),
            Err(err) => {
                tracing::warn!("Rebuild after device change failed: {}", err);
                self.graph.teardown();
                self.fail(ErrorKind::DeviceUnavailable);
            }
        }
    }

    fn on_device_lost(&mut self) {
        if !matches!(self.state, EngineState::Running | EngineState::Reconfiguring) {
            return;
        }
        tracing::warn!("Audio device lost");
        self.graph.teardown();
        self.fail(ErrorKind::DeviceUnavailable);
    }

    fn on_stream_failed(&mut self, graph: u64) {
        if self.graph.live_build() != Some(graph) {
            tracing::debug!("Ignoring stream failure of replaced graph #{}", graph);
            return;
        }
        self.on_device_lost();
    }

    fn on_device_reconnected(&mut self) {
        let EngineState::Failed(kind) = self.state else {
            return;
        };
        if !kind.is_transient() {
            return;
        }
        tracing::info!("Audio device reconnected, restarting");
        if let Err(err) = self.start() {
            tracing::warn!("Restart after reconnect failed: {}", err);
        }
    }

    fn on_permission_changed(&mut self) {
        self.permission_latched = false;

        if self.state.is_active() {
            if self.gate.check_or_request() != PermissionStatus::Granted {
                tracing::warn!("Microphone permission revoked");
                self.graph.teardown();
                self.permission_latched = true;
                self.fail(ErrorKind::PermissionDenied);
            }
            return;
        }

        let retry = self.start_requested
            || self.state == EngineState::Failed(ErrorKind::PermissionDenied);
        if retry {
            tracing::info!("Microphone permission changed, retrying start");
            if let Err(err) = self.start() {
                tracing::warn!("Start after permission change failed: {}", err);
            }
        }
    }

    fn fail(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
        self.transition(EngineState::Failed(kind));
        if let Some(events) = &self.events {
            events.emit(EngineEvent::Error(kind));
        }
    }

    fn transition(&mut self, to: EngineState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!("Engine state: {} -> {}", from, to);
        if let Some(events) = &self.events {
            events.emit(EngineEvent::StateChanged { from, to });
        }
    }
}
