//! Voice engine - the process-wide owner of the lifecycle and presets.
//!
//! A control surface creates one [`VoiceEngine`] with [`VoiceEngine::init`],
//! then either feeds events through [`VoiceEngine::run`] or calls the
//! `handle_*` methods directly, and finally calls [`VoiceEngine::shutdown`].

use std::ops::ControlFlow;
use std::sync::Arc;

use crossbeam_channel::{Receiver, select};
use vocalbind_comms::{
    ControlEvent, EngineEvent, EventSender, Levels, PitchParameter, PlatformEvent,
};
use vocalbind_core::{ActivePreset, EngineState, ErrorKind};

use crate::device::AudioBackend;
use crate::graph::AudioGraph;
use crate::lifecycle::{EngineError, EngineLifecycle};
use crate::permission::PermissionGate;
use crate::preset::PresetSelector;
use crate::settings::SettingsStore;
use crate::{AudioConfig, AudioFormat};

/// Snapshot of everything a control surface displays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub active_preset: ActivePreset,
    pub semitones: f32,
    pub last_error: Option<ErrorKind>,
    pub graphs_built: u64,
    pub format: Option<AudioFormat>,
    pub levels: Option<Levels>,
}

/// Lifecycle plus preset selection, driven by control and platform events
pub struct VoiceEngine<B: AudioBackend> {
    lifecycle: EngineLifecycle<B>,
    presets: Arc<PresetSelector>,
    events: Option<EventSender>,
}

impl<B: AudioBackend> VoiceEngine<B> {
    /// Create the engine in Stopped with preset values loaded from `store`.
    /// Nothing touches a device until [`start`](EngineLifecycle::start).
    pub fn init(
        backend: B,
        gate: Box<dyn PermissionGate>,
        store: Box<dyn SettingsStore>,
        config: AudioConfig,
        events: Option<EventSender>,
    ) -> Self {
        tracing::info!("Voice engine init with config: {:?}", config);

        let pitch = Arc::new(PitchParameter::default());
        let mut presets = PresetSelector::new(Arc::clone(&pitch), store);
        let graph = AudioGraph::new(backend, config, pitch);
        let mut lifecycle = EngineLifecycle::new(graph, gate);

        if let Some(events) = &events {
            presets = presets.with_events(events.clone());
            lifecycle = lifecycle.with_events(events.clone());
        }

        Self {
            lifecycle,
            presets: Arc::new(presets),
            events,
        }
    }

    /// Preset selector; safe to share with other control-context threads
    pub fn presets(&self) -> &Arc<PresetSelector> {
        &self.presets
    }

    pub fn lifecycle(&self) -> &EngineLifecycle<B> {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut EngineLifecycle<B> {
        &mut self.lifecycle
    }

    /// Convenience for `lifecycle_mut().start()`
    ///
    /// # Errors
    ///
    /// See [`EngineLifecycle::start`]
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.lifecycle.start()
    }

    pub fn stop(&mut self) {
        self.lifecycle.stop();
    }

    /// Apply one control event. Returns `Break` on shutdown.
    ///
    /// Failures are logged and reflected in state and `last_error`; they
    /// never stop the loop.
    pub fn handle_control(&mut self, event: ControlEvent) -> ControlFlow<()> {
        tracing::debug!("Control event: {:?}", event);
        match event {
            ControlEvent::SelectPreset(name) => {
                self.presets.select_preset(name);
            }
            ControlEvent::SetCustom(value) => {
                self.presets.set_custom(value);
            }
            ControlEvent::UpdatePresetValue(name, value) => {
                if let Err(e) = self.presets.update_preset_value(name, value) {
                    tracing::warn!("Preset update failed: {}", e);
                }
            }
            ControlEvent::ReloadSettings => {
                if let Err(e) = self.presets.reload_from_settings() {
                    tracing::warn!("Settings reload failed: {}", e);
                }
            }
            ControlEvent::Start => match self.lifecycle.start() {
                Ok(()) => {}
                Err(EngineError::PermissionPending) => {
                    tracing::info!("Waiting for microphone permission");
                }
                Err(e) => tracing::warn!("Start failed: {}", e),
            },
            ControlEvent::Stop => self.lifecycle.stop(),
            ControlEvent::ReportStatus => self.report_status(),
            ControlEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub fn handle_platform(&mut self, event: PlatformEvent) {
        self.lifecycle.handle_platform(event);
    }

    pub fn status(&mut self) -> EngineStatus {
        EngineStatus {
            state: self.lifecycle.state(),
            active_preset: self.presets.active_preset(),
            semitones: self.presets.current_semitones(),
            last_error: self.lifecycle.last_error(),
            graphs_built: self.lifecycle.graphs_built(),
            format: self.lifecycle.format(),
            levels: self.lifecycle.levels(),
        }
    }

    fn report_status(&self) {
        let Some(events) = &self.events else {
            return;
        };
        let sent = events.emit(EngineEvent::Status {
            state: self.lifecycle.state(),
            active: self.presets.active_preset(),
            semitones: self.presets.current_semitones(),
            last_error: self.lifecycle.last_error(),
        });
        if !sent {
            tracing::debug!("Status report dropped, event channel full");
        }
    }

    /// Process events until `Shutdown` arrives or the control channel closes
    pub fn run(
        &mut self,
        control_rx: &Receiver<ControlEvent>,
        platform_rx: &Receiver<PlatformEvent>,
    ) {
        tracing::info!("Voice engine event loop running");
        let mut platform_rx = platform_rx.clone();
        loop {
            select! {
                recv(control_rx) -> msg => match msg {
                    Ok(event) => {
                        if self.handle_control(event).is_break() {
                            break;
                        }
                    }
                    Err(_) => {
                        tracing::debug!("Control channel closed");
                        break;
                    }
                },
                recv(platform_rx) -> msg => match msg {
                    Ok(event) => self.handle_platform(event),
                    Err(_) => {
                        // Not fatal; keep serving control events
                        tracing::debug!("Platform channel closed");
                        platform_rx = crossbeam_channel::never();
                    }
                },
            }
        }
        tracing::info!("Voice engine event loop exited");
    }

    /// Stop audio and release every device
    pub fn shutdown(mut self) {
        self.lifecycle.stop();
        tracing::info!("Voice engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{VirtualBackend, VirtualDevice};
    use crate::permission::PermissionStatus;
    use crate::settings::MemorySettings;
    use vocalbind_comms::create_channels;
    use vocalbind_core::PresetName;

    fn engine() -> (VoiceEngine<VirtualBackend>, VirtualDevice) {
        let (backend, device) = VirtualBackend::new(Some(AudioFormat {
            sample_rate: 48000,
            input_channels: 1,
            output_channels: 2,
            max_block_frames: 256,
        }));
        let engine = VoiceEngine::init(
            backend,
            Box::new(|| PermissionStatus::Granted),
            Box::new(MemorySettings::new()),
            AudioConfig::default(),
            None,
        );
        (engine, device)
    }

    #[test]
    fn test_init_is_stopped_on_normal() {
        let (mut engine, device) = engine();
        let status = engine.status();
        assert_eq!(status.state, EngineState::Stopped);
        assert_eq!(status.active_preset, ActivePreset::Named(PresetName::Normal));
        assert_eq!(status.semitones, 0.0);
        assert_eq!(status.graphs_built, 0);
        assert_eq!(device.open_graphs(), 0);
    }

    #[test]
    fn test_control_events() {
        let (mut engine, _device) = engine();
        assert!(engine.handle_control(ControlEvent::Start).is_continue());
        assert!(engine
            .handle_control(ControlEvent::SelectPreset(PresetName::High))
            .is_continue());

        let status = engine.status();
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.semitones, 7.0);

        engine.handle_control(ControlEvent::UpdatePresetValue(PresetName::Normal, 3.0));
        assert_eq!(engine.status().semitones, 7.0);

        assert!(engine.handle_control(ControlEvent::Shutdown).is_break());
    }

    #[test]
    fn test_processing_reaches_the_device() {
        let (mut engine, device) = engine();
        engine.start().unwrap();
        engine.presets().select_preset(PresetName::Deep);

        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut output = vec![0.0_f32; 512];
        assert!(device.pump(&input, &mut output));

        let levels = engine.status().levels.unwrap();
        assert_eq!(levels.frames_rendered, 256);
        assert!(levels.input_peak > 0.0);
    }

    #[test]
    fn test_run_loop_until_shutdown() {
        let (surface, channels) = create_channels(64);
        let (mut engine, _device) = engine();

        surface.control_tx.send(ControlEvent::Start).unwrap();
        surface
            .control_tx
            .send(ControlEvent::SetCustom(2.5))
            .unwrap();
        surface.control_tx.send(ControlEvent::Shutdown).unwrap();

        engine.run(&channels.control_rx, &channels.platform_rx);

        let status = engine.status();
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.active_preset, ActivePreset::Custom);
        assert_eq!(status.semitones, 2.5);

        engine.shutdown();
    }

    #[test]
    fn test_status_is_reported_on_request() {
        let (surface, channels) = create_channels(64);
        let (backend, _device) = VirtualBackend::new(None);
        let mut engine = VoiceEngine::init(
            backend,
            Box::new(|| PermissionStatus::Granted),
            Box::new(MemorySettings::new()),
            AudioConfig::default(),
            Some(channels.events.clone()),
        );
        engine.handle_control(ControlEvent::SelectPreset(PresetName::Deep));
        engine.handle_control(ControlEvent::Start);
        surface.event_rx.try_iter().for_each(drop);

        engine.handle_control(ControlEvent::ReportStatus);
        assert_eq!(
            surface.event_rx.try_recv().unwrap(),
            EngineEvent::Status {
                state: EngineState::Failed(ErrorKind::DeviceUnavailable),
                active: ActivePreset::Named(PresetName::Deep),
                semitones: -6.0,
                last_error: Some(ErrorKind::DeviceUnavailable),
            }
        );
    }

    #[test]
    fn test_run_exits_when_surface_drops() {
        let (surface, channels) = create_channels(64);
        let (mut engine, _device) = engine();
        drop(surface);
        engine.run(&channels.control_rx, &channels.platform_rx);
        assert_eq!(engine.status().state, EngineState::Stopped);
    }
}
