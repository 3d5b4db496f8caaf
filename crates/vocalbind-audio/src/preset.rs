//! Preset selection.
//!
//! Maps the Deep/Normal/High presets (and free-form custom values) onto the
//! shared [`PitchParameter`]. Exactly one of them is active at a time, and
//! every change is serialized through a single mutex so concurrent callers
//! can never leave the active preset and the published pitch disagreeing.

use std::sync::Arc;

use parking_lot::Mutex;
use vocalbind_comms::{EngineEvent, EventSender, PitchParameter};
use vocalbind_core::{ActivePreset, PresetName, semitones};

use crate::settings::{self, SettingsError, SettingsStore};

/// Preset operation errors
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    /// Normal is pinned at zero
    #[error("Preset '{0}' is fixed and cannot be changed")]
    FixedPreset(PresetName),

    #[error("Invalid semitone value: {0}")]
    InvalidValue(f32),

    /// The value was applied but could not be saved
    #[error("Failed to persist preset value: {0}")]
    Settings(#[from] SettingsError),
}

struct SelectorState {
    active: ActivePreset,
    deep: f32,
    high: f32,
    store: Box<dyn SettingsStore>,
}

impl SelectorState {
    fn value_of(&self, name: PresetName) -> f32 {
        match name {
            PresetName::Deep => self.deep,
            PresetName::Normal => 0.0,
            PresetName::High => self.high,
        }
    }

    fn load(&mut self) {
        self.deep = stored_value(self.store.as_ref(), PresetName::Deep);
        self.high = stored_value(self.store.as_ref(), PresetName::High);
    }
}

/// Stored value for a preset, or its default when the key is unset
fn stored_value(store: &dyn SettingsStore, name: PresetName) -> f32 {
    settings::preset_key(name)
        .and_then(|key| store.get_f32(key))
        .filter(|value| !value.is_nan())
        .map_or_else(|| settings::default_value(name), semitones::clamp)
}

/// Chooses what drives the pitch parameter
pub struct PresetSelector {
    pitch: Arc<PitchParameter>,
    state: Mutex<SelectorState>,
    events: Option<EventSender>,
}

impl PresetSelector {
    /// Load preset values from `store` and start on Normal (no shift)
    pub fn new(pitch: Arc<PitchParameter>, store: Box<dyn SettingsStore>) -> Self {
        let mut state = SelectorState {
            active: ActivePreset::Named(PresetName::Normal),
            deep: settings::DEFAULT_DEEP,
            high: settings::DEFAULT_HIGH,
            store,
        };
        state.load();
        tracing::debug!("Preset values: deep {}, high {}", state.deep, state.high);

        pitch.set(0.0);
        Self {
            pitch,
            state: Mutex::new(state),
            events: None,
        }
    }

    /// Publish [`EngineEvent::PresetApplied`] on every change
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Activate a named preset; returns the semitone value now applied
    pub fn select_preset(&self, name: PresetName) -> f32 {
        let mut state = self.state.lock();
        let value = state.value_of(name);
        state.active = ActivePreset::Named(name);
        self.apply(state.active, value)
    }

    /// Drive the pitch directly with `value` (clamped); returns the value
    /// now applied. NaN leaves everything unchanged.
    pub fn set_custom(&self, value: f32) -> f32 {
        let mut state = self.state.lock();
        if value.is_nan() {
            tracing::warn!("Ignoring NaN custom pitch");
            return self.pitch.get();
        }
        state.active = ActivePreset::Custom;
        self.apply(state.active, semitones::clamp(value))
    }

    /// Change the stored value of Deep or High.
    ///
    /// The new value takes effect immediately if that preset is active, then
    /// is written to the settings store. A failed write keeps the in-memory
    /// value and reports [`PresetError::Settings`].
    ///
    /// # Errors
    ///
    /// [`PresetError::FixedPreset`] for Normal, [`PresetError::InvalidValue`]
    /// for NaN, [`PresetError::Settings`] if the value could not be saved
    pub fn update_preset_value(&self, name: PresetName, value: f32) -> Result<(), PresetError> {
        let Some(key) = settings::preset_key(name) else {
            return Err(PresetError::FixedPreset(name));
        };
        if value.is_nan() {
            return Err(PresetError::InvalidValue(value));
        }
        let value = semitones::clamp(value);

        let mut state = self.state.lock();
        match name {
            PresetName::Deep => state.deep = value,
            PresetName::High => state.high = value,
            PresetName::Normal => return Err(PresetError::FixedPreset(name)),
        }
        if state.active == ActivePreset::Named(name) {
            self.apply(state.active, value);
        }
        tracing::info!("Preset '{}' set to {} semitones", name, value);

        state.store.set_f32(key, value)?;
        Ok(())
    }

    /// Re-read Deep and High from the settings store and re-apply the active
    /// preset if it is one of them
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be re-read; current values are kept
    pub fn reload_from_settings(&self) -> Result<(), PresetError> {
        let mut state = self.state.lock();
        state.store.reload()?;
        state.load();
        tracing::info!(
            "Reloaded preset values: deep {}, high {}",
            state.deep,
            state.high
        );

        if let ActivePreset::Named(name) = state.active {
            let value = state.value_of(name);
            self.apply(state.active, value);
        }
        Ok(())
    }

    pub fn active_preset(&self) -> ActivePreset {
        self.state.lock().active
    }

    /// Semitone value currently published to the render path
    pub fn current_semitones(&self) -> f32 {
        self.pitch.get()
    }

    /// Configured value of a preset (0 for Normal)
    pub fn preset_value(&self, name: PresetName) -> f32 {
        self.state.lock().value_of(name)
    }

    /// The parameter this selector drives
    pub fn pitch(&self) -> &Arc<PitchParameter> {
        &self.pitch
    }

    /// Publish `value`. Called with the state lock held.
    fn apply(&self, active: ActivePreset, value: f32) -> f32 {
        self.pitch.set(value);
        let semitones = self.pitch.get();
        tracing::debug!("Applied {} ({} semitones)", active, semitones);
        if let Some(events) = &self.events {
            events.emit(EngineEvent::PresetApplied { active, semitones });
        }
        semitones
    }
}
