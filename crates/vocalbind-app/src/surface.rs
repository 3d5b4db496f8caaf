//! Line-oriented control surface on stdin.
//!
//! Translates typed commands into control and platform events and prints the
//! engine's state as it reports it back. Closing stdin leaves the engine
//! running; only `quit` shuts it down.

use std::io::BufRead;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::RecvTimeoutError;
use vocalbind_audio::{PermissionStatus, SharedPermission};
use vocalbind_comms::{ControlEvent, EngineEvent, PlatformEvent, SurfaceChannels};
use vocalbind_core::{ActivePreset, EngineState, ErrorKind, PresetName};

pub const HELP: &str = "\
commands:
  deep | normal | high     select a preset
  custom <semitones>       set an arbitrary shift (-12..12)
  set deep|high <value>    change a preset's stored value
  start | stop             start or stop audio
  grant | deny             answer the microphone permission prompt
  reload                   re-read preset values from the settings file
  status                   ask the engine for its state
  quit                     stop audio and exit";

/// How long `status` waits for the engine to answer
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// A parsed input line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Control(ControlEvent),
    Grant,
    Deny,
    Status,
    Help,
    Quit,
}

/// Parse one input line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let head = head.to_ascii_lowercase();

    let command = match head.as_str() {
        "deep" | "normal" | "high" => {
            let name: PresetName = head.parse()?;
            Command::Control(ControlEvent::SelectPreset(name))
        }
        "custom" => {
            let value = parse_value(words.next())?;
            Command::Control(ControlEvent::SetCustom(value))
        }
        "set" => {
            let name: PresetName = words
                .next()
                .context("usage: set deep|high <value>")?
                .parse()?;
            if !name.is_configurable() {
                bail!("the {name} preset is fixed at 0 semitones");
            }
            let value = parse_value(words.next())?;
            Command::Control(ControlEvent::UpdatePresetValue(name, value))
        }
        "start" => Command::Control(ControlEvent::Start),
        "stop" => Command::Control(ControlEvent::Stop),
        "reload" => Command::Control(ControlEvent::ReloadSettings),
        "grant" => Command::Grant,
        "deny" => Command::Deny,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{other}' (try 'help')"),
    };

    if words.next().is_some() {
        bail!("unexpected trailing input in '{}'", line.trim());
    }
    Ok(Some(command))
}

fn parse_value(word: Option<&str>) -> Result<f32> {
    let word = word.context("missing semitone value")?;
    let value: f32 = word
        .parse()
        .with_context(|| format!("'{word}' is not a number"))?;
    if !value.is_finite() {
        bail!("semitone value must be finite");
    }
    Ok(value)
}

/// What the surface knows about the engine, built from its events
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceView {
    pub state: EngineState,
    pub active: ActivePreset,
    pub semitones: f32,
    pub last_error: Option<ErrorKind>,
}

impl Default for SurfaceView {
    fn default() -> Self {
        Self {
            state: EngineState::Stopped,
            active: ActivePreset::Named(PresetName::Normal),
            semitones: 0.0,
            last_error: None,
        }
    }
}

impl SurfaceView {
    /// Fold one engine event into the view; returns a line worth printing
    pub fn apply(&mut self, event: EngineEvent) -> Option<String> {
        match event {
            EngineEvent::StateChanged { from, to } => {
                self.state = to;
                if to == EngineState::Running {
                    self.last_error = None;
                }
                Some(format!("state: {from} -> {to}"))
            }
            EngineEvent::PresetApplied { active, semitones } => {
                self.active = active;
                self.semitones = semitones;
                Some(format!("pitch: {active} ({semitones:+.1} semitones)"))
            }
            EngineEvent::Error(kind) => {
                self.last_error = Some(kind);
                Some(format!("error: {kind}"))
            }
            EngineEvent::Status {
                state,
                active,
                semitones,
                last_error,
            } => {
                *self = Self {
                    state,
                    active,
                    semitones,
                    last_error,
                };
                None
            }
        }
    }

    pub fn summary(&self) -> String {
        let error = self
            .last_error
            .map_or_else(|| "none".to_string(), |kind| kind.to_string());
        format!(
            "state: {}\npreset: {}\nsemitones: {:+.1}\nlast error: {}",
            self.state, self.active, self.semitones, error
        )
    }
}

/// Serve commands from `input` until `quit`.
///
/// At end of input the surface keeps printing engine events until the engine
/// goes away. Returns the last view of the engine.
pub fn run<R: BufRead>(
    input: R,
    channels: &SurfaceChannels,
    permission: &SharedPermission,
) -> SurfaceView {
    let mut view = SurfaceView::default();
    let mut quit = false;
    println!("{HELP}");

    for line in input.lines() {
        drain_events(channels, &mut view);

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read command: {}", e);
                break;
            }
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e:#}");
                continue;
            }
        };

        let sent = match command {
            Command::Control(event) => channels.control_tx.send(event).is_ok(),
            Command::Grant => answer_permission(channels, permission, PermissionStatus::Granted),
            Command::Deny => answer_permission(channels, permission, PermissionStatus::Denied),
            Command::Status => request_status(channels, &mut view),
            Command::Help => {
                println!("{HELP}");
                true
            }
            Command::Quit => {
                quit = true;
                break;
            }
        };
        if !sent {
            tracing::debug!("Engine is gone, leaving surface");
            return view;
        }
    }

    if quit {
        let _ = channels.control_tx.send(ControlEvent::Shutdown);
    } else {
        tracing::info!("Input closed, engine keeps running");
        follow_events(channels, &mut view);
    }
    view
}

/// Ask the engine for a status snapshot and print it.
///
/// Events arriving ahead of the answer are applied and printed as usual.
/// Falls back to the view built from events if the engine does not answer.
fn request_status(channels: &SurfaceChannels, view: &mut SurfaceView) -> bool {
    if channels.control_tx.send(ControlEvent::ReportStatus).is_err() {
        return false;
    }
    let deadline = Instant::now() + STATUS_TIMEOUT;
    loop {
        match channels.event_rx.recv_deadline(deadline) {
            Ok(event @ EngineEvent::Status { .. }) => {
                view.apply(event);
                println!("{}", view.summary());
                return true;
            }
            Ok(event) => {
                if let Some(line) = view.apply(event) {
                    println!("{line}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Engine did not answer the status request");
                println!("{}", view.summary());
                return true;
            }
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

fn follow_events(channels: &SurfaceChannels, view: &mut SurfaceView) {
    for event in channels.event_rx.iter() {
        if let Some(line) = view.apply(event) {
            println!("{line}");
        }
    }
}

fn answer_permission(
    channels: &SurfaceChannels,
    permission: &SharedPermission,
    status: PermissionStatus,
) -> bool {
    permission.set(status);
    channels
        .platform_tx
        .send(PlatformEvent::PermissionChanged)
        .is_ok()
}

fn drain_events(channels: &SurfaceChannels, view: &mut SurfaceView) {
    for event in channels.event_rx.try_iter() {
        if let Some(line) = view.apply(event) {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vocalbind_comms::create_channels;

    #[test]
    fn test_parse_presets() {
        assert_eq!(
            parse_command("deep").unwrap(),
            Some(Command::Control(ControlEvent::SelectPreset(PresetName::Deep)))
        );
        assert_eq!(
            parse_command("  HIGH ").unwrap(),
            Some(Command::Control(ControlEvent::SelectPreset(PresetName::High)))
        );
        assert_eq!(parse_command("").unwrap(), None);
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            parse_command("custom 3.5").unwrap(),
            Some(Command::Control(ControlEvent::SetCustom(3.5)))
        );
        assert_eq!(
            parse_command("set deep -9").unwrap(),
            Some(Command::Control(ControlEvent::UpdatePresetValue(
                PresetName::Deep,
                -9.0
            )))
        );
        assert!(parse_command("custom").is_err());
        assert!(parse_command("custom loud").is_err());
        assert!(parse_command("custom NaN").is_err());
        assert!(parse_command("set sideways 2").is_err());
        assert!(parse_command("set normal 2").is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_command("grant").unwrap(), Some(Command::Grant));
        assert_eq!(parse_command("status").unwrap(), Some(Command::Status));
        assert_eq!(parse_command("exit").unwrap(), Some(Command::Quit));
        assert!(parse_command("stop now").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn test_view_tracks_events() {
        let mut view = SurfaceView::default();
        view.apply(EngineEvent::Error(ErrorKind::DeviceUnavailable));
        view.apply(EngineEvent::StateChanged {
            from: EngineState::Starting,
            to: EngineState::Failed(ErrorKind::DeviceUnavailable),
        });
        assert_eq!(view.last_error, Some(ErrorKind::DeviceUnavailable));

        view.apply(EngineEvent::StateChanged {
            from: EngineState::Starting,
            to: EngineState::Running,
        });
        view.apply(EngineEvent::PresetApplied {
            active: ActivePreset::Custom,
            semitones: 2.0,
        });
        assert_eq!(view.state, EngineState::Running);
        assert_eq!(view.last_error, None);
        assert_eq!(view.semitones, 2.0);
        assert!(view.summary().contains("custom"));
    }

    #[test]
    fn test_status_answer_replaces_view() {
        let mut view = SurfaceView::default();
        view.apply(EngineEvent::Error(ErrorKind::GraphBuildFailed));

        let line = view.apply(EngineEvent::Status {
            state: EngineState::Running,
            active: ActivePreset::Named(PresetName::High),
            semitones: 7.0,
            last_error: None,
        });
        assert_eq!(line, None);
        assert_eq!(view.state, EngineState::Running);
        assert_eq!(view.active, ActivePreset::Named(PresetName::High));
        assert_eq!(view.last_error, None);
    }

    #[test]
    fn test_status_asks_the_engine() {
        let (surface, engine) = create_channels(16);
        let permission = SharedPermission::granted();

        // Stands in for the engine loop: answers status, stops on shutdown
        let responder = std::thread::spawn(move || {
            for event in engine.control_rx.iter() {
                match event {
                    ControlEvent::ReportStatus => {
                        engine.events.emit(EngineEvent::StateChanged {
                            from: EngineState::Starting,
                            to: EngineState::Failed(ErrorKind::DeviceUnavailable),
                        });
                        engine.events.emit(EngineEvent::Status {
                            state: EngineState::Failed(ErrorKind::DeviceUnavailable),
                            active: ActivePreset::Custom,
                            semitones: -3.0,
                            last_error: Some(ErrorKind::DeviceUnavailable),
                        });
                    }
                    ControlEvent::Shutdown => break,
                    _ => {}
                }
            }
        });

        let view = run(Cursor::new("status
quit
"), &surface, &permission);
        responder.join().unwrap();

        assert_eq!(view.state, EngineState::Failed(ErrorKind::DeviceUnavailable));
        assert_eq!(view.active, ActivePreset::Custom);
        assert_eq!(view.semitones, -3.0);
        assert_eq!(view.last_error, Some(ErrorKind::DeviceUnavailable));
    }

    #[test]
    fn test_end_of_input_does_not_shut_down() {
        let (surface, engine) = create_channels(16);
        let permission = SharedPermission::granted();
        engine
            .events
            .emit(EngineEvent::PresetApplied {
                active: ActivePreset::Named(PresetName::Deep),
                semitones: -6.0,
            });
        // Engine goes away after that event; following stops there
        drop(engine.events);

        let view = run(Cursor::new("high
"), &surface, &permission);

        let control: Vec<_> = engine.control_rx.try_iter().collect();
        assert_eq!(control, vec![ControlEvent::SelectPreset(PresetName::High)]);
        assert_eq!(view.semitones, -6.0);
    }

    #[test]
    fn test_run_forwards_commands() {
        let (surface, engine) = create_channels(16);
        let permission = SharedPermission::new(PermissionStatus::Pending);
        let input = Cursor::new("high\ngrant\nbogus\nquit\nlow\n");

        let _ = run(input, &surface, &permission);

        assert_eq!(permission.status(), PermissionStatus::Granted);
        assert_eq!(
            engine.platform_rx.try_recv().unwrap(),
            PlatformEvent::PermissionChanged
        );
        let control: Vec<_> = engine.control_rx.try_iter().collect();
        assert_eq!(
            control,
            vec![
                ControlEvent::SelectPreset(PresetName::High),
                ControlEvent::Shutdown,
            ]
        );
    }
}
