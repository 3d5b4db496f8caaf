//! vocalbind - real-time voice pitch shifter
//!
//! Main application entry point.

mod surface;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vocalbind_audio::{
    AudioConfig, CpalBackend, DeviceWatcher, MemorySettings, PermissionStatus, RonSettingsFile,
    SettingsStore, SharedPermission, VoiceEngine,
};
use vocalbind_comms::{ControlEvent, create_channels};

/// Real-time voice pitch shifter
#[derive(Parser, Debug)]
#[command(name = "vocalbind")]
#[command(about = "Pitch-shift your microphone in real time", long_about = None)]
struct Args {
    /// RON file holding preset values (in-memory defaults if omitted)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Processing block size in frames
    #[arg(long, default_value_t = 256)]
    block_size: usize,

    /// Maximum captured audio kept buffered, in milliseconds
    #[arg(long, default_value_t = 40)]
    latency_ms: u32,

    /// Pitch-shifter grain length in milliseconds
    #[arg(long, default_value_t = 40.0)]
    grain_ms: f32,

    /// How often to poll for device changes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    watch_interval_ms: u64,

    /// Initial microphone permission answer
    #[arg(long, value_enum, default_value_t = PermissionArg::Granted)]
    permission: PermissionArg,

    /// Wait for a `start` command instead of starting immediately
    #[arg(long)]
    no_autostart: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PermissionArg {
    Granted,
    Denied,
    Pending,
}

impl From<PermissionArg> for PermissionStatus {
    fn from(arg: PermissionArg) -> Self {
        match arg {
            PermissionArg::Granted => Self::Granted,
            PermissionArg::Denied => Self::Denied,
            PermissionArg::Pending => Self::Pending,
        }
    }
}

impl Args {
    fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            block_size: self.block_size,
            max_latency_ms: self.latency_ms,
            grain_ms: self.grain_ms,
            watch_interval: Duration::from_millis(self.watch_interval_ms),
        }
    }

    fn settings_store(&self) -> Result<Box<dyn SettingsStore>> {
        match &self.settings {
            Some(path) => {
                let file = RonSettingsFile::open(path)
                    .with_context(|| format!("Failed to open settings {}", path.display()))?;
                tracing::info!("Using settings file {}", path.display());
                Ok(Box::new(file))
            }
            None => Ok(Box::new(MemorySettings::new())),
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vocalbind=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    tracing::info!("Starting vocalbind...");

    let config = args.audio_config();
    let store = args.settings_store()?;
    let permission = SharedPermission::new(args.permission.into());

    // Create communication channels
    let (surface_channels, engine_channels) = create_channels(256);

    let backend = CpalBackend::new(Some(engine_channels.platform_tx.clone()));
    let mut engine = VoiceEngine::init(
        backend,
        Box::new(permission.clone()),
        store,
        config.clone(),
        Some(engine_channels.events.clone()),
    );

    let _watcher = match DeviceWatcher::spawn(
        config.watch_interval,
        engine_channels.platform_tx.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!("Device changes will not be detected: {:#}", e);
            None
        }
    };

    if !args.no_autostart {
        let _ = engine.handle_control(ControlEvent::Start);
    }

    std::thread::Builder::new()
        .name("vocalbind-surface".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            surface::run(stdin.lock(), &surface_channels, &permission);
        })
        .context("Failed to spawn control surface thread")?;

    engine.run(&engine_channels.control_rx, &engine_channels.platform_rx);

    tracing::info!("vocalbind shutting down");
    engine.shutdown();

    Ok(())
}
