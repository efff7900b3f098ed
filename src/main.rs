use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use crossterm::style::Color;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use tripwire_core::clock::SystemClock;
use tripwire_core::mailbox::{self, CommandListener, ConsoleInput};
use tripwire_core::motion::MotionGate;
use tripwire_core::orchestrator::Orchestrator;
use tripwire_core::platform::create_platform;
use tripwire_core::settings::Settings;
use tripwire_core::{logger, types::Command};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let force_stub = args.iter().any(|a| a == "--stub");
    let debug = args.iter().any(|a| a == "--debug");

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| cwd.join("config.json"));

    logger::init(&cwd.join("logs"))?;
    logger::register_prefix("console", Color::Yellow);

    let settings = Settings::load(&config_path)?;
    let server_url = settings.server_url(debug).to_string();
    logger::info(&format!(
        "tripwire starting, device {} -> {}{}",
        settings.server.device_id,
        server_url,
        if force_stub { " (stub)" } else { "" }
    ));

    // SIGINT/SIGTERM end the loop through the normal cleanup path.
    // Installed before the camera process starts.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
        logger::warn(&format!("signal handler not installed: {}", e));
    }

    let mut platform = create_platform(force_stub, &settings, &server_url);

    let server_zone = platform.backend.fetch_zone();
    if let Some(zone) = server_zone {
        logger::info(&format!("tripwires from server: {}..{}", zone.left(), zone.right()));
    }
    let (zone, gate) = match MotionGate::with_fallback(
        server_zone,
        settings.zone.zone(),
        settings.camera.width,
        settings.camera.height,
        &settings.motion,
    ) {
        Ok(built) => built,
        Err(e) => {
            platform.camera.stop();
            return Err(e);
        }
    };

    let (tx, rx) = mailbox::channel::<Command>();

    // Key presses only arrive unbuffered in raw mode; without a terminal
    // the device runs on remote commands alone.
    let mut listener = match enable_raw_mode() {
        Ok(()) => {
            logger::info("press r to register, q to quit");
            Some(CommandListener::start(ConsoleInput, tx))
        }
        Err(e) => {
            logger::warn_p("console", &format!("no interactive terminal ({}), local keys disabled", e));
            None
        }
    };

    let mut orchestrator = Orchestrator::new(settings, zone, gate, platform, Box::new(SystemClock))
        .with_local_commands(rx)
        .with_interrupt(interrupted);
    let result = orchestrator.run();

    if let Some(listener) = listener.as_mut() {
        listener.stop();
    }
    disable_raw_mode().ok();

    if let Err(e) = &result {
        logger::error(&format!("{:#}", e));
    }
    result
}
