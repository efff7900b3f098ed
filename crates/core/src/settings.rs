use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive::FailurePolicy;
use crate::logger;
use crate::motion::ThresholdStrategy;
use crate::types::Zone;

/// Full device configuration, loaded once at startup from `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub camera: CameraSettings,
    pub zone: ZoneSettings,
    pub motion: MotionSettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub url: String,
    /// Used instead of `url` when started with `--debug`.
    pub local_url: String,
    pub device_id: String,
    pub heartbeat_interval: f64,
    pub command_poll_interval: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".into(),
            local_url: "http://127.0.0.1:8000".into(),
            device_id: "rpi-01".into(),
            heartbeat_interval: 10.0,
            command_poll_interval: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub stream_fps: f64,
    pub stream_quality: u8,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 15,
            stream_fps: 5.0,
            stream_quality: 70,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneSettings {
    pub outer_x: u32,
    pub inner_x: u32,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self { outer_x: 400, inner_x: 880 }
    }
}

impl ZoneSettings {
    pub fn zone(&self) -> Zone {
        Zone::new(self.outer_x, self.inner_x)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub sample_size: usize,
    /// Base MAE threshold on the 0-255 intensity scale.
    pub threshold: f64,
    pub min_consecutive: u32,
    /// Checks suppressed after a trigger.
    pub cooldown: u32,
    /// Seconds between motion checks.
    pub check_interval: f64,
    pub strategy: ThresholdStrategy,
    /// Fixes the sample points; random when absent.
    pub seed: Option<u64>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            sample_size: 500,
            threshold: 75.0,
            min_consecutive: 1,
            cooldown: 3,
            check_interval: 1.0,
            strategy: ThresholdStrategy::Fixed,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub burst_size: usize,
    /// Seconds between captured frames in a burst or registration.
    pub burst_interval: f64,
    /// Minimum seconds between two events.
    pub event_cooldown: f64,
    pub failure_policy: FailurePolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            burst_size: 5,
            burst_interval: 0.3,
            event_cooldown: 5.0,
            failure_policy: FailurePolicy::Discard,
        }
    }
}

/// Seconds to Duration; negative or non-finite values become zero.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Settings {
    /// Load from `path`. A missing file yields the defaults; a malformed
    /// one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(s) => serde_json::from_str::<Settings>(&s)
                .with_context(|| format!("invalid config {}", path.display()))?,
            Err(_) => {
                logger::warn(&format!("{} not found, using defaults", path.display()));
                Settings::default()
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        ensure!(cam.width > 0 && cam.height > 0, "camera size must be non-zero");
        ensure!(
            cam.width % 2 == 0 && cam.height % 2 == 0,
            "camera size must be even, got {}x{}",
            cam.width,
            cam.height
        );
        ensure!(
            cam.stream_fps.is_finite() && cam.stream_fps > 0.0,
            "stream_fps must be positive"
        );
        ensure!((1..=100).contains(&cam.stream_quality), "stream_quality must be 1-100");
        ensure!(self.capture.burst_size >= 1, "burst_size must be at least 1");

        for (name, value) in [
            ("heartbeat_interval", self.server.heartbeat_interval),
            ("command_poll_interval", self.server.command_poll_interval),
            ("check_interval", self.motion.check_interval),
            ("burst_interval", self.capture.burst_interval),
            ("event_cooldown", self.capture.event_cooldown),
        ] {
            ensure!(value.is_finite() && value >= 0.0, "{} must be >= 0, got {}", name, value);
        }
        Ok(())
    }

    pub fn server_url(&self, debug: bool) -> &str {
        if debug {
            &self.server.local_url
        } else {
            &self.server.url
        }
    }

    pub fn stream_interval(&self) -> Duration {
        secs(1.0 / self.camera.stream_fps)
    }
}
