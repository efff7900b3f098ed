pub mod camera;
pub mod http;
pub mod stub;

use anyhow::Result;
use crossterm::style::Color;

use crate::logger;
use crate::settings::Settings;
use crate::types::*;

/// Source of camera frames.
pub trait FrameSource: Send {
    /// Next frame, or None when none is ready yet.
    fn read_next_frame(&mut self) -> Option<Frame>;
    /// False once the capture device has gone away for good.
    fn is_alive(&mut self) -> bool;
    fn stop(&mut self) {}
}

/// Object detector, returning boxes in the frame's own coordinates.
pub trait RecognitionEngine: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Best-effort backend calls. Each call applies its own timeout and
/// reports failure in its return value instead of erroring.
pub trait BackendClient: Send {
    fn send_heartbeat(&mut self, status: &str, uptime_secs: u64) -> bool;
    fn poll_commands(&mut self) -> Option<RemoteCommand>;
    fn send_event(&mut self, direction: &str, frames: &[Frame]) -> EventResponse;
    fn register_person(&mut self, name: Option<&str>, frames: &[Frame]) -> RegistrationResponse;
    fn send_preview_frame(&mut self, frame: &Frame, quality: u8) -> bool;
    /// Tripwire position configured on the server, if any.
    fn fetch_zone(&mut self) -> Option<Zone> {
        None
    }
}

/// Detector used when no model is linked. Reports nothing, so the loop
/// runs motion checks but never starts a burst.
pub struct NullRecognizer;

impl RecognitionEngine for NullRecognizer {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// The collaborators one control loop runs against.
pub struct Platform {
    pub camera: Box<dyn FrameSource>,
    pub recognizer: Box<dyn RecognitionEngine>,
    pub backend: Box<dyn BackendClient>,
}

/// Create the collaborators for this device. With `force_stub`, or when
/// the camera or HTTP client cannot be brought up, synthetic stand-ins
/// are used instead.
pub fn create_platform(force_stub: bool, settings: &Settings, server_url: &str) -> Platform {
    logger::register_prefix("stub", Color::DarkGrey);
    logger::register_prefix("camera", Color::Cyan);
    logger::register_prefix("backend", Color::Blue);

    if force_stub {
        return Platform {
            camera: Box::new(stub::StubCamera::new(&settings.camera)),
            recognizer: Box::new(stub::StubRecognizer),
            backend: Box::new(stub::StubBackend),
        };
    }

    let camera: Box<dyn FrameSource> = match camera::RpiCamera::start(&settings.camera) {
        Ok(cam) => Box::new(cam),
        Err(e) => {
            logger::error_p("camera", &format!("{:#}, falling back to synthetic frames", e));
            Box::new(stub::StubCamera::new(&settings.camera))
        }
    };
    let backend: Box<dyn BackendClient> = match http::HttpBackend::new(server_url, &settings.server.device_id) {
        Ok(client) => Box::new(client),
        Err(e) => {
            logger::error_p("backend", &format!("{:#}, using offline backend", e));
            Box::new(stub::StubBackend)
        }
    };

    logger::warn("no recognition model linked, crossings will not be detected");
    Platform { camera, recognizer: Box::new(NullRecognizer), backend }
}
