use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;

use crate::logger;
use crate::settings::CameraSettings;
use crate::types::*;
use super::{BackendClient, FrameSource, RecognitionEngine};

const BACKGROUND: u8 = 40;
const BAR: u8 = 230;
const BAR_WIDTH: u32 = 40;
const BAR_STEP: u32 = 8;

/// Synthetic camera: a bright vertical bar sweeping left to right over a
/// dark background, paced at the configured fps.
pub struct StubCamera {
    width: u32,
    height: u32,
    interval: Duration,
    last: Option<Instant>,
    frame_no: u32,
}

impl StubCamera {
    pub fn new(settings: &CameraSettings) -> Self {
        logger::info_p(
            "stub",
            &format!("camera {}x{} @ {}fps", settings.width, settings.height, settings.fps),
        );
        Self {
            width: settings.width,
            height: settings.height,
            interval: Duration::from_secs(1) / settings.fps.max(1),
            last: None,
            frame_no: 0,
        }
    }

    fn render(&self) -> Frame {
        let span = self.width + BAR_WIDTH;
        let bar_start = (self.frame_no * BAR_STEP) % span;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * Frame::CHANNELS);
        for _ in 0..self.height {
            for x in 0..self.width {
                let v = if x + BAR_WIDTH >= bar_start && x < bar_start { BAR } else { BACKGROUND };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::new(self.width, self.height, data).unwrap_or_else(|_| Frame::filled(self.width, self.height, [0, 0, 0]))
    }
}

impl FrameSource for StubCamera {
    fn read_next_frame(&mut self) -> Option<Frame> {
        let now = Instant::now();
        if self.last.is_some_and(|t| now.duration_since(t) < self.interval) {
            return None;
        }
        self.last = Some(now);
        self.frame_no = self.frame_no.wrapping_add(1);
        Some(self.render())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {
        logger::info_p("stub", "camera stopped");
    }
}

/// Reports one box around the bright columns of the middle row, the
/// shape `StubCamera` produces.
pub struct StubRecognizer;

impl RecognitionEngine for StubRecognizer {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let row = frame.height() / 2;
        let mut bright = (0..frame.width()).filter(|&x| frame.luma(row, x) >= 200);
        let Some(first) = bright.next() else {
            return Ok(Vec::new());
        };
        let last = bright.last().unwrap_or(first);
        Ok(vec![Detection {
            x: first as i32,
            y: 0,
            width: (last - first + 1) as i32,
            height: frame.height() as i32,
            confidence: 0.9,
        }])
    }
}

/// Offline backend that logs every call and accepts everything.
pub struct StubBackend;

impl BackendClient for StubBackend {
    fn send_heartbeat(&mut self, status: &str, uptime_secs: u64) -> bool {
        logger::info_p("stub", &format!("heartbeat status={} uptime={}s", status, uptime_secs));
        true
    }

    fn poll_commands(&mut self) -> Option<RemoteCommand> {
        None
    }

    fn send_event(&mut self, direction: &str, frames: &[Frame]) -> EventResponse {
        logger::info_p("stub", &format!("event {} with {} frame(s)", direction, frames.len()));
        EventResponse {
            status: "unknown_registered".into(),
            person_id: Some(json!("stub-person")),
            ..Default::default()
        }
    }

    fn register_person(&mut self, name: Option<&str>, frames: &[Frame]) -> RegistrationResponse {
        logger::info_p(
            "stub",
            &format!("register {} with {} frame(s)", name.unwrap_or("<unlabeled>"), frames.len()),
        );
        RegistrationResponse {
            status: "success".into(),
            person_id: Some(json!("stub-person")),
            message: None,
        }
    }

    fn send_preview_frame(&mut self, _frame: &Frame, _quality: u8) -> bool {
        true
    }
}
