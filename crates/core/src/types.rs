use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Captured camera frame (BGR, 3 bytes per pixel, row-major).
///
/// Pixel storage is shared, so cloning a frame into a capture session
/// does not copy the buffer.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * Self::CHANNELS;
        ensure!(
            data.len() == expected,
            "frame buffer is {} bytes, expected {} for {}x{}",
            data.len(),
            expected,
            width,
            height
        );
        Ok(Self { data: data.into(), width, height })
    }

    /// Frame with every pixel set to `bgr`.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data: Vec<u8> = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * Self::CHANNELS)
            .collect();
        Self { data: data.into(), width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, row: u32, col: u32) -> usize {
        (row as usize * self.width as usize + col as usize) * Self::CHANNELS
    }

    /// BGR triple at (row, col).
    pub fn pixel(&self, row: u32, col: u32) -> [u8; 3] {
        let i = self.offset(row, col);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// BT.601 luma at (row, col), 14-bit fixed point.
    pub fn luma(&self, row: u32, col: u32) -> u8 {
        let [b, g, r] = self.pixel(row, col);
        ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14) as u8
    }

    /// Copy of the frame with the zone boundaries painted on it:
    /// left edge yellow, right edge red, 3 px wide.
    pub fn with_tripwires(&self, zone: &Zone) -> Frame {
        const YELLOW: [u8; 3] = [0, 255, 255];
        const RED: [u8; 3] = [0, 0, 255];

        let mut data = self.data.to_vec();
        for (x, color) in [(zone.left(), YELLOW), (zone.right(), RED)] {
            let cols = x.saturating_sub(1)..=x.saturating_add(1);
            for col in cols.filter(|c| *c < self.width) {
                for row in 0..self.height {
                    let i = self.offset(row, col);
                    data[i..i + 3].copy_from_slice(&color);
                }
            }
        }
        Frame { data: data.into(), width: self.width, height: self.height }
    }

    /// Pixel data reordered to RGB for encoders.
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        self.data
            .chunks_exact(Self::CHANNELS)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Horizontal tripwire band. Bounds are stored ordered, whichever way
/// round the outer/inner lines were configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    x1: u32,
    x2: u32,
}

impl Zone {
    pub fn new(outer_x: u32, inner_x: u32) -> Self {
        Self {
            x1: outer_x.min(inner_x),
            x2: outer_x.max(inner_x),
        }
    }

    pub fn left(&self) -> u32 {
        self.x1
    }

    pub fn right(&self) -> u32 {
        self.x2
    }

    pub fn is_degenerate(&self) -> bool {
        self.x1 == self.x2
    }

    /// Strict containment: a point on either boundary is outside.
    pub fn contains(&self, x: i64) -> bool {
        (self.x1 as i64) < x && x < self.x2 as i64
    }
}

/// One box returned by the recognition engine, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
}

impl Detection {
    pub fn center_x(&self) -> i64 {
        self.x as i64 + self.width as i64 / 2
    }
}

/// Control-plane command, from the dashboard or the local console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SystemToggle { enabled: bool },
    Register,
    StartStream,
    StopStream,
    Calibrate,
    StopCalibrate,
    Quit,
}

impl Command {
    /// Returns None for unknown command names.
    pub fn parse(name: &str, params: &Value) -> Option<Self> {
        let cmd = match name {
            "system_toggle" => Command::SystemToggle {
                enabled: params.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            },
            "register" => Command::Register,
            "start_stream" => Command::StartStream,
            "stop_stream" => Command::StopStream,
            "calibrate" => Command::Calibrate,
            "stop_calibrate" => Command::StopCalibrate,
            "quit" => Command::Quit,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Command poll payload as served by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteCommand {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl RemoteCommand {
    pub fn to_command(&self) -> Option<Command> {
        self.command.as_deref().and_then(|name| Command::parse(name, &self.params))
    }
}

/// Backend verdict for a submitted burst.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub person_id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl EventResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self.status.as_str(), "success" | "unknown_registered")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub person_id: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RegistrationResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Render a backend person id (string or number) for logs.
pub fn person_label(id: &Option<Value>) -> String {
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "?".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zone_normalizes_bounds() {
        let zone = Zone::new(800, 300);
        assert_eq!(zone.left(), 300);
        assert_eq!(zone.right(), 800);
        assert!(Zone::new(5, 5).is_degenerate());
    }

    #[test]
    fn test_zone_boundaries_are_exclusive() {
        let zone = Zone::new(100, 200);
        assert!(!zone.contains(100));
        assert!(!zone.contains(200));
        assert!(zone.contains(101));
        assert!(zone.contains(199));
    }

    #[test]
    fn test_detection_center_uses_integer_half_width() {
        let d = Detection { x: 90, y: 0, width: 21, height: 40, confidence: 0.8 };
        assert_eq!(d.center_x(), 100);
    }

    #[test]
    fn test_luma_of_gray_pixel_is_identity() {
        for v in [0u8, 1, 80, 128, 255] {
            assert_eq!(Frame::filled(2, 2, [v, v, v]).luma(1, 1), v);
        }
    }

    #[test]
    fn test_frame_rejects_wrong_buffer_size() {
        assert!(Frame::new(4, 4, vec![0; 10]).is_err());
        assert!(Frame::new(4, 4, vec![0; 48]).is_ok());
    }

    #[test]
    fn test_tripwires_paint_both_edges() {
        let frame = Frame::filled(20, 4, [0, 0, 0]);
        let painted = frame.with_tripwires(&Zone::new(5, 15));
        assert_eq!(painted.pixel(2, 5), [0, 255, 255]);
        assert_eq!(painted.pixel(0, 16), [0, 0, 255]);
        assert_eq!(painted.pixel(0, 10), [0, 0, 0]);
        // source frame untouched
        assert_eq!(frame.pixel(2, 5), [0, 0, 0]);
    }

    #[test]
    fn test_parse_commands() {
        let none = Value::Null;
        assert_eq!(Command::parse("register", &none), Some(Command::Register));
        assert_eq!(
            Command::parse("system_toggle", &json!({"enabled": false})),
            Some(Command::SystemToggle { enabled: false })
        );
        assert_eq!(
            Command::parse("system_toggle", &none),
            Some(Command::SystemToggle { enabled: true })
        );
        assert_eq!(Command::parse("reboot", &none), None);
    }

    #[test]
    fn test_remote_command_from_json() {
        let remote: RemoteCommand =
            serde_json::from_value(json!({"command": "calibrate", "params": {}})).unwrap();
        assert_eq!(remote.to_command(), Some(Command::Calibrate));

        let empty: RemoteCommand = serde_json::from_value(json!({"command": null})).unwrap();
        assert_eq!(empty.to_command(), None);
    }

    #[test]
    fn test_event_response_failure() {
        let ok: EventResponse = serde_json::from_value(
            json!({"status": "success", "person_id": 7, "name": "Ana", "similarity": 0.91}),
        )
        .unwrap();
        assert!(!ok.is_failure());
        assert_eq!(person_label(&ok.person_id), "7");
        assert!(EventResponse::failed("timeout").is_failure());
    }
}
