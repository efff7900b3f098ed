use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use crate::logger;
use crate::types::*;
use super::BackendClient;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(3);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const PREVIEW_TIMEOUT: Duration = Duration::from_secs(2);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_QUALITY: u8 = 85;
const REGISTRATION_QUALITY: u8 = 95;

#[derive(Deserialize)]
struct DeviceConfig {
    tripwires: Tripwires,
}

#[derive(Deserialize)]
struct Tripwires {
    outer_x: u32,
    inner_x: u32,
}

/// Dashboard server client over blocking HTTP. No retries: a failed
/// call is reported once and the caller moves on.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    device_id: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, device_id: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(2)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn try_send_event(&self, direction: &str, frames: &[Frame]) -> Result<EventResponse> {
        let form = frames_form(frames, "frame", EVENT_QUALITY)?
            .text("direction", direction.to_string())
            .text("rpi_id", self.device_id.clone())
            .text("timestamp", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
        let resp = self
            .client
            .post(self.url("/api/event"))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()?;
        if !resp.status().is_success() {
            bail!("HTTP {}", resp.status().as_u16());
        }
        resp.json().context("unreadable event response")
    }

    fn try_register(&self, name: Option<&str>, frames: &[Frame]) -> Result<RegistrationResponse> {
        let mut form = frames_form(frames, "reg", REGISTRATION_QUALITY)?
            .text("rpi_id", self.device_id.clone());
        if let Some(name) = name {
            form = form.text("name", name.to_string());
        }
        let resp = self
            .client
            .post(self.url("/api/register"))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()?;
        if !resp.status().is_success() {
            bail!("HTTP {}", resp.status().as_u16());
        }
        resp.json().context("unreadable registration response")
    }

    fn try_preview(&self, frame: &Frame, quality: u8) -> Result<bool> {
        let resp = self
            .client
            .post(self.url(&format!("/api/rpi/stream/{}", self.device_id)))
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(encode_jpeg(frame, quality)?)
            .timeout(PREVIEW_TIMEOUT)
            .send()?;
        Ok(resp.status().is_success())
    }
}

impl BackendClient for HttpBackend {
    fn send_heartbeat(&mut self, status: &str, uptime_secs: u64) -> bool {
        self.client
            .post(self.url("/api/rpi/heartbeat"))
            .json(&json!({ "rpi_id": self.device_id, "status": status, "uptime": uptime_secs }))
            .timeout(HEARTBEAT_TIMEOUT)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn poll_commands(&mut self) -> Option<RemoteCommand> {
        let resp = self
            .client
            .get(self.url(&format!("/api/rpi/commands/{}", self.device_id)))
            .timeout(POLL_TIMEOUT)
            .send()
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json().ok()
    }

    fn send_event(&mut self, direction: &str, frames: &[Frame]) -> EventResponse {
        self.try_send_event(direction, frames).unwrap_or_else(|e| {
            logger::error_p("backend", &format!("event upload failed: {:#}", e));
            EventResponse::failed(format!("{:#}", e))
        })
    }

    fn register_person(&mut self, name: Option<&str>, frames: &[Frame]) -> RegistrationResponse {
        self.try_register(name, frames).unwrap_or_else(|e| {
            logger::error_p("backend", &format!("registration upload failed: {:#}", e));
            RegistrationResponse::failed(format!("{:#}", e))
        })
    }

    fn send_preview_frame(&mut self, frame: &Frame, quality: u8) -> bool {
        self.try_preview(frame, quality).unwrap_or(false)
    }

    fn fetch_zone(&mut self) -> Option<Zone> {
        let resp = self
            .client
            .get(self.url(&format!("/api/rpi/config/{}", self.device_id)))
            .timeout(CONFIG_TIMEOUT)
            .send()
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let config: DeviceConfig = resp.json().ok()?;
        Some(Zone::new(config.tripwires.outer_x, config.tripwires.inner_x))
    }
}

fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        &frame.to_rgb_bytes(),
        frame.width(),
        frame.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}

fn frames_form(frames: &[Frame], stem: &str, quality: u8) -> Result<Form> {
    let mut form = Form::new();
    for (i, frame) in frames.iter().enumerate() {
        let part = Part::bytes(encode_jpeg(frame, quality)?)
            .file_name(format!("{}_{}.jpg", stem, i))
            .mime_str("image/jpeg")?;
        form = form.part("images", part);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_jpeg_produces_jfif() {
        let jpeg = encode_jpeg(&Frame::filled(16, 8, [0, 128, 255]), 70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let backend = HttpBackend::new("http://example.local:8000/", "pi-7").unwrap();
        assert_eq!(backend.url("/api/event"), "http://example.local:8000/api/event");
    }

    #[test]
    fn test_unreachable_server_reports_failure() {
        // port 9 (discard) on localhost is closed in test environments
        let mut backend = HttpBackend::new("http://127.0.0.1:9", "pi-7").unwrap();
        assert!(!backend.send_heartbeat("idle", 1));
        assert!(backend.poll_commands().is_none());
        let resp = backend.send_event("enter", &[Frame::filled(8, 8, [0, 0, 0])]);
        assert!(resp.is_failure());
    }
}
