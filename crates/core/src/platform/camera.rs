use std::io::Read;
use std::process::{Child, ChildStdout, Command as Process, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};

use crate::logger;
use crate::settings::CameraSettings;
use crate::types::Frame;
use super::FrameSource;

const WARMUP: Duration = Duration::from_secs(2);

/// Raspberry Pi camera via an `rpicam-vid` child process streaming raw
/// I420 frames on stdout.
pub struct RpiCamera {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    buf: Vec<u8>,
}

impl RpiCamera {
    pub fn start(settings: &CameraSettings) -> Result<Self> {
        let (width, height) = (settings.width, settings.height);
        ensure!(width % 2 == 0 && height % 2 == 0, "I420 needs even dimensions");

        let mut child = Process::new("rpicam-vid")
            .args(["--codec", "yuv420", "--timeout", "0", "--nopreview", "-o", "-"])
            .args(["--width", &width.to_string()])
            .args(["--height", &height.to_string()])
            .args(["--framerate", &settings.fps.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to start rpicam-vid")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("rpicam-vid stdout not captured"))?;

        thread::sleep(WARMUP);
        logger::info_p("camera", &format!("started {}x{} @ {}fps", width, height, settings.fps));

        Ok(Self {
            child,
            stdout,
            width,
            height,
            buf: vec![0; i420_len(width, height)],
        })
    }
}

impl FrameSource for RpiCamera {
    fn read_next_frame(&mut self) -> Option<Frame> {
        self.stdout.read_exact(&mut self.buf).ok()?;
        let bgr = i420_to_bgr(&self.buf, self.width, self.height);
        Frame::new(self.width, self.height, bgr).ok()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
        logger::info_p("camera", "stopped");
    }
}

fn i420_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range I420 to packed BGR.
pub fn i420_to_bgr(yuv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (u_plane, v_plane) = yuv[w * h..].split_at(w * h / 4);
    let mut out = Vec::with_capacity(w * h * 3);

    for row in 0..h {
        for col in 0..w {
            let chroma = (row / 2) * (w / 2) + col / 2;
            let c = 298 * (yuv[row * w + col] as i32 - 16);
            let d = u_plane[chroma] as i32 - 128;
            let e = v_plane[chroma] as i32 - 128;

            let r = clamp_u8((c + 409 * e + 128) >> 8);
            let g = clamp_u8((c - 100 * d - 208 * e + 128) >> 8);
            let b = clamp_u8((c + 516 * d + 128) >> 8);
            out.extend_from_slice(&[b, g, r]);
        }
    }
    out
}
