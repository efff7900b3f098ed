use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::types::Frame;

/// What happens to a session whose upload failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop the frames.
    #[default]
    Discard,
    /// Keep frames and a failure record under `dir` for a later retry.
    Archive { dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Event,
    Registration,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Event => "event",
            UploadKind::Registration => "registration",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: String,
    pub failed_at: String,
    pub message: String,
    pub frames: usize,
}

impl FailurePolicy {
    /// Apply the policy. Returns the archive directory when frames were kept.
    pub fn handle(&self, kind: UploadKind, frames: &[Frame], message: &str) -> Result<Option<PathBuf>> {
        match self {
            FailurePolicy::Discard => Ok(None),
            FailurePolicy::Archive { dir } => archive(dir, kind, frames, message).map(Some),
        }
    }
}

fn archive(root: &Path, kind: UploadKind, frames: &[Frame], message: &str) -> Result<PathBuf> {
    let now = Local::now();
    let dir = root.join(format!("{}_{}", kind.as_str(), now.format("%Y%m%d_%H%M%S_%3f")));
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    for (i, frame) in frames.iter().enumerate() {
        let img = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb_bytes())
            .ok_or_else(|| anyhow!("frame {} has an inconsistent buffer", i))?;
        let path = dir.join(format!("frame_{}.png", i));
        img.save(&path).with_context(|| format!("failed to write {}", path.display()))?;
    }

    let record = FailureRecord {
        kind: kind.as_str().to_string(),
        failed_at: now.to_rfc3339(),
        message: message.to_string(),
        frames: frames.len(),
    };
    fs::write(dir.join("record.json"), serde_json::to_string_pretty(&record)?)?;
    Ok(dir)
}
