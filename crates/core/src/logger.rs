use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::Local;
use crossterm::style::{Color, Stylize};

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

struct Logger {
    file: File,
    prefixes: HashMap<String, Color>,
}

/// Initialize the global logger. Truncates `app.log` in `log_dir`.
pub fn init(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let log_path = log_dir.join("app.log");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    LOGGER
        .set(Mutex::new(Logger { file, prefixes: HashMap::new() }))
        .ok();
    Ok(())
}

/// Register a prefix with a console color for the `*_p` functions.
pub fn register_prefix(prefix: &str, color: Color) {
    if let Some(logger) = LOGGER.get() {
        if let Ok(mut l) = logger.lock() {
            l.prefixes.insert(prefix.to_string(), color);
        }
    }
}

fn write_log(level: &str, prefix: &str, msg: &str) {
    let Some(logger) = LOGGER.get() else { return };
    let Ok(mut l) = logger.lock() else { return };

    let ts = Local::now().format("%H:%M:%S").to_string();

    let file_line = if prefix.is_empty() {
        format!("[{}] [{}] {}", ts, level, msg)
    } else {
        format!("[{}] [{}] [{}] {}", ts, level, prefix, msg)
    };
    writeln!(l.file, "{}", file_line).ok();

    // Console echo. Explicit \r keeps lines aligned when the terminal is in raw mode.
    let mut line = format!("{} ", ts.as_str().dark_grey());
    match level {
        "ERROR" => line.push_str(&format!("{} ", "error".red())),
        "WARN" => line.push_str(&format!("{} ", "warn".yellow())),
        _ => {}
    }
    if !prefix.is_empty() {
        let color = l.prefixes.get(prefix).copied().unwrap_or(Color::White);
        line.push_str(&format!("{} ", prefix.with(color).bold()));
    }
    line.push_str(msg);
    eprint!("{}\r\n", line);
}

pub fn info(msg: &str) {
    write_log("INFO", "", msg);
}

pub fn warn(msg: &str) {
    write_log("WARN", "", msg);
}

pub fn error(msg: &str) {
    write_log("ERROR", "", msg);
}

pub fn info_p(prefix: &str, msg: &str) {
    write_log("INFO", prefix, msg);
}

pub fn warn_p(prefix: &str, msg: &str) {
    write_log("WARN", prefix, msg);
}

pub fn error_p(prefix: &str, msg: &str) {
    write_log("ERROR", prefix, msg);
}
