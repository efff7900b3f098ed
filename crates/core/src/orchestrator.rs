use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossterm::style::Color;

use crate::archive::{FailurePolicy, UploadKind};
use crate::clock::{Cadence, Clock};
use crate::logger;
use crate::mailbox::MailboxReceiver;
use crate::motion::MotionGate;
use crate::platform::Platform;
use crate::settings::{secs, Settings};
use crate::types::*;

/// Sleep while the system is disabled.
const DISABLED_IDLE: Duration = Duration::from_millis(500);
/// Wait after a frame miss before the next tick.
const FRAME_WAIT: Duration = Duration::from_millis(10);
/// A frame drought longer than this is logged.
const FRAME_STALL: Duration = Duration::from_secs(5);

const EVENT_DIRECTION: &str = "enter";

/// Frames captured for one registration or event.
#[derive(Debug)]
pub struct Session {
    frames: Vec<Frame>,
    target: usize,
    last_capture: Option<Instant>,
}

impl Session {
    fn new(target: usize) -> Self {
        Self { frames: Vec::with_capacity(target), target, last_capture: None }
    }

    fn seeded(frame: Frame, now: Instant, target: usize) -> Self {
        let mut session = Self::new(target);
        session.push(frame, now);
        session
    }

    fn capture_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_capture
            .map_or(true, |t| now.saturating_duration_since(t) >= interval)
    }

    fn push(&mut self, frame: Frame, now: Instant) {
        self.frames.push(frame);
        self.last_capture = Some(now);
    }

    fn is_complete(&self) -> bool {
        self.frames.len() >= self.target
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Capture mode. A session exists exactly while capturing.
#[derive(Debug, Default)]
pub enum Mode {
    #[default]
    Idle,
    Registration(Session),
    Burst(Session),
}

impl Mode {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Mode::Idle => None,
            Mode::Registration(s) | Mode::Burst(s) => Some(s),
        }
    }
}

/// Live preview state. Calibration always streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preview {
    Off,
    Streaming,
    Calibrating,
}

/// What the loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Sleep(Duration),
    Quit,
}

pub struct Orchestrator {
    settings: Settings,
    zone: Zone,
    gate: MotionGate,
    platform: Platform,
    clock: Box<dyn Clock>,
    local: Option<MailboxReceiver<Command>>,
    interrupt: Option<Arc<AtomicBool>>,

    enabled: bool,
    mode: Mode,
    preview: Preview,

    heartbeat: Cadence,
    command_poll: Cadence,
    stream: Cadence,
    motion_check: Cadence,
    last_event: Option<Instant>,
    last_frame: Instant,
    started: Instant,
    preview_failing: bool,
}

impl Orchestrator {
    pub fn new(settings: Settings, zone: Zone, gate: MotionGate, platform: Platform, clock: Box<dyn Clock>) -> Self {
        logger::register_prefix("motion", Color::Magenta);
        logger::register_prefix("capture", Color::Green);
        logger::register_prefix("command", Color::Yellow);

        let now = clock.now();
        Self {
            heartbeat: Cadence::new(secs(settings.server.heartbeat_interval)),
            command_poll: Cadence::new(secs(settings.server.command_poll_interval)),
            stream: Cadence::new(settings.stream_interval()),
            motion_check: Cadence::new(secs(settings.motion.check_interval)),
            settings,
            zone,
            gate,
            platform,
            clock,
            local: None,
            interrupt: None,
            enabled: true,
            mode: Mode::Idle,
            preview: Preview::Off,
            last_event: None,
            last_frame: now,
            started: now,
            preview_failing: false,
        }
    }

    /// Also drain console commands from `rx` every tick.
    pub fn with_local_commands(mut self, rx: MailboxReceiver<Command>) -> Self {
        self.local = Some(rx);
        self
    }

    /// Quit at the next tick once `flag` is set, e.g. from a signal handler.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn preview(&self) -> Preview {
        self.preview
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Status reported in heartbeats.
    pub fn status(&self) -> &'static str {
        match (&self.mode, self.preview) {
            (Mode::Registration(_), _) => "registration",
            (Mode::Burst(_), _) => "burst",
            (Mode::Idle, Preview::Calibrating) => "calibration",
            (Mode::Idle, Preview::Streaming) => "streaming",
            (Mode::Idle, Preview::Off) => "idle",
        }
    }

    /// Run until quit or a fatal capture failure.
    pub fn run(&mut self) -> Result<()> {
        logger::info("control loop started");
        let result = loop {
            match self.tick() {
                Ok(Tick::Continue) => {}
                Ok(Tick::Sleep(d)) => self.clock.sleep(d),
                Ok(Tick::Quit) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    fn shutdown(&mut self) {
        if let Some(session) = std::mem::take(&mut self.mode).session() {
            logger::warn_p("capture", &format!("discarding {} unsent frame(s)", session.len()));
        }
        self.platform.camera.stop();
        logger::info("cleanup complete");
    }

    /// One loop iteration.
    pub fn tick(&mut self) -> Result<Tick> {
        if self.interrupt.as_ref().is_some_and(|f| f.load(Ordering::Acquire)) {
            logger::info("interrupted, shutting down");
            return Ok(Tick::Quit);
        }
        let now = self.clock.now();

        // heartbeat and command polling continue while disabled
        if self.heartbeat.due(now) {
            let uptime = now.saturating_duration_since(self.started).as_secs();
            let status = self.status();
            self.platform.backend.send_heartbeat(status, uptime);
            self.heartbeat.mark(now);
        }

        let mut poll_interval = self.command_poll.interval();
        if self.preview != Preview::Off {
            poll_interval *= 2;
        }
        if self.command_poll.due_every(now, poll_interval) {
            let remote = self.platform.backend.poll_commands();
            self.command_poll.mark(now);
            if let Some(cmd) = remote.as_ref().and_then(RemoteCommand::to_command) {
                if self.apply(cmd) == Tick::Quit {
                    return Ok(Tick::Quit);
                }
            }
        }

        if let Some(cmd) = self.local.as_ref().and_then(MailboxReceiver::try_recv) {
            if self.apply(cmd) == Tick::Quit {
                return Ok(Tick::Quit);
            }
        }

        if !self.enabled {
            return Ok(Tick::Sleep(DISABLED_IDLE));
        }

        let Some(frame) = self.platform.camera.read_next_frame() else {
            if !self.platform.camera.is_alive() {
                logger::error_p("camera", "capture process terminated");
                bail!("capture device terminated");
            }
            if now.saturating_duration_since(self.last_frame) > FRAME_STALL {
                logger::warn_p("camera", "no frames available");
                self.last_frame = now;
            }
            return Ok(Tick::Sleep(FRAME_WAIT));
        };
        self.last_frame = now;

        self.send_preview(&frame, now);
        if !self.advance_session(&frame, now) && self.preview != Preview::Calibrating {
            self.detect_crossing(&frame, now);
        }
        Ok(Tick::Continue)
    }

    /// Apply a control command. Returns `Tick::Quit` for quit.
    pub fn apply(&mut self, cmd: Command) -> Tick {
        logger::info_p("command", &format!("{:?}", cmd));
        match cmd {
            Command::SystemToggle { enabled } => {
                self.enabled = enabled;
                logger::info(if enabled { "system enabled" } else { "system disabled" });
                if !enabled {
                    self.end_capture("system disabled");
                    self.preview = Preview::Off;
                    self.gate.reset();
                }
            }
            Command::Register if !self.enabled => {
                logger::warn_p("command", "register ignored while disabled");
            }
            Command::Register => match self.mode {
                Mode::Registration(_) => {}
                _ => {
                    self.end_capture("registration requested");
                    logger::info_p("capture", "registration started");
                    self.mode = Mode::Registration(Session::new(self.settings.capture.burst_size));
                }
            },
            Command::StartStream if self.enabled => {
                if self.preview == Preview::Off {
                    self.preview = Preview::Streaming;
                    self.stream.reset();
                }
            }
            Command::StopStream => {
                if self.preview == Preview::Calibrating {
                    logger::warn_p("command", "calibration needs the stream, use stop_calibrate");
                } else {
                    self.preview = Preview::Off;
                }
            }
            Command::Calibrate if self.enabled => {
                self.preview = Preview::Calibrating;
                self.stream.reset();
                self.gate.reset();
            }
            Command::StopCalibrate => {
                self.preview = Preview::Off;
                self.end_capture("calibration stopped");
                self.gate.reset();
            }
            Command::StartStream | Command::Calibrate => {
                logger::warn_p("command", "ignored while disabled");
            }
            Command::Quit => {
                logger::info("shutting down");
                return Tick::Quit;
            }
        }
        Tick::Continue
    }

    /// Drop any in-progress session.
    fn end_capture(&mut self, reason: &str) {
        if let Some(session) = std::mem::take(&mut self.mode).session() {
            logger::info_p(
                "capture",
                &format!("{}: discarded {} captured frame(s)", reason, session.len()),
            );
        }
    }

    fn send_preview(&mut self, frame: &Frame, now: Instant) {
        if self.preview == Preview::Off || !self.stream.due(now) {
            return;
        }
        let quality = self.settings.camera.stream_quality;
        let sent = if self.preview == Preview::Calibrating {
            let annotated = frame.with_tripwires(&self.zone);
            self.platform.backend.send_preview_frame(&annotated, quality)
        } else {
            self.platform.backend.send_preview_frame(frame, quality)
        };
        if !sent && !self.preview_failing {
            logger::warn_p("backend", "preview frame not delivered");
        }
        self.preview_failing = !sent;
        self.stream.mark(now);
    }

    /// Capture into the active session and finish it once full. Returns
    /// false when no session is active.
    fn advance_session(&mut self, frame: &Frame, now: Instant) -> bool {
        let interval = secs(self.settings.capture.burst_interval);
        let complete = match &mut self.mode {
            Mode::Idle => return false,
            Mode::Registration(session) | Mode::Burst(session) => {
                if !session.is_complete() && session.capture_due(now, interval) {
                    session.push(frame.clone(), now);
                    logger::info_p("capture", &format!("{}/{}", session.len(), session.target));
                }
                session.is_complete()
            }
        };
        if complete {
            match std::mem::take(&mut self.mode) {
                Mode::Registration(session) => self.finish_registration(session),
                Mode::Burst(session) => self.finish_burst(session, now),
                Mode::Idle => {}
            }
        }
        true
    }

    fn finish_registration(&mut self, session: Session) {
        logger::info_p("capture", &format!("uploading registration ({} images)", session.len()));
        let result = self.platform.backend.register_person(None, &session.frames);
        if result.is_success() {
            logger::info_p(
                "capture",
                &format!("registered {} (unlabeled, name it on the dashboard)", person_label(&result.person_id)),
            );
        } else {
            let message = result.message.unwrap_or_else(|| "unknown error".into());
            logger::error_p("capture", &format!("registration failed: {}", message));
            self.keep_failed(UploadKind::Registration, &session, &message);
        }
    }

    fn finish_burst(&mut self, session: Session, now: Instant) {
        logger::info_p("capture", &format!("sending event ({} images)", session.len()));
        let result = self.platform.backend.send_event(EVENT_DIRECTION, &session.frames);
        let id = person_label(&result.person_id);
        match result.status.as_str() {
            "success" => {
                let similarity = result.similarity.unwrap_or(0.0) * 100.0;
                match &result.name {
                    Some(name) => logger::info(&format!("recognized {} ({}) {:.1}%", name, id, similarity)),
                    None => logger::info(&format!("unknown person {} {:.1}%", id, similarity)),
                }
            }
            "unknown_registered" => logger::info(&format!("unknown person registered: {}", id)),
            _ => {
                let message = result.message.clone().unwrap_or_else(|| "unknown error".into());
                logger::error_p("capture", &format!("event failed: {}", message));
                self.keep_failed(UploadKind::Event, &session, &message);
            }
        }
        self.last_event = Some(now);
        self.gate.clear_cooldown();
    }

    fn keep_failed(&self, kind: UploadKind, session: &Session, message: &str) {
        let policy: &FailurePolicy = &self.settings.capture.failure_policy;
        match policy.handle(kind, &session.frames, message) {
            Ok(Some(dir)) => logger::info_p("capture", &format!("kept for retry in {}", dir.display())),
            Ok(None) => {}
            Err(e) => logger::error_p("capture", &format!("could not archive failed upload: {:#}", e)),
        }
    }

    fn detect_crossing(&mut self, frame: &Frame, now: Instant) {
        if !self.motion_check.due(now) {
            return;
        }
        self.motion_check.mark(now);

        let check = match self.gate.check_motion(frame) {
            Ok(check) => check,
            Err(e) => {
                logger::error_p("motion", &format!("{:#}", e));
                return;
            }
        };
        if !check.triggered {
            return;
        }
        logger::info_p("motion", &format!("score {:.1}, running detector", check.score));

        let detections = match self.platform.recognizer.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                logger::error_p("motion", &format!("detector failed: {:#}", e));
                return;
            }
        };
        if !detections.iter().any(|d| self.zone.contains(d.center_x())) {
            return;
        }

        let cooldown = secs(self.settings.capture.event_cooldown);
        if self.last_event.is_some_and(|t| now.saturating_duration_since(t) < cooldown) {
            logger::info_p("motion", "object in zone during event cooldown, ignored");
            return;
        }

        logger::info_p("capture", "object in zone, starting capture");
        let session = Session::seeded(frame.clone(), now, self.settings.capture.burst_size);
        if session.is_complete() {
            self.finish_burst(session, now);
        } else {
            self.mode = Mode::Burst(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::clock::ManualClock;
    use crate::mailbox;
    use crate::platform::{BackendClient, FrameSource, RecognitionEngine};

    const W: u32 = 64;
    const H: u32 = 32;

    #[derive(Default)]
    struct Calls {
        heartbeats: Vec<String>,
        polls: usize,
        events: Vec<(String, usize)>,
        registrations: Vec<usize>,
        previews: Vec<Frame>,
        detects: usize,
    }

    #[derive(Clone, Default)]
    struct Shared {
        calls: Arc<Mutex<Calls>>,
        commands: Arc<Mutex<VecDeque<RemoteCommand>>>,
        frames: Arc<Mutex<VecDeque<Frame>>>,
        boxes: Arc<Mutex<Vec<Detection>>>,
        event_status: Arc<Mutex<String>>,
        registration_status: Arc<Mutex<String>>,
        camera_dead: Arc<Mutex<bool>>,
        camera_stopped: Arc<Mutex<bool>>,
    }

    struct FakeCamera(Shared);
    struct FakeRecognizer(Shared);
    struct FakeBackend(Shared);

    impl FrameSource for FakeCamera {
        fn read_next_frame(&mut self) -> Option<Frame> {
            self.0.frames.lock().unwrap().pop_front()
        }

        fn is_alive(&mut self) -> bool {
            !*self.0.camera_dead.lock().unwrap()
        }

        fn stop(&mut self) {
            *self.0.camera_stopped.lock().unwrap() = true;
        }
    }

    impl RecognitionEngine for FakeRecognizer {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.0.calls.lock().unwrap().detects += 1;
            Ok(self.0.boxes.lock().unwrap().clone())
        }
    }

    impl BackendClient for FakeBackend {
        fn send_heartbeat(&mut self, status: &str, _uptime_secs: u64) -> bool {
            self.0.calls.lock().unwrap().heartbeats.push(status.to_string());
            true
        }

        fn poll_commands(&mut self) -> Option<RemoteCommand> {
            self.0.calls.lock().unwrap().polls += 1;
            self.0.commands.lock().unwrap().pop_front()
        }

        fn send_event(&mut self, direction: &str, frames: &[Frame]) -> EventResponse {
            self.0.calls.lock().unwrap().events.push((direction.to_string(), frames.len()));
            let status = self.0.event_status.lock().unwrap().clone();
            if status == "success" {
                EventResponse { status, ..Default::default() }
            } else {
                EventResponse::failed("HTTP 502")
            }
        }

        fn register_person(&mut self, _name: Option<&str>, frames: &[Frame]) -> RegistrationResponse {
            self.0.calls.lock().unwrap().registrations.push(frames.len());
            let status = self.0.registration_status.lock().unwrap().clone();
            if status == "success" {
                RegistrationResponse { status, ..Default::default() }
            } else {
                RegistrationResponse::failed("HTTP 500")
            }
        }

        fn send_preview_frame(&mut self, frame: &Frame, _quality: u8) -> bool {
            self.0.calls.lock().unwrap().previews.push(frame.clone());
            true
        }
    }

    struct Harness {
        orch: Orchestrator,
        shared: Shared,
        clock: ManualClock,
    }

    fn loop_settings() -> Settings {
        let mut s = Settings::default();
        s.camera.width = W;
        s.camera.height = H;
        s.camera.stream_fps = 2.0;
        s.zone.outer_x = 16;
        s.zone.inner_x = 48;
        s.server.heartbeat_interval = 10.0;
        s.server.command_poll_interval = 1.0;
        s.motion.sample_size = 100;
        s.motion.threshold = 20.0;
        s.motion.min_consecutive = 1;
        s.motion.cooldown = 3;
        s.motion.check_interval = 1.0;
        s.motion.seed = Some(3);
        s.capture.burst_size = 5;
        s.capture.burst_interval = 0.5;
        s.capture.event_cooldown = 10.0;
        s
    }

    fn harness_with(settings: Settings) -> Harness {
        let shared = Shared::default();
        *shared.event_status.lock().unwrap() = "success".into();
        *shared.registration_status.lock().unwrap() = "success".into();
        let clock = ManualClock::new();
        let zone = settings.zone.zone();
        let gate = MotionGate::from_settings(zone, W, H, &settings.motion).unwrap();
        let platform = Platform {
            camera: Box::new(FakeCamera(shared.clone())),
            recognizer: Box::new(FakeRecognizer(shared.clone())),
            backend: Box::new(FakeBackend(shared.clone())),
        };
        let orch = Orchestrator::new(settings, zone, gate, platform, Box::new(clock.clone()));
        Harness { orch, shared, clock }
    }

    fn harness() -> Harness {
        harness_with(loop_settings())
    }

    /// Fresh archive root under the temp dir, unique per test.
    fn archive_root(name: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!("tripwire-{}-{}", name, std::process::id()));
        std::fs::remove_dir_all(&root).ok();
        root
    }

    /// Names of the archived session directories, plus their frame counts.
    fn archived(root: &std::path::Path) -> Vec<(String, usize)> {
        let Ok(entries) = std::fs::read_dir(root) else { return Vec::new() };
        entries
            .map(|e| {
                let path = e.unwrap().path();
                let frames = std::fs::read_dir(&path)
                    .unwrap()
                    .filter(|f| f.as_ref().unwrap().path().extension().is_some_and(|x| x == "png"))
                    .count();
                (path.file_name().unwrap().to_string_lossy().into_owned(), frames)
            })
            .collect()
    }

    fn gray(v: u8) -> Frame {
        Frame::filled(W, H, [v, v, v])
    }

    fn centered_at(x: i32) -> Detection {
        Detection { x: x - 5, y: 0, width: 10, height: 20, confidence: 0.9 }
    }

    impl Harness {
        fn push_frame(&self, frame: Frame) {
            self.shared.frames.lock().unwrap().push_back(frame);
        }

        fn push_command(&self, name: &str, params: serde_json::Value) {
            self.shared.commands.lock().unwrap().push_back(RemoteCommand {
                command: Some(name.into()),
                params,
            });
        }

        fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
            self.shared.calls.lock().unwrap()
        }

        /// Feed one frame, tick, then advance the clock.
        fn step(&mut self, frame: Frame, advance: f64) -> Tick {
            self.push_frame(frame);
            let tick = self.orch.tick().unwrap();
            self.clock.advance_secs(advance);
            tick
        }

        /// Baseline then a jump: triggers the gate on the second step.
        fn trigger_crossing(&mut self, x: i32) {
            *self.shared.boxes.lock().unwrap() = vec![centered_at(x)];
            self.step(gray(0), 1.0);
            self.step(gray(100), 0.5);
        }

        fn session_len(&self) -> usize {
            self.orch.mode().session().map_or(0, Session::len)
        }
    }

    #[test]
    fn test_crossing_starts_burst() {
        let mut h = harness();
        h.trigger_crossing(30);
        assert!(matches!(h.orch.mode(), Mode::Burst(_)));
        assert_eq!(h.session_len(), 1);
        assert_eq!(h.orch.status(), "burst");
        assert_eq!(h.calls().detects, 1);
    }

    #[test]
    fn test_box_centered_on_boundary_is_outside() {
        for x in [16, 48] {
            let mut h = harness();
            h.trigger_crossing(x);
            assert!(matches!(h.orch.mode(), Mode::Idle), "center {} counted as in zone", x);
            assert_eq!(h.calls().detects, 1);
        }
    }

    #[test]
    fn test_motion_checked_on_slow_cadence() {
        let mut h = harness();
        *h.shared.boxes.lock().unwrap() = vec![centered_at(30)];
        h.step(gray(0), 0.2);
        // too soon for the second check; the jump is not compared yet
        h.step(gray(100), 0.2);
        h.step(gray(100), 1.0);
        assert_eq!(h.calls().detects, 0);
        h.step(gray(100), 1.0);
        assert_eq!(h.calls().detects, 1);
    }

    #[test]
    fn test_burst_completion_sends_one_event() {
        let mut h = harness();
        h.trigger_crossing(30);
        for _ in 0..4 {
            h.step(gray(100), 0.5);
        }
        {
            let calls = h.calls();
            assert_eq!(calls.events, vec![("enter".to_string(), 5)]);
        }
        assert!(matches!(h.orch.mode(), Mode::Idle));
        assert_eq!(h.session_len(), 0);
        assert_eq!(h.orch.status(), "idle");
        // gate cooldown cleared so the next check samples right away
        assert_eq!(h.orch.gate.cooldown_remaining(), 0);
    }

    #[test]
    fn test_failed_burst_still_resets_to_streaming() {
        let mut h = harness();
        *h.shared.event_status.lock().unwrap() = "error".into();
        h.orch.apply(Command::StartStream);
        h.trigger_crossing(30);
        for _ in 0..4 {
            h.step(gray(100), 0.5);
        }
        assert_eq!(h.calls().events.len(), 1);
        assert!(matches!(h.orch.mode(), Mode::Idle));
        assert_eq!(h.orch.preview(), Preview::Streaming);
        assert_eq!(h.orch.status(), "streaming");
    }

    #[test]
    fn test_event_cooldown_blocks_second_burst() {
        let mut h = harness();
        h.trigger_crossing(30);
        for _ in 0..4 {
            h.step(gray(100), 0.5);
        }
        assert_eq!(h.calls().events.len(), 1);

        // crossing right after the event: inside the 10s cooldown
        h.step(gray(0), 1.0);
        assert_eq!(h.calls().detects, 2);
        assert!(matches!(h.orch.mode(), Mode::Idle));

        h.clock.advance_secs(10.0);
        for _ in 0..3 {
            h.step(gray(0), 1.0);
        }
        assert_eq!(h.calls().detects, 2);
        h.step(gray(100), 1.0);
        assert_eq!(h.calls().detects, 3);
        assert!(matches!(h.orch.mode(), Mode::Burst(_)));
    }

    #[test]
    fn test_disable_during_burst_discards_session() {
        let mut h = harness();
        h.orch.apply(Command::StartStream);
        h.trigger_crossing(30);
        h.step(gray(100), 0.5);
        assert_eq!(h.session_len(), 2);

        h.push_command("system_toggle", serde_json::json!({"enabled": false}));
        h.clock.advance_secs(2.0);
        assert_eq!(h.orch.tick().unwrap(), Tick::Sleep(DISABLED_IDLE));
        assert!(!h.orch.is_enabled());
        assert!(matches!(h.orch.mode(), Mode::Idle));
        assert_eq!(h.orch.preview(), Preview::Off);
        assert!(h.calls().events.is_empty());
    }

    #[test]
    fn test_disabled_skips_processing_but_keeps_heartbeat() {
        let mut h = harness();
        h.orch.apply(Command::SystemToggle { enabled: false });
        h.orch.apply(Command::StartStream);
        h.orch.apply(Command::Register);
        assert_eq!(h.orch.preview(), Preview::Off);
        assert!(matches!(h.orch.mode(), Mode::Idle));

        *h.shared.boxes.lock().unwrap() = vec![centered_at(30)];
        for v in [0, 100, 0, 100] {
            assert_eq!(h.step(gray(v), 6.0), Tick::Sleep(DISABLED_IDLE));
        }
        let calls = h.calls();
        assert_eq!(calls.detects, 0);
        assert!(calls.previews.is_empty());
        assert_eq!(calls.heartbeats, vec!["idle"; 2]);
        assert_eq!(calls.polls, 4);
        drop(calls);
        // frames were never read
        assert_eq!(h.shared.frames.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_reenable_resumes() {
        let mut h = harness();
        h.orch.apply(Command::SystemToggle { enabled: false });
        h.push_command("system_toggle", serde_json::json!({}));
        h.step(gray(0), 1.0);
        assert!(h.orch.is_enabled());
    }

    #[test]
    fn test_registration_flow() {
        let mut h = harness();
        h.push_command("register", serde_json::Value::Null);
        for _ in 0..5 {
            h.step(gray(50), 0.5);
        }
        assert_eq!(h.calls().registrations, vec![5]);
        assert!(matches!(h.orch.mode(), Mode::Idle));
        // motion detection did not run while registering
        assert_eq!(h.calls().detects, 0);
    }

    #[test]
    fn test_registration_respects_capture_interval() {
        let mut h = harness();
        h.orch.apply(Command::Register);
        h.step(gray(50), 0.1);
        h.step(gray(50), 0.1);
        h.step(gray(50), 0.4);
        h.step(gray(50), 0.1);
        assert_eq!(h.session_len(), 2);
    }

    #[test]
    fn test_register_replaces_burst() {
        let mut h = harness();
        h.trigger_crossing(30);
        assert!(matches!(h.orch.mode(), Mode::Burst(_)));
        h.orch.apply(Command::Register);
        assert!(matches!(h.orch.mode(), Mode::Registration(_)));
        assert_eq!(h.session_len(), 0);
        // a second register does not restart the session
        h.step(gray(0), 0.5);
        h.orch.apply(Command::Register);
        assert_eq!(h.session_len(), 1);
    }

    #[test]
    fn test_local_register_and_quit() {
        let (tx, rx) = mailbox::channel();
        let mut h = harness();
        h.orch.local = Some(rx);

        tx.send(Command::Register);
        h.step(gray(0), 0.5);
        assert!(matches!(h.orch.mode(), Mode::Registration(_)));

        tx.send(Command::Quit);
        assert_eq!(h.step(gray(0), 0.5), Tick::Quit);
    }

    #[test]
    fn test_streaming_cadence_and_calibration_overlay() {
        let mut h = harness();
        h.orch.apply(Command::StartStream);
        h.step(gray(0), 0.3);
        h.step(gray(0), 0.3);
        h.step(gray(0), 0.3);
        assert_eq!(h.calls().previews.len(), 2);

        h.orch.apply(Command::Calibrate);
        h.step(gray(0), 0.5);
        let calls = h.calls();
        let last = calls.previews.last().unwrap();
        assert_eq!(last.pixel(0, 16), [0, 255, 255]);
        assert_eq!(last.pixel(0, 48), [0, 0, 255]);
    }

    #[test]
    fn test_calibration_requires_stream() {
        let mut h = harness();
        h.orch.apply(Command::Calibrate);
        assert_eq!(h.orch.preview(), Preview::Calibrating);
        h.orch.apply(Command::StopStream);
        assert_eq!(h.orch.preview(), Preview::Calibrating);
        assert_eq!(h.orch.status(), "calibration");

        h.orch.apply(Command::StopCalibrate);
        assert_eq!(h.orch.preview(), Preview::Off);
        assert_eq!(h.orch.status(), "idle");
    }

    #[test]
    fn test_no_motion_checks_while_calibrating() {
        let mut h = harness();
        h.orch.apply(Command::Calibrate);
        *h.shared.boxes.lock().unwrap() = vec![centered_at(30)];
        for v in [0, 100, 0, 100] {
            h.step(gray(v), 1.0);
        }
        assert_eq!(h.calls().detects, 0);
    }

    #[test]
    fn test_command_poll_slows_while_streaming() {
        let mut h = harness();
        h.orch.apply(Command::StartStream);
        for _ in 0..4 {
            h.step(gray(0), 1.0);
        }
        assert_eq!(h.calls().polls, 2);
    }

    #[test]
    fn test_frame_miss_sleeps_and_dead_camera_is_fatal() {
        let mut h = harness();
        assert_eq!(h.orch.tick().unwrap(), Tick::Sleep(FRAME_WAIT));
        *h.shared.camera_dead.lock().unwrap() = true;
        assert!(h.orch.tick().is_err());
    }

    #[test]
    fn test_run_stops_on_remote_quit() {
        let mut h = harness();
        h.push_command("quit", serde_json::Value::Null);
        h.orch.run().unwrap();
    }

    #[test]
    fn test_unknown_remote_command_is_ignored() {
        let mut h = harness();
        h.push_command("self_destruct", serde_json::Value::Null);
        assert_eq!(h.step(gray(0), 1.0), Tick::Continue);
        assert!(h.orch.is_enabled());
    }

    #[test]
    fn test_single_frame_burst_sends_exactly_one_frame() {
        let mut settings = loop_settings();
        settings.capture.burst_size = 1;
        let mut h = harness_with(settings);
        h.trigger_crossing(30);
        assert_eq!(h.calls().events, vec![("enter".to_string(), 1)]);
        assert!(matches!(h.orch.mode(), Mode::Idle));

        h.step(gray(100), 0.5);
        h.step(gray(100), 0.5);
        assert_eq!(h.calls().events.len(), 1);
    }

    #[test]
    fn test_full_session_takes_no_extra_frames() {
        let mut settings = loop_settings();
        settings.capture.burst_size = 2;
        let mut h = harness_with(settings);
        h.trigger_crossing(30);
        h.step(gray(100), 0.5);
        assert_eq!(h.calls().events, vec![("enter".to_string(), 2)]);
    }

    #[test]
    fn test_calibration_round_trip_resets_gate() {
        let mut h = harness();
        *h.shared.boxes.lock().unwrap() = vec![centered_at(30)];
        h.step(gray(0), 1.0);

        h.orch.apply(Command::Calibrate);
        h.orch.apply(Command::StopCalibrate);
        // first check after the regime change is a fresh baseline
        h.step(gray(100), 1.0);
        assert_eq!(h.calls().detects, 0);
        h.step(gray(0), 1.0);
        assert_eq!(h.calls().detects, 1);
    }

    #[test]
    fn test_disable_resets_gate() {
        let mut h = harness();
        *h.shared.boxes.lock().unwrap() = vec![centered_at(30)];
        h.step(gray(0), 1.0);

        h.orch.apply(Command::SystemToggle { enabled: false });
        h.orch.apply(Command::SystemToggle { enabled: true });
        h.step(gray(100), 1.0);
        assert_eq!(h.calls().detects, 0);
    }

    #[test]
    fn test_failed_event_is_archived() {
        let root = archive_root("event");
        let mut settings = loop_settings();
        settings.capture.failure_policy = FailurePolicy::Archive { dir: root.clone() };
        let mut h = harness_with(settings);
        *h.shared.event_status.lock().unwrap() = "error".into();

        h.trigger_crossing(30);
        for _ in 0..4 {
            h.step(gray(100), 0.5);
        }
        let kept = archived(&root);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].0.starts_with("event_"));
        assert_eq!(kept[0].1, 5);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_successful_event_is_not_archived() {
        let root = archive_root("event-ok");
        let mut settings = loop_settings();
        settings.capture.failure_policy = FailurePolicy::Archive { dir: root.clone() };
        let mut h = harness_with(settings);

        h.trigger_crossing(30);
        for _ in 0..4 {
            h.step(gray(100), 0.5);
        }
        assert_eq!(h.calls().events.len(), 1);
        assert!(archived(&root).is_empty());
    }

    #[test]
    fn test_failed_registration_clears_session_and_keeps_preview() {
        let root = archive_root("registration");
        let mut settings = loop_settings();
        settings.capture.failure_policy = FailurePolicy::Archive { dir: root.clone() };
        let mut h = harness_with(settings);
        *h.shared.registration_status.lock().unwrap() = "error".into();

        h.orch.apply(Command::StartStream);
        h.orch.apply(Command::Register);
        for _ in 0..5 {
            h.step(gray(50), 0.5);
        }
        assert_eq!(h.calls().registrations, vec![5]);
        assert!(matches!(h.orch.mode(), Mode::Idle));
        assert_eq!(h.session_len(), 0);
        assert_eq!(h.orch.preview(), Preview::Streaming);

        let kept = archived(&root);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].0.starts_with("registration_"));
        assert_eq!(kept[0].1, 5);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_interrupt_quits_and_stops_camera() {
        let flag = Arc::new(AtomicBool::new(false));
        let Harness { orch, shared, clock } = harness();
        let mut h = Harness { orch: orch.with_interrupt(Arc::clone(&flag)), shared, clock };

        h.orch.apply(Command::Register);
        assert_eq!(h.step(gray(0), 0.5), Tick::Continue);

        flag.store(true, Ordering::Release);
        h.orch.run().unwrap();
        assert!(*h.shared.camera_stopped.lock().unwrap());
        assert!(matches!(h.orch.mode(), Mode::Idle));
        assert!(h.calls().registrations.is_empty());
    }
}
