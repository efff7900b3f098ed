//! Single-slot, overwrite-on-full channel plus the console listener that
//! feeds local commands through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

use crate::logger;
use crate::types::Command;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Create a mailbox. Only the most recent unread value survives.
pub fn channel<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let slot: Slot<T> = Arc::new(Mutex::new(None));
    (MailboxSender { slot: Arc::clone(&slot) }, MailboxReceiver { slot })
}

pub struct MailboxSender<T> {
    slot: Slot<T>,
}

impl<T> MailboxSender<T> {
    /// Store `value`, returning the unread value it displaced.
    pub fn send(&self, value: T) -> Option<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.replace(value)
    }
}

pub struct MailboxReceiver<T> {
    slot: Slot<T>,
}

impl<T> MailboxReceiver<T> {
    /// Take the pending value. Never blocks: a slot held by the sender
    /// reads as empty for this call.
    pub fn try_recv(&self) -> Option<T> {
        match self.slot.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(TryLockError::Poisoned(e)) => e.into_inner().take(),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// A console input relevant to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInput {
    Key(char),
    Interrupt,
}

/// Map console input to a command; other keys are ignored.
pub fn local_command(input: LocalInput) -> Option<Command> {
    match input {
        LocalInput::Key('r') | LocalInput::Key('R') => Some(Command::Register),
        LocalInput::Key('q') | LocalInput::Key('Q') | LocalInput::Interrupt => Some(Command::Quit),
        LocalInput::Key(_) => None,
    }
}

/// Source of console input, polled with a timeout.
pub trait InputSource: Send {
    fn poll_input(&mut self, timeout: Duration) -> Result<Option<LocalInput>>;
}

/// Terminal key presses via crossterm. Ctrl-C arrives here as a key
/// while the terminal is in raw mode.
pub struct ConsoleInput;

impl InputSource for ConsoleInput {
    fn poll_input(&mut self, timeout: Duration) -> Result<Option<LocalInput>> {
        if !event::poll(timeout)? {
            return Ok(None);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(None);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(None);
        }
        let input = match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => LocalInput::Interrupt,
            KeyCode::Char(c) => LocalInput::Key(c),
            _ => return Ok(None),
        };
        Ok(Some(input))
    }
}

/// Background thread relaying console commands into a mailbox.
pub struct CommandListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CommandListener {
    pub fn start(mut source: impl InputSource + 'static, tx: MailboxSender<Command>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::spawn(move || {
            while flag.load(Ordering::Acquire) {
                match source.poll_input(POLL_TIMEOUT) {
                    Ok(Some(input)) => {
                        let Some(cmd) = local_command(input) else { continue };
                        if let Some(lost) = tx.send(cmd) {
                            logger::warn_p("console", &format!("{:?} replaced unread {:?}", cmd, lost));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        logger::warn_p("console", &format!("input error: {}", e));
                        thread::sleep(POLL_TIMEOUT);
                    }
                }
            }
        });

        Self { running, handle: Some(handle) }
    }

    /// Stop listening. Returns within one poll timeout; a pending read
    /// is abandoned.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.stop();
    }
}
