use crate::engine::progress::Progress;
use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const FRAME_DELAY: Duration = Duration::from_millis(80);

#[derive(Debug)]
struct Running {
    message: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Running {
    fn spawn(message: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let message = message.to_string();
            std::thread::spawn(move || Spinner::animate(stop, message))
        };

        Running {
            message: message.to_string(),
            stop,
            handle,
        }
    }

    /// Returns once the line is cleared and the thread is gone.
    fn halt(self) -> String {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
        self.message
    }
}

/// Animates on stderr from its own thread while an operation runs.
#[derive(Debug)]
pub struct Spinner {
    enabled: bool,
    running: Mutex<Option<Running>>,
}

impl Default for Spinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinner {
    /// Animation is disabled when stderr is not a terminal.
    pub fn new() -> Self {
        Spinner {
            enabled: std::io::stderr().is_terminal(),
            running: Mutex::new(None),
        }
    }

    fn animate(stop: Arc<AtomicBool>, message: String) {
        let mut stderr = std::io::stderr();
        let mut frame = 0;

        while !stop.load(Ordering::Relaxed) {
            let _ = write!(stderr, "\r{} {}", FRAMES[frame % FRAMES.len()], message);
            let _ = stderr.flush();
            frame += 1;
            std::thread::sleep(FRAME_DELAY);
        }

        let _ = write!(stderr, "\r{}\r", " ".repeat(message.chars().count() + 2));
        let _ = stderr.flush();
    }
}

impl Progress for Spinner {
    fn start(&self, message: &str) {
        self.stop();
        if !self.enabled {
            return;
        }

        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running::spawn(message));
        }
    }

    /// Joins the animation thread, so nothing is drawn after this returns.
    fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };

        if let Some(running) = running {
            running.halt();
        }
    }

    /// Holds the lock while `write` runs, so no frame can be drawn meanwhile.
    fn suspend(&self, write: &mut dyn FnMut()) {
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(_) => return write(),
        };

        match running.take() {
            Some(current) => {
                let message = current.halt();
                write();
                *running = Some(Running::spawn(&message));
            }
            None => write(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> Spinner {
        Spinner {
            enabled: true,
            running: Mutex::new(None),
        }
    }

    #[test]
    fn stop_joins_the_thread() {
        let spinner = enabled();

        spinner.start("working");
        assert!(spinner.running.lock().unwrap().is_some());

        spinner.stop();
        assert!(spinner.running.lock().unwrap().is_none());

        // Stopping twice is harmless.
        spinner.stop();
    }

    #[test]
    fn suspend_resumes_with_the_same_message() {
        let spinner = enabled();
        spinner.start("downloading");

        let mut wrote = false;
        spinner.suspend(&mut || wrote = true);
        assert!(wrote);

        let message = spinner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.message.clone());
        assert_eq!(message.as_deref(), Some("downloading"));

        spinner.stop();
    }

    #[test]
    fn suspend_without_animation_just_writes() {
        let spinner = enabled();
        let mut written = false;

        spinner.suspend(&mut || written = true);
        assert!(written);
        assert!(spinner.running.lock().unwrap().is_none());
    }
}
