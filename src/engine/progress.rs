use std::fmt::Debug;

/// Receives start/stop notifications around long running operations.
///
/// Every `start` is followed by exactly one `stop`. Anything written to the
/// terminal in between must go through [`Progress::suspend`], so a front end
/// may draw an animation while the operation runs.
pub trait Progress: Send + Sync + Debug {
    fn start(&self, message: &str);
    fn stop(&self);

    /// Runs `write` with any animation cleared from the screen.
    fn suspend(&self, write: &mut dyn FnMut()) {
        write()
    }
}

#[derive(Debug, Default)]
pub struct Silent;

impl Progress for Silent {
    fn start(&self, _message: &str) {}
    fn stop(&self) {}
}

/// Stops the progress indicator when dropped, including on early `?` returns.
pub struct ProgressGuard<'a> {
    progress: &'a dyn Progress,
}

impl<'a> ProgressGuard<'a> {
    pub fn start(progress: &'a dyn Progress, message: &str) -> Self {
        progress.start(message);
        ProgressGuard { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.stop();
    }
}
