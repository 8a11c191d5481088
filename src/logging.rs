use crate::engine::progress::Progress;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console writer that clears the progress animation around every event.
pub struct Suspending<W> {
    progress: Arc<dyn Progress>,
    inner: W,
}

impl<W> Suspending<W> {
    pub fn new(progress: Arc<dyn Progress>, inner: W) -> Self {
        Suspending { progress, inner }
    }
}

pub struct SuspendingWriter<'a, W> {
    progress: &'a dyn Progress,
    inner: W,
}

impl<'a, W: MakeWriter<'a>> MakeWriter<'a> for Suspending<W> {
    type Writer = SuspendingWriter<'a, W::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendingWriter {
            progress: &*self.progress,
            inner: self.inner.make_writer(),
        }
    }
}

impl<W: Write> Write for SuspendingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let inner = &mut self.inner;
        let mut result = Ok(buf.len());

        self.progress.suspend(&mut || {
            result = inner.write_all(buf).and_then(|()| inner.flush()).map(|()| buf.len());
        });

        result
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Installs the global subscriber: stderr plus a plain-text copy appended to `log_file`.
///
/// Console lines go through `progress`, so they never land on top of the
/// spinner. `RUST_LOG` takes precedence over `verbose`. Later calls are ignored.
pub fn init_logging(
    log_file: &Path,
    verbose: bool,
    progress: Arc<dyn Progress>,
) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(Suspending::new(progress, std::io::stderr)),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .ok();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::progress::tests::Recording;
    use crate::engine::progress::ProgressGuard;

    struct EventLog(Arc<Recording>);

    impl Write for EventLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.push("log");
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_are_written_with_the_animation_suspended() {
        let recording = Arc::new(Recording::default());
        let sink = recording.clone();

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Suspending::new(recording.clone(), move || {
                    EventLog(sink.clone())
                })),
        );

        tracing::subscriber::with_default(subscriber, || {
            let _guard = ProgressGuard::start(&*recording, "downloading");
            tracing::info!("download started");
            tracing::warn!("slow mirror");
        });

        let events = recording.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start downloading",
                "suspend",
                "log",
                "resume",
                "suspend",
                "log",
                "resume",
                "stop",
            ]
        );

        // Every write happens between a suspend and its resume.
        let mut suspended = false;
        for event in &events {
            match event.as_str() {
                "suspend" => suspended = true,
                "resume" => suspended = false,
                "log" => assert!(suspended),
                _ => {}
            }
        }
    }
}
