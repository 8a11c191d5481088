use anyhow::{bail, Context};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Executable directories prepended to the inherited `PATH`, newest first.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    #[cfg(test)]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.iter().any(|d| d == dir)
    }

    /// Returns `false` when `dir` was already present.
    pub fn prepend(&mut self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        if self.contains(&dir) {
            return false;
        }

        self.dirs.insert(0, dir);
        true
    }

    pub fn join_with(&self, inherited: &OsStr) -> anyhow::Result<OsString> {
        let paths = self
            .dirs
            .iter()
            .cloned()
            .chain(std::env::split_paths(inherited));

        std::env::join_paths(paths).context("executable directory contains a path separator")
    }
}

/// The process state every external command runs with.
///
/// Replaces mutation of the global `PATH`: installers extend the search path
/// through `&mut Environment`, everything else only reads it.
#[derive(Debug, Clone)]
pub struct Environment {
    search_path: SearchPath,
    inherited_path: OsString,
}

impl Environment {
    pub fn from_process() -> Self {
        Self::with_inherited_path(std::env::var_os("PATH").unwrap_or_default())
    }

    pub fn with_inherited_path(inherited_path: impl Into<OsString>) -> Self {
        Environment {
            search_path: SearchPath::default(),
            inherited_path: inherited_path.into(),
        }
    }

    #[cfg(test)]
    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    /// Adds `dir` in front of the search path unless it is already reachable.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        if std::env::split_paths(&self.inherited_path).any(|p| p == dir) {
            return false;
        }

        let added = self.search_path.prepend(&dir);
        if added {
            info!(dir = %dir.display(), "added to search path");
        }
        added
    }

    pub fn path_value(&self) -> anyhow::Result<OsString> {
        self.search_path.join_with(&self.inherited_path)
    }

    /// Looks `name` up on the augmented search path.
    pub fn which(&self, name: &str) -> Option<PathBuf> {
        let path = self.path_value().ok()?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn command<S: AsRef<OsStr>>(
        &self,
        program: impl AsRef<OsStr>,
        args: &[S],
        cwd: &Path,
    ) -> anyhow::Result<Command> {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd);
        cmd.args(args);
        cmd.env("PATH", self.path_value()?);
        cmd.stdin(Stdio::null());
        Ok(cmd)
    }

    /// Runs a command, failing on a non-zero exit.
    ///
    /// Output is forwarded line by line as log events instead of reaching the
    /// terminal directly, so it never tears through a progress animation.
    pub async fn run<S: AsRef<OsStr>>(
        &self,
        program: impl AsRef<OsStr>,
        args: &[S],
        cwd: &Path,
    ) -> anyhow::Result<()> {
        let line = command_line(program.as_ref(), args);
        info!(command = %line, cwd = %cwd.display(), "running");

        let mut child = self
            .command(program, args, cwd)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start `{}`", line))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, _, _) = tokio::join!(
            child.wait(),
            forward_lines(stdout, "stdout"),
            forward_lines(stderr, "stderr")
        );

        let status = status.with_context(|| format!("waiting for `{}`", line))?;
        if !status.success() {
            bail!("`{}` exited with {}", line, status);
        }

        Ok(())
    }

    /// Runs a command and returns its trimmed stdout.
    pub async fn capture<S: AsRef<OsStr>>(
        &self,
        program: impl AsRef<OsStr>,
        args: &[S],
        cwd: &Path,
    ) -> anyhow::Result<String> {
        let line = command_line(program.as_ref(), args);
        debug!(command = %line, cwd = %cwd.display(), "capturing");

        let output = self
            .command(program, args, cwd)?
            .output()
            .await
            .with_context(|| format!("failed to start `{}`", line))?;

        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, stream: &'static str) {
    let reader = match reader {
        Some(reader) => reader,
        None => return,
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream, "{}", line);
    }
}

fn command_line<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn search_path_never_duplicates() {
        let mut env = Environment::with_inherited_path("/usr/bin:/bin");

        assert!(env.prepend_path("/opt/node/bin"));
        assert!(env.prepend_path("/opt/local/bin"));
        assert!(!env.prepend_path("/opt/node/bin"));
        assert!(!env.prepend_path("/usr/bin"));

        assert_eq!(
            env.path_value().unwrap(),
            OsString::from("/opt/local/bin:/opt/node/bin:/usr/bin:/bin")
        );
    }

    #[test]
    fn which_searches_prepended_dirs_first() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("bin")).unwrap();
        std::fs::write(tmp.path().join("bin/kiln-fake-tool"), "").unwrap();

        let mut env = Environment::with_inherited_path("/nonexistent");
        assert_eq!(env.which("kiln-fake-tool"), None);

        env.prepend_path(tmp.path().join("bin"));
        assert_eq!(
            env.which("kiln-fake-tool"),
            Some(tmp.path().join("bin/kiln-fake-tool"))
        );
    }

    #[tokio::test]
    #[serial]
    async fn commands_see_the_augmented_path() {
        let tmp = TempDir::new().unwrap();
        let mut env = Environment::from_process();
        env.prepend_path(tmp.path().join("bin"));

        let path = env.capture("sh", &["-c", "echo $PATH"], tmp.path()).await.unwrap();
        assert!(path.starts_with(&*tmp.path().join("bin").to_string_lossy()));
    }

    #[tokio::test]
    #[serial]
    async fn failing_commands_are_errors() {
        let tmp = TempDir::new().unwrap();
        let env = Environment::from_process();

        let err = env.run("sh", &["-c", "exit 3"], tmp.path()).await.unwrap_err();
        assert!(err.to_string().contains("sh -c exit 3"));

        let err = env
            .capture("sh", &["-c", "echo oops >&2; exit 1"], tmp.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));
    }
}
