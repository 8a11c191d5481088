use crate::engine::environment::Environment;
use crate::engine::progress::{Progress, ProgressGuard};
use crate::engine::EngineSettings;
use crate::utils::{path_exists, remove_path};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const CONNECTIVITY_URL: &str = "https://github.com";

const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloneOutcome {
    Cloned,
    /// The directory existed and was kept.
    AlreadyPresent,
}

#[derive(Debug)]
pub struct Repository {
    settings: Arc<EngineSettings>,
    progress: Arc<dyn Progress>,
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

impl Repository {
    pub fn new(settings: Arc<EngineSettings>, progress: Arc<dyn Progress>) -> Self {
        Repository { settings, progress }
    }

    pub fn path(&self) -> PathBuf {
        self.settings.repo_path()
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        Ok(path_exists(self.path()).await?)
    }

    /// Clones the project repository, removing an existing checkout first when `replace` is set.
    pub async fn clone_project(
        &self,
        env: &Environment,
        replace: bool,
    ) -> anyhow::Result<CloneOutcome> {
        let path = self.path();

        if self.exists().await? {
            if !replace {
                info!(path = %path.display(), "repository already present");
                self.relax_permissions(env).await;
                return Ok(CloneOutcome::AlreadyPresent);
            }

            warn!(path = %path.display(), "removing existing repository");
            remove_path(&path).await?;
        }

        let workdir = self.settings.workdir();
        tokio::fs::create_dir_all(workdir).await?;

        let repository = self.settings.project().repository.as_str();
        let target = path.to_string_lossy().into_owned();

        {
            let _progress =
                ProgressGuard::start(&*self.progress, &format!("Cloning {}", repository));
            env.run("git", &["clone", repository, target.as_str()], workdir)
                .await
                .with_context(|| format!("cloning {}", repository))?;
        }

        self.relax_permissions(env).await;
        info!(path = %path.display(), "repository cloned");

        Ok(CloneOutcome::Cloned)
    }

    /// Makes the checkout writable for every user. Failures are only logged.
    async fn relax_permissions(&self, env: &Environment) {
        let target = self.path().to_string_lossy().into_owned();
        let workdir = self.settings.workdir();

        let result = if is_root() {
            env.run("chmod", &["-R", "777", target.as_str()], workdir)
                .await
        } else {
            env.run("sudo", &["chmod", "-R", "777", target.as_str()], workdir)
                .await
        };

        if let Err(e) = result {
            warn!(error = %e, "could not relax repository permissions");
        }
    }

    pub async fn reset(&self) -> anyhow::Result<bool> {
        let removed = remove_path(self.path()).await?;
        if removed {
            info!(path = %self.path().display(), "repository removed");
        }

        Ok(removed)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Prerequisites {
    pub git: String,
    pub sudo: bool,
    pub online: bool,
}

/// Checks for the tools the workflow shells out to.
///
/// Only a missing git is an error.
pub async fn check_prerequisites(
    env: &Environment,
    connectivity_url: &str,
) -> anyhow::Result<Prerequisites> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    let git = env
        .capture("git", &["--version"], &cwd)
        .await
        .context("git is required but could not be run")?;
    info!(%git, "git found");

    let sudo = env.which("sudo").is_some();
    if !sudo {
        warn!("sudo not found, some permission fixes may fail");
    }

    let online = match reqwest::Client::new()
        .head(connectivity_url)
        .timeout(CONNECTIVITY_TIMEOUT)
        .send()
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(url = connectivity_url, error = %e, "no internet connectivity");
            false
        }
    };

    Ok(Prerequisites { git, sudo, online })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::installer::tests::{test_settings, write_script};
    use crate::engine::progress::Silent;
    use serial_test::serial;
    use tempfile::TempDir;

    const FAKE_GIT: &[u8] = br#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "git version 2.43.0"; exit 0; fi
echo "$@" >> "$(dirname "$0")/git.log"
mkdir -p "$3"
echo '{"name": "web"}' > "$3/package.json"
"#;

    fn fake_tools(tmp: &TempDir) -> Environment {
        let bin = tmp.path().join("fake-bin");
        write_script(&bin.join("git"), FAKE_GIT);
        write_script(&bin.join("sudo"), b"#!/bin/sh\nexec \"$@\"\n");

        let mut env = Environment::from_process();
        env.prepend_path(&bin);
        env
    }

    fn git_calls(tmp: &TempDir) -> usize {
        std::fs::read_to_string(tmp.path().join("fake-bin/git.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    #[serial]
    async fn clones_once_unless_replaced() {
        let tmp = TempDir::new().unwrap();
        let env = fake_tools(&tmp);
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let repo = Repository::new(settings.clone(), Arc::new(Silent));

        assert_eq!(
            repo.clone_project(&env, false).await.unwrap(),
            CloneOutcome::Cloned
        );
        assert!(settings.repo_path().join("package.json").exists());

        std::fs::write(settings.repo_path().join("local-change"), "x").unwrap();
        assert_eq!(
            repo.clone_project(&env, false).await.unwrap(),
            CloneOutcome::AlreadyPresent
        );
        assert_eq!(git_calls(&tmp), 1);

        assert_eq!(
            repo.clone_project(&env, true).await.unwrap(),
            CloneOutcome::Cloned
        );
        assert!(!settings.repo_path().join("local-change").exists());
        assert_eq!(git_calls(&tmp), 2);
    }

    #[tokio::test]
    #[serial]
    async fn existing_checkout_is_made_writable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let env = fake_tools(&tmp);
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let checkout = settings.repo_path();
        std::fs::create_dir_all(&checkout).unwrap();
        std::fs::set_permissions(&checkout, std::fs::Permissions::from_mode(0o755)).unwrap();

        let repo = Repository::new(settings, Arc::new(Silent));
        assert_eq!(
            repo.clone_project(&env, false).await.unwrap(),
            CloneOutcome::AlreadyPresent
        );

        let mode = std::fs::metadata(&checkout).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        assert_eq!(git_calls(&tmp), 0);
    }

    #[tokio::test]
    #[serial]
    async fn failed_clone_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("fake-bin");
        write_script(&bin.join("git"), b"#!/bin/sh\nexit 128\n");
        let mut env = Environment::from_process();
        env.prepend_path(&bin);

        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let repo = Repository::new(settings, Arc::new(Silent));

        let err = repo.clone_project(&env, false).await.unwrap_err();
        assert!(format!("{:#}", err).contains("cloning https://example.com/web.git"));
    }

    #[tokio::test]
    async fn reset_removes_the_checkout() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        std::fs::create_dir_all(settings.repo_path().join("src")).unwrap();
        let repo = Repository::new(settings.clone(), Arc::new(Silent));

        assert!(repo.reset().await.unwrap());
        assert!(!repo.reset().await.unwrap());
        assert!(!settings.repo_path().exists());
    }

    #[tokio::test]
    #[serial]
    async fn prerequisites_report_git_and_connectivity() {
        let tmp = TempDir::new().unwrap();
        let env = fake_tools(&tmp);
        let mut server = mockito::Server::new_async().await;
        server.mock("HEAD", "/").create_async().await;

        let found = check_prerequisites(&env, &server.url()).await.unwrap();

        assert_eq!(found.git, "git version 2.43.0");
        assert!(found.sudo);
        assert!(found.online);
    }

    #[tokio::test]
    #[serial]
    async fn missing_git_is_fatal() {
        let env = Environment::with_inherited_path("/nonexistent");

        assert!(check_prerequisites(&env, "http://127.0.0.1:9").await.is_err());
    }
}
