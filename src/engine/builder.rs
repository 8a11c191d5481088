use crate::engine::environment::Environment;
use crate::engine::error::KilnError;
use crate::engine::installer::InstallationState;
use crate::engine::progress::{Progress, ProgressGuard};
use crate::engine::EngineSettings;
use crate::utils::path_exists;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const MANIFEST: &str = "package.json";
pub const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PackageManager {
    Pnpm,
    /// The npm bundled with the runtime, used as the fallback.
    Npm,
}

impl Display for PackageManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageManager::Pnpm => write!(f, "pnpm"),
            PackageManager::Npm => write!(f, "npm"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildReport {
    /// `None` when the dependency directory already existed.
    pub dependencies: Option<PackageManager>,
    pub build: PackageManager,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct Builder {
    settings: Arc<EngineSettings>,
    progress: Arc<dyn Progress>,
}

impl Builder {
    pub fn new(settings: Arc<EngineSettings>, progress: Arc<dyn Progress>) -> Self {
        Builder { settings, progress }
    }

    pub async fn check_structure(&self) -> anyhow::Result<PathBuf> {
        let repo = self.settings.repo_path();

        if !path_exists(&repo).await? {
            return Err(KilnError::ProjectStructure {
                path: repo,
                message: "project directory does not exist".to_string(),
            }
            .into());
        }

        if !path_exists(repo.join(MANIFEST)).await? {
            return Err(KilnError::ProjectStructure {
                message: format!("no {} found", MANIFEST),
                path: repo,
            }
            .into());
        }

        Ok(repo)
    }

    /// Installs dependencies when absent, then runs the build script.
    ///
    /// Each command gets one fallback attempt through npm.
    pub async fn build(
        &self,
        env: &Environment,
        node: &InstallationState,
        pnpm: &InstallationState,
    ) -> anyhow::Result<BuildReport> {
        for (tool, state) in [("node", node), ("pnpm", pnpm)] {
            if !state.installed {
                return Err(KilnError::MissingDependency {
                    tool: "build".to_string(),
                    dependency: tool.to_string(),
                    message: format!("{} is not installed", tool),
                }
                .into());
            }
        }

        let repo = self.check_structure().await?;
        let started = Instant::now();
        let npm = node.bin_dir.join("npm");

        let dependencies = if path_exists(repo.join(DEPENDENCY_DIR)).await? {
            info!("dependencies already installed, skipping");
            None
        } else {
            let _progress = ProgressGuard::start(&*self.progress, "Installing dependencies");
            Some(
                self.with_fallback(env, &repo, &pnpm.binary, &npm, &["install"])
                    .await?,
            )
        };

        let script = self.settings.project().build_script.as_str();
        let build = {
            let _progress =
                ProgressGuard::start(&*self.progress, &format!("Running {}", script));
            self.with_fallback(env, &repo, &pnpm.binary, &npm, &["run", script])
                .await?
        };

        let duration = started.elapsed();
        info!(seconds = duration.as_secs_f64(), %build, "build finished");

        Ok(BuildReport {
            dependencies,
            build,
            duration,
        })
    }

    async fn with_fallback(
        &self,
        env: &Environment,
        repo: &Path,
        pnpm: &Path,
        npm: &Path,
        args: &[&str],
    ) -> anyhow::Result<PackageManager> {
        let first = match env.run(pnpm, args, repo).await {
            Ok(()) => return Ok(PackageManager::Pnpm),
            Err(e) => e,
        };

        warn!(error = %first, "pnpm failed, retrying with npm");

        match env.run(npm, args, repo).await {
            Ok(()) => Ok(PackageManager::Npm),
            Err(second) => Err(KilnError::build(format!(
                "`{}` failed with pnpm ({:#}) and npm ({:#})",
                args.join(" "),
                first,
                second
            ))
            .into()),
        }
    }
}
