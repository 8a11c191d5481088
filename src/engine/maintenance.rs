use crate::engine::builder::{DEPENDENCY_DIR, MANIFEST};
use crate::engine::installer::{installed_runtimes, probe, InstallationState, Probe};
use crate::engine::{Engine, Session};
use crate::utils::{dir_is_non_empty, path_exists, remove_path};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

pub const TEMP_PATTERNS: &[&str] = &["node-*.tar.xz", "*.tmp", "*.log.old"];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Component {
    Repository,
    Node,
    Pnpm,
    Project,
    Dependencies,
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Repository => "repository",
            Component::Node => "node",
            Component::Pnpm => "pnpm",
            Component::Project => "project",
            Component::Dependencies => "dependencies",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            Component::Repository => "Run 'Clone repository' from the setup menu",
            Component::Node => "Run 'Install/verify Node.js' from the setup menu",
            Component::Pnpm => "Run 'Install/verify pnpm' from the setup menu",
            Component::Project => "Check that the repository was cloned correctly",
            Component::Dependencies => "Build the project to install its dependencies",
        }
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Health {
    Healthy(String),
    Missing(String),
    Error(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Health::Healthy(d) | Health::Missing(d) | Health::Error(d) => d,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    Healthy,
    Partial,
    Degraded,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HealthReport {
    pub components: Vec<(Component, Health)>,
}

impl HealthReport {
    pub fn healthy_count(&self) -> usize {
        self.components.iter().filter(|(_, h)| h.is_healthy()).count()
    }

    pub fn verdict(&self) -> Verdict {
        let healthy = self.healthy_count();
        let total = self.components.len();

        if healthy == total {
            Verdict::Healthy
        } else if healthy > total / 2 {
            Verdict::Partial
        } else {
            Verdict::Degraded
        }
    }

    pub fn recommendations(&self) -> Vec<&'static str> {
        self.components
            .iter()
            .filter(|(_, h)| !h.is_healthy())
            .map(|(c, _)| c.recommendation())
            .collect()
    }

    #[cfg(test)]
    pub fn get(&self, component: Component) -> Option<&Health> {
        self.components
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, h)| h)
    }
}

fn from_probe(probe: Probe, what: &str) -> Health {
    match probe {
        Probe::Valid(version) => Health::Healthy(format!("version {}", version)),
        Probe::Absent => Health::Missing(format!("{} not found", what)),
        Probe::Invalid(reason) => Health::Error(reason),
    }
}

/// Deletes every file in `root` matching one of `patterns`.
pub async fn remove_matching(root: &Path, patterns: &[&str]) -> anyhow::Result<usize> {
    if !path_exists(root).await? {
        return Ok(0);
    }

    let mut removed = 0;
    for pattern in patterns {
        let glob = wax::Glob::from_str(pattern)?;
        let mut matches = vec![];

        for item in glob.walk(root) {
            let item = match item {
                Err(_) => continue,
                Ok(item) => item,
            };

            let candidate = item.to_candidate_path();
            let path = PathBuf::from(candidate.as_ref());
            if path.components().count() == 1 {
                matches.push(root.join(path));
            }
        }

        for path in matches {
            if tokio::fs::metadata(&path).await?.is_file() {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

impl Engine {
    pub async fn cleanup_temp_files(&self) -> anyhow::Result<usize> {
        let removed = remove_matching(&self.settings.local_root(), TEMP_PATTERNS).await?;
        info!(removed, "temporary files removed");

        Ok(removed)
    }

    pub async fn force_reinstall_node(
        &self,
        session: &mut Session,
    ) -> anyhow::Result<InstallationState> {
        let local_root = self.settings.local_root();

        let mut runtimes = installed_runtimes(&local_root).await?;
        if let Some(spec) = &session.node_spec {
            runtimes.push(spec.install_dir.clone());
        }

        for dir in runtimes {
            if remove_path(&dir).await? {
                info!(dir = %dir.display(), "removed Node.js installation");
            }
        }

        remove_matching(&local_root, &["node-*.tar.xz"]).await?;
        session.node = None;
        session.node_spec = None;

        self.ensure_node(session).await
    }

    pub async fn force_reinstall_pnpm(
        &self,
        session: &mut Session,
    ) -> anyhow::Result<InstallationState> {
        let binary = self.settings.bin_path().join("pnpm");
        if remove_path(&binary).await? {
            info!(path = %binary.display(), "removed pnpm");
        }
        session.pnpm = None;

        self.ensure_pnpm(session).await
    }

    /// Removes the checkout and forgets everything this session recorded about it.
    pub async fn reset_repository(&self, session: &mut Session) -> anyhow::Result<bool> {
        let removed = self.repository().reset().await?;

        session.stats.cloned = false;
        session.stats.build_duration = None;
        session.stats.last_build = None;
        session.stats.package_size_mb = None;

        Ok(removed)
    }

    /// Removes the checkout, including its private toolchain, and every produced archive.
    pub async fn reset_all(&self, session: &mut Session) -> anyhow::Result<usize> {
        let mut removed = usize::from(self.repository().reset().await?);

        let archives = format!("{}*.zip", self.settings.project().name);
        removed += remove_matching(self.settings.workdir(), &[archives.as_str()]).await?;

        session.node_spec = None;
        session.node = None;
        session.pnpm = None;
        session.stats.clear();
        warn!(removed, "everything was reset");

        Ok(removed)
    }

    pub async fn health_check(&self, session: &Session) -> HealthReport {
        let repo = self.settings.repo_path();
        let env = &session.environment;

        let repository = match path_exists(repo.join(MANIFEST)).await {
            Ok(true) => Health::Healthy(format!("{} present", repo.display())),
            Ok(false) => Health::Missing("repository not found".to_string()),
            Err(e) => Health::Error(e.to_string()),
        };

        let node = match self.runtime_dir(session).await {
            Ok(Some(dir)) => {
                from_probe(probe(env, &dir.join("bin").join("node")).await, "Node.js")
            }
            Ok(None) => Health::Missing("Node.js not found".to_string()),
            Err(e) => Health::Error(format!("{:#}", e)),
        };

        let pnpm = from_probe(
            probe(env, &self.settings.bin_path().join("pnpm")).await,
            "pnpm",
        );

        let project = match tokio::fs::read(repo.join(MANIFEST)).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(_) => Health::Healthy(format!("{} is valid", MANIFEST)),
                Err(e) => Health::Error(format!("{} is invalid: {}", MANIFEST, e)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Health::Missing(format!("{} not found", MANIFEST))
            }
            Err(e) => Health::Error(e.to_string()),
        };

        let dependencies = match dir_is_non_empty(repo.join(DEPENDENCY_DIR)).await {
            Ok(true) => Health::Healthy("dependencies installed".to_string()),
            Ok(false) => Health::Missing(format!("{} not found", DEPENDENCY_DIR)),
            Err(e) => Health::Error(e.to_string()),
        };

        HealthReport {
            components: vec![
                (Component::Repository, repository),
                (Component::Node, node),
                (Component::Pnpm, pnpm),
                (Component::Project, project),
                (Component::Dependencies, dependencies),
            ],
        }
    }
}
