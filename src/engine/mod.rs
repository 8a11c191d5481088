use crate::definition::Project;
use crate::engine::builder::{BuildReport, Builder};
use crate::engine::environment::Environment;
use crate::engine::error::KilnError;
use crate::engine::installer::{installed_runtimes, InstallationState, Installer};
use crate::engine::packager::{
    create_package, PackageManifest, PackageReport, Packager, PackagerBuilder,
};
use crate::engine::progress::Progress;
use crate::engine::repository::{CloneOutcome, Repository};
use crate::engine::resolver::{Resolver, ToolchainSpec};
use crate::engine::statistics::{RunStatistics, StepOutcome};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{error, info, info_span, Instrument};

pub mod builder;
pub mod environment;
pub mod error;
mod extractor;
mod fetcher;
pub mod installer;
pub mod maintenance;
pub mod packager;
pub mod progress;
pub mod repository;
pub mod resolver;
pub mod statistics;

pub const LOG_FILE: &str = "build_script.log";

#[derive(Debug)]
pub struct EngineSettings {
    workdir: PathBuf,
    project: Project,
}

impl EngineSettings {
    pub fn new(workdir: &Path, project: Project) -> Self {
        EngineSettings {
            workdir: workdir.to_path_buf(),
            project,
        }
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.as_path()
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn repo_path(&self) -> PathBuf {
        self.workdir.join(&self.project.directory)
    }

    /// Private install root for the runtime and package manager.
    pub fn local_root(&self) -> PathBuf {
        self.repo_path().join(".local")
    }

    pub fn bin_path(&self) -> PathBuf {
        self.local_root().join("bin")
    }

    pub fn staging_path(&self) -> PathBuf {
        self.repo_path().join(&self.project.staging_dir)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.repo_path().join(&self.project.archive)
    }

    pub fn log_path(&self) -> PathBuf {
        self.workdir.join(LOG_FILE)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Step {
    Clone,
    Resolve,
    Node,
    Pnpm,
    Build,
    Package,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Clone => "clone",
            Step::Resolve => "resolve",
            Step::Node => "node",
            Step::Pnpm => "pnpm",
            Step::Build => "build",
            Step::Package => "package",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Workflow {
    steps: Vec<Step>,
    replace_repository: bool,
}

impl Workflow {
    pub fn new(steps: Vec<Step>) -> Self {
        Workflow {
            steps,
            replace_repository: false,
        }
    }

    pub fn complete() -> Self {
        Self::new(vec![
            Step::Clone,
            Step::Resolve,
            Step::Node,
            Step::Pnpm,
            Step::Build,
            Step::Package,
        ])
    }

    /// Build and package an existing checkout.
    pub fn quick() -> Self {
        Self::new(vec![
            Step::Resolve,
            Step::Node,
            Step::Pnpm,
            Step::Build,
            Step::Package,
        ])
    }

    /// The toolchain steps `step` depends on, followed by `step` itself.
    pub fn through(step: Step) -> Self {
        let steps = match step {
            Step::Clone => vec![Step::Clone],
            Step::Resolve => vec![Step::Resolve],
            Step::Node => vec![Step::Resolve, Step::Node],
            Step::Pnpm => vec![Step::Resolve, Step::Node, Step::Pnpm],
            Step::Build => vec![Step::Resolve, Step::Node, Step::Pnpm, Step::Build],
            Step::Package => vec![Step::Package],
        };

        Self::new(steps)
    }

    pub fn replace_repository(mut self, replace: bool) -> Self {
        self.replace_repository = replace;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Mutable state of one interactive or scripted run.
#[derive(Debug)]
pub struct Session {
    pub environment: Environment,
    pub node_spec: Option<ToolchainSpec>,
    pub node: Option<InstallationState>,
    pub pnpm: Option<InstallationState>,
    pub stats: RunStatistics,
}

impl Session {
    pub fn new(environment: Environment) -> Self {
        Session {
            environment,
            node_spec: None,
            node: None,
            pnpm: None,
            stats: RunStatistics::default(),
        }
    }
}

#[derive(Debug)]
pub struct Engine {
    resolver: Resolver,
    installer: Installer,
    builder: Builder,
    repository: Repository,
    packager: Box<dyn Packager>,
    pub settings: Arc<EngineSettings>,
}

impl Engine {
    pub fn new<T: PackagerBuilder>(settings: EngineSettings, progress: Arc<dyn Progress>) -> Self {
        let settings = Arc::new(settings);
        Engine {
            resolver: Resolver::new(settings.clone()),
            installer: Installer::new(settings.clone(), progress.clone()),
            builder: Builder::new(settings.clone(), progress.clone()),
            repository: Repository::new(settings.clone(), progress),
            packager: Box::new(T::build(settings.clone())),
            settings,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Runs every step in order, stopping at the first failure.
    pub async fn run_workflow(
        &self,
        session: &mut Session,
        workflow: &Workflow,
    ) -> anyhow::Result<()> {
        let started = Instant::now();

        for step in workflow.steps().iter().copied() {
            self.run_step(session, step, workflow.replace_repository)
                .await?;
        }

        info!(
            steps = workflow.steps().len(),
            seconds = started.elapsed().as_secs_f64(),
            "workflow finished"
        );

        Ok(())
    }

    pub async fn run_step(
        &self,
        session: &mut Session,
        step: Step,
        replace_repository: bool,
    ) -> anyhow::Result<()> {
        let span = info_span!("step", name = step.name());
        let started = Instant::now();

        let result = self
            .execute(session, step, replace_repository)
            .instrument(span.clone())
            .await;

        match &result {
            Ok(()) => {
                let elapsed = started.elapsed();
                span.in_scope(|| info!(seconds = elapsed.as_secs_f64(), "step succeeded"));
                session.stats.record(step, StepOutcome::Succeeded(elapsed));
            }
            Err(e) => {
                span.in_scope(|| error!(error = %format!("{:#}", e), "step failed"));
                session
                    .stats
                    .record(step, StepOutcome::Failed(format!("{:#}", e)));
            }
        }

        result
    }

    async fn execute(
        &self,
        session: &mut Session,
        step: Step,
        replace_repository: bool,
    ) -> anyhow::Result<()> {
        match step {
            Step::Clone => {
                self.clone_repository(session, replace_repository).await?;
            }
            Step::Resolve => {
                self.resolve(session).await?;
            }
            Step::Node => {
                self.ensure_node(session).await?;
            }
            Step::Pnpm => {
                self.ensure_pnpm(session).await?;
            }
            Step::Build => {
                self.build(session).await?;
            }
            Step::Package => {
                self.package(session).await?;
            }
        }

        Ok(())
    }

    pub async fn clone_repository(
        &self,
        session: &mut Session,
        replace: bool,
    ) -> anyhow::Result<CloneOutcome> {
        let outcome = self
            .repository
            .clone_project(&session.environment, replace)
            .await?;
        session.stats.cloned = true;

        Ok(outcome)
    }

    /// Validates an existing checkout without touching it.
    pub async fn check_repository(&self, session: &mut Session) -> anyhow::Result<PathBuf> {
        let repo = self.builder.check_structure().await?;
        session.stats.cloned = true;

        Ok(repo)
    }

    pub async fn resolve(&self, session: &mut Session) -> anyhow::Result<ToolchainSpec> {
        let spec = self.resolver.resolve().await?;
        session.node_spec = Some(spec.clone());

        Ok(spec)
    }

    pub async fn ensure_node(&self, session: &mut Session) -> anyhow::Result<InstallationState> {
        let spec = match &session.node_spec {
            Some(spec) => spec.clone(),
            None => self.resolve(session).await?,
        };

        let state = self
            .installer
            .ensure_node(&mut session.environment, &spec)
            .await?;
        session.stats.node_version = state.version.clone();
        session.node = Some(state.clone());

        Ok(state)
    }

    pub async fn ensure_pnpm(&self, session: &mut Session) -> anyhow::Result<InstallationState> {
        let node = match &session.node {
            Some(node) if node.installed => node.clone(),
            _ => {
                return Err(KilnError::MissingDependency {
                    tool: "pnpm".to_string(),
                    dependency: "node".to_string(),
                    message: "install Node.js first".to_string(),
                }
                .into())
            }
        };

        let spec = ToolchainSpec::pnpm(&self.settings);
        let state = self
            .installer
            .ensure_pnpm(&mut session.environment, &node, &spec)
            .await?;
        session.stats.pnpm_version = state.version.clone();
        session.pnpm = Some(state.clone());

        Ok(state)
    }

    pub async fn build(&self, session: &mut Session) -> anyhow::Result<BuildReport> {
        let (node, pnpm) = match (&session.node, &session.pnpm) {
            (Some(node), Some(pnpm)) => (node.clone(), pnpm.clone()),
            (node, _) => {
                let dependency = if node.is_none() { "node" } else { "pnpm" };
                return Err(KilnError::MissingDependency {
                    tool: "build".to_string(),
                    dependency: dependency.to_string(),
                    message: format!("install {} first", dependency),
                }
                .into());
            }
        };

        let report = self
            .builder
            .build(&session.environment, &node, &pnpm)
            .await?;
        session.stats.build_duration = Some(report.duration);
        session.stats.last_build = Some(SystemTime::now());

        Ok(report)
    }

    /// The runtime installed this session, or the newest one found on disk.
    pub async fn runtime_dir(&self, session: &Session) -> anyhow::Result<Option<PathBuf>> {
        if let Some(spec) = &session.node_spec {
            if session.node.as_ref().map(|n| n.installed).unwrap_or(false) {
                return Ok(Some(spec.install_dir.clone()));
            }
        }

        Ok(installed_runtimes(&self.settings.local_root())
            .await?
            .pop())
    }

    pub async fn package(&self, session: &mut Session) -> anyhow::Result<PackageReport> {
        let runtime = match self.runtime_dir(session).await? {
            Some(dir) => dir,
            None => {
                return Err(KilnError::packaging(
                    "no Node.js runtime installed, nothing to package",
                )
                .into())
            }
        };

        let manifest = PackageManifest::for_project(&self.settings, &runtime);
        let report = create_package(&*self.packager, &manifest).await?;
        session.stats.package_size_mb = Some(report.size_mb());

        Ok(report)
    }
}
