use crate::engine::environment::Environment;
use crate::engine::error::KilnError;
use crate::engine::extractor::Extractor;
use crate::engine::fetcher::Fetcher;
use crate::engine::progress::{Progress, ProgressGuard};
use crate::engine::resolver::{ToolSource, ToolchainSpec, PLATFORM};
use crate::engine::EngineSettings;
use crate::utils::{path_exists, remove_path};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of asking an installed binary for its version.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Probe {
    Absent,
    Valid(String),
    /// The binary exists but the version query failed.
    Invalid(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstallationState {
    pub installed: bool,
    pub version: Option<String>,
    pub bin_dir: PathBuf,
    pub binary: PathBuf,
}

pub async fn probe(env: &Environment, binary: &Path) -> Probe {
    match path_exists(binary).await {
        Ok(true) => {}
        Ok(false) => return Probe::Absent,
        Err(e) => return Probe::Invalid(e.to_string()),
    }

    let cwd = binary.parent().unwrap_or_else(|| Path::new("/"));
    match env.capture(binary, &["--version"], cwd).await {
        Ok(version) if !version.is_empty() => Probe::Valid(version),
        Ok(_) => Probe::Invalid("empty version output".to_string()),
        Err(e) => Probe::Invalid(e.to_string()),
    }
}

/// `node-v20.18.0-linux-x64` sorts as `[20, 18, 0]`; unparsable parts count as zero.
fn runtime_version(dir: &Path) -> Vec<u64> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let version = name
        .trim_start_matches("node-")
        .trim_end_matches(&format!("-{}", PLATFORM))
        .trim_start_matches('v')
        .to_string();

    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Extracted runtime directories under `local_root`, oldest version first.
pub async fn installed_runtimes(local_root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let suffix = format!("-{}", PLATFORM);
    let mut found = vec![];

    let mut rd = match tokio::fs::read_dir(local_root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };

    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("node-")
            && name.ends_with(&suffix)
            && entry.file_type().await?.is_dir()
        {
            found.push(entry.path());
        }
    }

    found.sort_by_cached_key(|dir| (runtime_version(dir), dir.clone()));
    Ok(found)
}

#[derive(Debug)]
pub struct Installer {
    settings: Arc<EngineSettings>,
    fetcher: Fetcher,
    extractor: Extractor,
    progress: Arc<dyn Progress>,
}

impl Installer {
    pub fn new(settings: Arc<EngineSettings>, progress: Arc<dyn Progress>) -> Self {
        Installer {
            settings,
            fetcher: Fetcher::new(),
            extractor: Extractor::new(),
            progress,
        }
    }

    fn installed(
        &self,
        env: &mut Environment,
        spec: &ToolchainSpec,
        version: String,
    ) -> InstallationState {
        let bin_dir = spec.bin_dir();
        env.prepend_path(&bin_dir);

        InstallationState {
            installed: true,
            version: Some(version),
            bin_dir,
            binary: spec.binary.clone(),
        }
    }

    /// Ensures the runtime described by `spec` answers a version query.
    ///
    /// A runtime that already does is left untouched.
    pub async fn ensure_node(
        &self,
        env: &mut Environment,
        spec: &ToolchainSpec,
    ) -> anyhow::Result<InstallationState> {
        let (url, file_name, verification) = match &spec.source {
            ToolSource::Archive {
                url,
                file_name,
                verification,
            } => (url, file_name, verification),
            ToolSource::Npm { .. } => {
                return Err(KilnError::installation(
                    &spec.name,
                    "the runtime can only be installed from an archive",
                )
                .into())
            }
        };

        match probe(env, &spec.binary).await {
            Probe::Valid(version) => {
                info!(%version, path = %spec.binary.display(), "Node.js already installed");
                return Ok(self.installed(env, spec, version));
            }
            Probe::Invalid(reason) => {
                warn!(%reason, dir = %spec.install_dir.display(), "Node.js installation is broken, reinstalling");
                remove_path(&spec.install_dir).await?;
            }
            Probe::Absent => {}
        }

        let local_root = self.settings.local_root();
        tokio::fs::create_dir_all(&local_root).await?;
        let archive = local_root.join(file_name);

        {
            let _progress = ProgressGuard::start(
                &*self.progress,
                &format!("Downloading Node.js {}", spec.version),
            );
            self.fetcher
                .fetch(url, &archive, verification)
                .await
                .with_context(|| format!("fetching Node.js {}", spec.version))?;
        }

        let extracted = {
            let _progress = ProgressGuard::start(
                &*self.progress,
                &format!("Extracting Node.js {}", spec.version),
            );
            self.extractor.extract(&archive, &local_root).await
        };

        if let Err(e) = extracted {
            remove_path(&archive).await?;
            remove_path(&spec.install_dir).await?;

            return Err(KilnError::Integrity {
                path: archive,
                message: format!("extraction failed: {:#}", e),
            }
            .into());
        }

        match probe(env, &spec.binary).await {
            Probe::Valid(version) => {
                info!(%version, "Node.js installed");
                Ok(self.installed(env, spec, version))
            }
            Probe::Absent => Err(KilnError::installation(
                &spec.name,
                format!("{} missing after extraction", spec.binary.display()),
            )
            .into()),
            Probe::Invalid(reason) => Err(KilnError::installation(
                &spec.name,
                format!("{} does not run: {}", spec.binary.display(), reason),
            )
            .into()),
        }
    }

    /// Ensures pnpm is installed into the private prefix using the runtime's npm.
    pub async fn ensure_pnpm(
        &self,
        env: &mut Environment,
        node: &InstallationState,
        spec: &ToolchainSpec,
    ) -> anyhow::Result<InstallationState> {
        let package = match &spec.source {
            ToolSource::Npm { package } => package,
            ToolSource::Archive { .. } => {
                return Err(KilnError::installation(
                    &spec.name,
                    "the package manager can only be installed through npm",
                )
                .into())
            }
        };

        let npm = node.bin_dir.join("npm");
        if !node.installed || !path_exists(&npm).await? {
            return Err(KilnError::MissingDependency {
                tool: spec.name.clone(),
                dependency: "node".to_string(),
                message: format!("{} is not available", npm.display()),
            }
            .into());
        }

        match probe(env, &spec.binary).await {
            Probe::Valid(version) => {
                info!(%version, path = %spec.binary.display(), "pnpm already installed");
                return Ok(self.installed(env, spec, version));
            }
            Probe::Invalid(reason) => {
                warn!(%reason, path = %spec.binary.display(), "pnpm installation is broken, reinstalling");
                remove_path(&spec.binary).await?;
            }
            Probe::Absent => {}
        }

        let local_root = self.settings.local_root();
        tokio::fs::create_dir_all(&local_root).await?;
        let prefix = local_root.to_string_lossy().into_owned();

        {
            let _progress =
                ProgressGuard::start(&*self.progress, &format!("Installing {}", package));
            env.run(
                &npm,
                &["install", "-g", package.as_str(), "--prefix", prefix.as_str()],
                &self.settings.repo_path(),
            )
            .await
            .map_err(|e| KilnError::installation(&spec.name, format!("{:#}", e)))?;
        }

        match probe(env, &spec.binary).await {
            Probe::Valid(version) => {
                info!(%version, "pnpm installed");
                Ok(self.installed(env, spec, version))
            }
            Probe::Absent => Err(KilnError::installation(
                &spec.name,
                format!("{} missing after npm install", spec.binary.display()),
            )
            .into()),
            Probe::Invalid(reason) => Err(KilnError::installation(
                &spec.name,
                format!("{} does not run: {}", spec.binary.display(), reason),
            )
            .into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::definition::{Project, Verification};
    use crate::engine::error::classify;
    use crate::engine::extractor::tests::write_tar_xz;
    use crate::engine::progress::tests::Recording;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    pub const FAKE_NODE: &[u8] = b"#!/bin/sh\necho v20.18.0\n";

    /// A fake npm that installs a fake pnpm under `--prefix`.
    pub const FAKE_NPM: &[u8] = br#"#!/bin/sh
while [ $# -gt 0 ]; do
    if [ "$1" = "--prefix" ]; then prefix="$2"; fi
    shift
done
mkdir -p "$prefix/bin"
printf '#!/bin/sh\necho 9.12.0\n' > "$prefix/bin/pnpm"
chmod +x "$prefix/bin/pnpm"
"#;

    pub fn write_script(path: &Path, body: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn test_settings(workdir: &Path, mirror: &str) -> Arc<EngineSettings> {
        let mut project = Project::new("web", "https://example.com/web.git");
        project.directory = "web".to_string();
        project.archive = "web_complete.zip".to_string();
        project.node.mirror = mirror.to_string();
        Arc::new(EngineSettings::new(workdir, project))
    }

    pub async fn node_tarball(path: &Path) {
        write_tar_xz(
            path,
            &[
                ("node-v20.18.0-linux-x64/bin/node", 0o755, FAKE_NODE),
                ("node-v20.18.0-linux-x64/bin/npm", 0o755, FAKE_NPM),
                ("node-v20.18.0-linux-x64/README.md", 0o644, b"node"),
            ],
        )
        .await;
    }

    fn mtime(path: &Path) -> std::time::SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn installs_node_once() {
        let tmp = TempDir::new().unwrap();
        let tarball = tmp.path().join("fixture.tar.xz");
        node_tarball(&tarball).await;

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v20.18.0/node-v20.18.0-linux-x64.tar.xz")
            .with_body(std::fs::read(&tarball).unwrap())
            .expect(1)
            .create_async()
            .await;

        let workdir = tmp.path().join("work");
        let settings = test_settings(&workdir, &server.url());
        let spec = ToolchainSpec::node(&settings, "v20.18.0", Verification::default());
        let recording = Arc::new(Recording::default());
        let installer = Installer::new(settings.clone(), recording.clone());
        let mut env = Environment::from_process();

        let state = installer.ensure_node(&mut env, &spec).await.unwrap();
        assert!(state.installed);
        assert_eq!(state.version.as_deref(), Some("v20.18.0"));
        assert_eq!(state.bin_dir, spec.install_dir.join("bin"));
        assert_eq!(env.search_path().dirs(), &[spec.install_dir.join("bin")]);

        let archive = settings.local_root().join("node-v20.18.0-linux-x64.tar.xz");
        let before = (mtime(&archive), mtime(&spec.install_dir), mtime(&spec.binary));
        let events = recording.events.lock().unwrap().len();

        let again = installer.ensure_node(&mut env, &spec).await.unwrap();
        assert_eq!(again, state);
        assert_eq!(
            (mtime(&archive), mtime(&spec.install_dir), mtime(&spec.binary)),
            before
        );
        assert_eq!(recording.events.lock().unwrap().len(), events);
        assert_eq!(env.search_path().dirs().len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    #[serial]
    async fn broken_node_is_removed_before_reinstall() {
        let tmp = TempDir::new().unwrap();
        let tarball = tmp.path().join("fixture.tar.xz");
        node_tarball(&tarball).await;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v20.18.0/node-v20.18.0-linux-x64.tar.xz")
            .with_body(std::fs::read(&tarball).unwrap())
            .create_async()
            .await;

        let settings = test_settings(&tmp.path().join("work"), &server.url());
        let spec = ToolchainSpec::node(&settings, "v20.18.0", Verification::default());
        write_script(&spec.binary, b"#!/bin/sh\nexit 1\n");
        std::fs::write(spec.install_dir.join("stale"), "x").unwrap();

        let mut env = Environment::from_process();
        assert!(matches!(probe(&env, &spec.binary).await, Probe::Invalid(_)));

        let installer = Installer::new(settings, Arc::new(crate::engine::progress::Silent));
        let state = installer.ensure_node(&mut env, &spec).await.unwrap();

        assert!(state.installed);
        assert!(!spec.install_dir.join("stale").exists());
        assert_eq!(probe(&env, &spec.binary).await, Probe::Valid("v20.18.0".into()));
    }

    #[tokio::test]
    #[serial]
    async fn repeated_network_failures_leave_no_install_dir() {
        let tmp = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v20.18.0/node-v20.18.0-linux-x64.tar.xz")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let settings = test_settings(&tmp.path().join("work"), &server.url());
        let spec = ToolchainSpec::node(&settings, "v20.18.0", Verification::default());
        let installer = Installer::new(settings.clone(), Arc::new(crate::engine::progress::Silent));
        let mut env = Environment::from_process();

        for _ in 0..2 {
            let err = installer.ensure_node(&mut env, &spec).await.unwrap_err();
            assert!(matches!(classify(&err), Some(KilnError::Network { .. })));
        }

        assert!(!spec.install_dir.exists());
        assert!(!settings
            .local_root()
            .join("node-v20.18.0-linux-x64.tar.xz")
            .exists());
        assert!(env.search_path().dirs().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn corrupt_archive_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v20.18.0/node-v20.18.0-linux-x64.tar.xz")
            .with_body("not an archive")
            .create_async()
            .await;

        let settings = test_settings(&tmp.path().join("work"), &server.url());
        let spec = ToolchainSpec::node(&settings, "v20.18.0", Verification::default());
        let installer = Installer::new(settings.clone(), Arc::new(crate::engine::progress::Silent));

        let err = installer
            .ensure_node(&mut Environment::from_process(), &spec)
            .await
            .unwrap_err();

        assert!(matches!(classify(&err), Some(KilnError::Integrity { .. })));
        assert!(!settings
            .local_root()
            .join("node-v20.18.0-linux-x64.tar.xz")
            .exists());
    }

    #[tokio::test]
    async fn lists_extracted_runtimes_only() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("node-v20.18.0-linux-x64")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node-v18.20.4-linux-x64")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node-v8.17.0-linux-x64")).unwrap();
        std::fs::create_dir_all(tmp.path().join("bin")).unwrap();
        std::fs::write(tmp.path().join("node-v22.0.0-linux-x64.tar.xz"), "x").unwrap();

        assert_eq!(
            installed_runtimes(tmp.path()).await.unwrap(),
            vec![
                tmp.path().join("node-v8.17.0-linux-x64"),
                tmp.path().join("node-v18.20.4-linux-x64"),
                tmp.path().join("node-v20.18.0-linux-x64"),
            ]
        );
        assert!(installed_runtimes(&tmp.path().join("absent"))
            .await
            .unwrap()
            .is_empty());
    }

    fn installed_node(dir: &Path) -> InstallationState {
        InstallationState {
            installed: true,
            version: Some("v20.18.0".to_string()),
            bin_dir: dir.join("bin"),
            binary: dir.join("bin/node"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn installs_pnpm_through_npm() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let node_dir = tmp.path().join("node");
        write_script(&node_dir.join("bin/node"), FAKE_NODE);
        write_script(&node_dir.join("bin/npm"), FAKE_NPM);

        let spec = ToolchainSpec::pnpm(&settings);
        let installer = Installer::new(settings.clone(), Arc::new(crate::engine::progress::Silent));
        let mut env = Environment::from_process();

        let state = installer
            .ensure_pnpm(&mut env, &installed_node(&node_dir), &spec)
            .await
            .unwrap();

        assert!(state.installed);
        assert_eq!(state.version.as_deref(), Some("9.12.0"));
        assert_eq!(state.binary, settings.bin_path().join("pnpm"));
        assert!(env.search_path().contains(&settings.bin_path()));

        let before = mtime(&state.binary);
        let again = installer
            .ensure_pnpm(&mut env, &installed_node(&node_dir), &spec)
            .await
            .unwrap();
        assert_eq!(again, state);
        assert_eq!(mtime(&state.binary), before);
    }

    #[tokio::test]
    #[serial]
    async fn broken_pnpm_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let node_dir = tmp.path().join("node");
        write_script(&node_dir.join("bin/node"), FAKE_NODE);
        write_script(&node_dir.join("bin/npm"), FAKE_NPM);

        let spec = ToolchainSpec::pnpm(&settings);
        write_script(&spec.binary, b"#!/bin/sh\nexit 1\n");

        let mut env = Environment::from_process();
        assert!(matches!(probe(&env, &spec.binary).await, Probe::Invalid(_)));

        let installer = Installer::new(settings, Arc::new(crate::engine::progress::Silent));
        let state = installer
            .ensure_pnpm(&mut env, &installed_node(&node_dir), &spec)
            .await
            .unwrap();

        assert!(state.installed);
        assert_eq!(state.version.as_deref(), Some("9.12.0"));
        assert_ne!(std::fs::read(&spec.binary).unwrap(), b"#!/bin/sh\nexit 1\n");
        assert_eq!(probe(&env, &spec.binary).await, Probe::Valid("9.12.0".into()));
    }

    #[tokio::test]
    #[serial]
    async fn pnpm_requires_npm() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let spec = ToolchainSpec::pnpm(&settings);
        let installer = Installer::new(settings, Arc::new(crate::engine::progress::Silent));

        let err = installer
            .ensure_pnpm(
                &mut Environment::from_process(),
                &installed_node(&tmp.path().join("nowhere")),
                &spec,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            classify(&err),
            Some(KilnError::MissingDependency { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn missing_binary_after_install_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let node_dir = tmp.path().join("node");
        write_script(&node_dir.join("bin/npm"), b"#!/bin/sh\nexit 0\n");

        let spec = ToolchainSpec::pnpm(&settings);
        let installer = Installer::new(settings, Arc::new(crate::engine::progress::Silent));

        let err = installer
            .ensure_pnpm(
                &mut Environment::from_process(),
                &installed_node(&node_dir),
                &spec,
            )
            .await
            .unwrap_err();

        let kind = classify(&err).unwrap();
        assert!(matches!(kind, KilnError::Installation { .. }));
        assert!(!kind.is_recoverable());
    }
}
