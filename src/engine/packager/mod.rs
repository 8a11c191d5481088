use crate::engine::error::KilnError;
use crate::engine::EngineSettings;
use crate::utils::{copy_tree, file_size, path_exists, remove_path};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

mod zip;

pub use self::zip::Zip;

/// Name of the runtime directory inside the staging directory.
pub const RUNTIME_DIR: &str = "node";

#[async_trait]
pub trait Packager: Send + Sync + Debug {
    /// Compresses the already staged `manifest.staging` into `manifest.archive`.
    async fn build_package(&self, manifest: &PackageManifest) -> anyhow::Result<()>;
}

pub trait PackagerBuilder {
    type Output: Packager + 'static;

    fn build(settings: Arc<EngineSettings>) -> Self::Output;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CopyOperation {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// A missing required source aborts packaging, others are skipped.
    pub required: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PackageManifest {
    pub staging: PathBuf,
    pub copies: Vec<CopyOperation>,
    pub archive: PathBuf,
}

impl PackageManifest {
    pub fn for_project(settings: &EngineSettings, runtime_dir: &Path) -> Self {
        let project = settings.project();
        let repo = settings.repo_path();
        let staging = settings.staging_path();

        let mut copies = vec![
            CopyOperation {
                source: runtime_dir.to_path_buf(),
                destination: staging.join(RUNTIME_DIR),
                required: true,
            },
            CopyOperation {
                source: repo.join(&project.output_dir),
                destination: staging.join(&project.output_dir),
                required: false,
            },
        ];

        copies.extend(project.essential_files.iter().map(|file| CopyOperation {
            source: repo.join(file),
            destination: staging.join(file),
            required: false,
        }));

        PackageManifest {
            staging,
            copies,
            archive: settings.archive_path(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PackageReport {
    pub archive: PathBuf,
    pub files: usize,
    pub size: u64,
}

impl PackageReport {
    pub fn size_mb(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0)
    }
}

/// Rebuilds the staging directory from scratch and copies everything in.
pub async fn stage(manifest: &PackageManifest) -> anyhow::Result<usize> {
    for copy in manifest.copies.iter().filter(|c| c.required) {
        if !path_exists(&copy.source).await? {
            return Err(KilnError::packaging(format!(
                "{} not found, nothing to package",
                copy.source.display()
            ))
            .into());
        }
    }

    remove_path(&manifest.staging).await?;
    tokio::fs::create_dir_all(&manifest.staging).await?;

    let mut files = 0;
    for copy in &manifest.copies {
        let md = match tokio::fs::metadata(&copy.source).await {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %copy.source.display(), "not present, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if md.is_dir() {
            files += copy_tree(&copy.source, &copy.destination).await?;
        } else {
            if let Some(parent) = copy.destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&copy.source, &copy.destination).await?;
            files += 1;
        }
    }

    Ok(files)
}

pub async fn create_package(
    packager: &dyn Packager,
    manifest: &PackageManifest,
) -> anyhow::Result<PackageReport> {
    let files = stage(manifest).await?;
    info!(files, staging = %manifest.staging.display(), "staging complete");

    remove_path(&manifest.archive).await?;
    packager.build_package(manifest).await?;

    if !path_exists(&manifest.archive).await? {
        return Err(KilnError::packaging(format!(
            "{} was not created",
            manifest.archive.display()
        ))
        .into());
    }

    let report = PackageReport {
        archive: manifest.archive.clone(),
        files,
        size: file_size(&manifest.archive).await?,
    };
    info!(archive = %report.archive.display(), size_mb = report.size_mb(), "package created");

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::classify;
    use crate::engine::installer::tests::test_settings;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct Forgetful;

    #[async_trait]
    impl Packager for Forgetful {
        async fn build_package(&self, _manifest: &PackageManifest) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn project(tmp: &TempDir) -> (Arc<EngineSettings>, PathBuf) {
        let settings = test_settings(&tmp.path().join("work"), "http://unused");
        let repo = settings.repo_path();
        let runtime = settings.local_root().join("node-v20.18.0-linux-x64");

        std::fs::create_dir_all(runtime.join("bin")).unwrap();
        std::fs::write(runtime.join("bin/node"), "node").unwrap();
        std::fs::create_dir_all(repo.join("dist/assets")).unwrap();
        std::fs::write(repo.join("dist/index.js"), "main").unwrap();
        std::fs::write(repo.join("dist/assets/app.css"), "css").unwrap();
        std::fs::write(repo.join("package.json"), "{}").unwrap();

        (settings, runtime)
    }

    #[test]
    fn manifest_lists_runtime_output_and_essential_files() {
        let settings = test_settings(Path::new("/work"), "http://unused");
        let manifest = PackageManifest::for_project(&settings, Path::new("/rt"));

        assert_eq!(manifest.staging, Path::new("/work/web/compiled"));
        assert_eq!(manifest.archive, Path::new("/work/web/web_complete.zip"));
        assert_eq!(
            manifest
                .copies
                .iter()
                .map(|c| (c.destination.clone(), c.required))
                .collect::<Vec<_>>(),
            vec![
                (PathBuf::from("/work/web/compiled/node"), true),
                (PathBuf::from("/work/web/compiled/dist"), false),
                (PathBuf::from("/work/web/compiled/package.json"), false),
                (PathBuf::from("/work/web/compiled/package-lock.json"), false),
            ]
        );
    }

    #[tokio::test]
    async fn staging_is_rebuilt_from_empty() {
        let tmp = TempDir::new().unwrap();
        let (settings, runtime) = project(&tmp);
        let manifest = PackageManifest::for_project(&settings, &runtime);

        std::fs::create_dir_all(&manifest.staging).unwrap();
        std::fs::write(manifest.staging.join("leftover"), "old").unwrap();

        let files = stage(&manifest).await.unwrap();

        assert_eq!(files, 4);
        assert!(!manifest.staging.join("leftover").exists());
        assert!(manifest.staging.join("node/bin/node").exists());
        assert!(manifest.staging.join("dist/assets/app.css").exists());
        assert!(manifest.staging.join("package.json").exists());
        assert!(!manifest.staging.join("package-lock.json").exists());
    }

    #[tokio::test]
    async fn missing_runtime_is_a_packaging_error() {
        let tmp = TempDir::new().unwrap();
        let (settings, _) = project(&tmp);
        let manifest = PackageManifest::for_project(&settings, &tmp.path().join("absent"));

        let err = create_package(&Zip::build(settings), &manifest)
            .await
            .unwrap_err();

        assert!(matches!(classify(&err), Some(KilnError::Packaging { .. })));
    }

    #[tokio::test]
    async fn archive_must_exist_afterwards() {
        let tmp = TempDir::new().unwrap();
        let (settings, runtime) = project(&tmp);
        let manifest = PackageManifest::for_project(&settings, &runtime);
        std::fs::write(&manifest.archive, "stale archive").unwrap();

        let err = create_package(&Forgetful, &manifest).await.unwrap_err();

        assert!(matches!(classify(&err), Some(KilnError::Packaging { .. })));
        assert!(!manifest.archive.exists());
    }
}
