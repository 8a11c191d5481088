use crate::definition::{NodeSettings, Verification};
use crate::engine::error::KilnError;
use crate::engine::EngineSettings;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const PLATFORM: &str = "linux-x64";
pub const ARCHIVE_EXTENSION: &str = "tar.xz";

const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

/// A resolved tool, ready to be installed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ToolchainSpec {
    pub name: String,
    pub version: String,
    pub source: ToolSource,
    pub install_dir: PathBuf,
    pub binary: PathBuf,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ToolSource {
    Archive {
        url: String,
        file_name: String,
        verification: Verification,
    },
    /// Installed through the runtime's bundled npm.
    Npm { package: String },
}

impl ToolchainSpec {
    pub fn bin_dir(&self) -> PathBuf {
        self.binary
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.install_dir.clone())
    }

    pub fn node(settings: &EngineSettings, version: &str, verification: Verification) -> Self {
        let node = &settings.project().node;
        let dir_name = format!("node-{}-{}", version, PLATFORM);
        let file_name = format!("{}.{}", dir_name, ARCHIVE_EXTENSION);
        let url = format!(
            "{}/{}/{}",
            node.mirror.trim_end_matches('/'),
            version,
            file_name
        );
        let install_dir = settings.local_root().join(&dir_name);

        ToolchainSpec {
            name: "node".to_string(),
            version: version.to_string(),
            source: ToolSource::Archive {
                url,
                file_name,
                verification,
            },
            binary: install_dir.join("bin").join("node"),
            install_dir,
        }
    }

    pub fn pnpm(settings: &EngineSettings) -> Self {
        let package = settings.project().pnpm.package.clone();

        ToolchainSpec {
            name: "pnpm".to_string(),
            version: package.clone(),
            source: ToolSource::Npm { package },
            install_dir: settings.local_root(),
            binary: settings.bin_path().join("pnpm"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    version: String,
    #[serde(default)]
    lts: serde_json::Value,
}

impl Release {
    fn is_lts(&self) -> bool {
        match &self.lts {
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Bool(b) => *b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    settings: Arc<EngineSettings>,
    http_client: Client,
}

impl Resolver {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        Resolver {
            settings,
            http_client: Client::new(),
        }
    }

    fn node_settings(&self) -> &NodeSettings {
        &self.settings.project().node
    }

    /// A configured hash pins the fallback version and never applies to another release.
    fn verification_for(&self, version: &str) -> Verification {
        let node = self.node_settings();
        if node.verification.sha256.is_some() && version != node.fallback.trim() {
            warn!(%version, pinned = %node.fallback, "configured sha256 does not apply to this version");
            return Verification::default();
        }

        node.verification.clone()
    }

    /// Picks the first LTS release in index order, or the configured fallback.
    pub async fn resolve(&self) -> anyhow::Result<ToolchainSpec> {
        match self.latest_lts().await {
            Ok(version) => {
                info!(%version, "latest LTS release found");
                Ok(ToolchainSpec::node(
                    &self.settings,
                    &version,
                    self.verification_for(&version),
                ))
            }
            Err(e) => {
                let fallback = self.node_settings().fallback.trim();
                if fallback.is_empty() {
                    return Err(e.context("no fallback Node.js version configured"));
                }

                warn!(error = %e, %fallback, "could not resolve latest LTS, using fallback");
                Ok(ToolchainSpec::node(
                    &self.settings,
                    fallback,
                    self.verification_for(fallback),
                ))
            }
        }
    }

    async fn latest_lts(&self) -> anyhow::Result<String> {
        let index = &self.node_settings().index;

        let releases: Vec<Release> = self
            .http_client
            .get(index)
            .timeout(INDEX_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| KilnError::network(format!("fetching {} failed: {}", index, e)))?
            .json()
            .await
            .map_err(|e| KilnError::network(format!("{} is not a release index: {}", index, e)))?;

        releases
            .into_iter()
            .find(Release::is_lts)
            .map(|r| r.version)
            .ok_or_else(|| KilnError::network(format!("{} lists no LTS release", index)).into())
    }
}
