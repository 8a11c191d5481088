use crate::engine::packager::{PackageManifest, Packager, PackagerBuilder};
use crate::engine::EngineSettings;
use crate::utils::{relative_to, FileWalker};
use async_trait::async_trait;
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Writes the staging directory into a deflated zip archive.
#[derive(Debug)]
pub struct Zip {
    settings: Arc<EngineSettings>,
}

impl PackagerBuilder for Zip {
    type Output = Zip;

    fn build(settings: Arc<EngineSettings>) -> Self::Output {
        Zip { settings }
    }
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Packager for Zip {
    async fn build_package(&self, manifest: &PackageManifest) -> anyhow::Result<()> {
        debug!(project = %self.settings.project().name, archive = %manifest.archive.display(), "writing zip");

        let file = tokio::fs::File::create(&manifest.archive).await?;
        let mut writer = ZipFileWriter::with_tokio(file);

        let mut walker = FileWalker::empty(false);
        walker.push(&manifest.staging).await?;

        while let Some(entry) = walker.next().await? {
            let path = entry.path();
            let relative = match relative_to(&path, &manifest.staging) {
                Some(r) => r,
                None => continue,
            };

            let mode = entry.metadata().await?.permissions().mode();
            let data = tokio::fs::read(&path).await?;

            let builder = ZipEntryBuilder::new(entry_name(&relative).into(), Compression::Deflate)
                .unix_permissions((mode & 0o7777) as u16);
            writer.write_entry_whole(builder, &data).await?;
        }

        writer.close().await?;

        Ok(())
    }
}
