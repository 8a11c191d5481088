use crate::definition::Verification;
use crate::engine::error::KilnError;
use crate::utils::{path_exists, remove_path};
use reqwest::Client;
use ring::digest::{Context, SHA256};
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Fetcher {
    http_client: Client,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fetched {
    /// A valid file was already present, nothing was transferred.
    Cached,
    Downloaded,
}

struct Digest {
    ctx: Context,
    expected: Option<[u8; 32]>,
}

impl Digest {
    fn from_verification(verification: &Verification) -> Self {
        Digest {
            ctx: Context::new(&SHA256),
            expected: verification.sha256,
        }
    }

    fn update(&mut self, data: &[u8]) {
        if self.expected.is_some() {
            self.ctx.update(data);
        }
    }

    /// `Err((expected, found))` on mismatch.
    fn finish(self) -> Result<(), ([u8; 32], Vec<u8>)> {
        let expected = match self.expected {
            Some(e) => e,
            None => return Ok(()),
        };

        let found = self.ctx.finish();
        if found.as_ref() == expected {
            Ok(())
        } else {
            Err((expected, found.as_ref().to_vec()))
        }
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Fetcher {
            http_client: Client::new(),
        }
    }

    /// Downloads `url` to `destination` unless a file passing [`Fetcher::verify`] is already there.
    ///
    /// A failed transfer never leaves `destination` behind.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        verification: &Verification,
    ) -> anyhow::Result<Fetched> {
        if path_exists(destination).await? {
            if self.verify(destination, verification).await? {
                info!(path = %destination.display(), "archive already present, skipping download");
                return Ok(Fetched::Cached);
            }

            warn!(path = %destination.display(), "existing archive failed verification, downloading again");
            remove_path(destination).await?;
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.download(url, destination, verification).await {
            Ok(()) => Ok(Fetched::Downloaded),
            Err(e) => {
                if let Err(remove_err) = remove_path(destination).await {
                    warn!(path = %destination.display(), error = %remove_err, "could not remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        destination: &Path,
        verification: &Verification,
    ) -> anyhow::Result<()> {
        info!(url, path = %destination.display(), "downloading");

        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| KilnError::network(format!("request to {} failed: {}", url, e)))?;

        let mut resp = resp
            .error_for_status()
            .map_err(|e| KilnError::network(format!("{} answered {}", url, e)))?;

        let total = resp.content_length();
        let mut written: u64 = 0;
        let mut f = File::create(destination).await?;
        let mut digest = Digest::from_verification(verification);

        loop {
            let chunk = resp.chunk().await.map_err(|e| {
                KilnError::network(format!(
                    "transfer of {} interrupted after {} bytes: {}",
                    url, written, e
                ))
            })?;

            let chunk = match chunk {
                Some(c) => c,
                None => break,
            };

            digest.update(&chunk);
            f.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        if let Some(total) = total {
            if written != total {
                return Err(KilnError::network(format!(
                    "transfer of {} ended after {} of {} bytes",
                    url, written, total
                ))
                .into());
            }
        }

        if let Err((expected, found)) = digest.finish() {
            drop(f);

            return Err(KilnError::Integrity {
                path: destination.to_path_buf(),
                message: format!(
                    "sha256 expected {} but found {}",
                    hex::encode(expected),
                    hex::encode(found)
                ),
            }
            .into());
        }

        f.sync_all().await?;
        info!(bytes = written, path = %destination.display(), "download complete");

        Ok(())
    }

    /// Checks the sha256 when one is configured, otherwise only that the file is non-empty.
    pub async fn verify(&self, path: &Path, verification: &Verification) -> anyhow::Result<bool> {
        if !path_exists(path).await? {
            return Ok(false);
        }

        if verification.sha256.is_none() {
            return Ok(tokio::fs::metadata(path).await?.len() > 0);
        }

        let mut file = OpenOptions::new().read(true).open(path).await?;
        let mut digest = Digest::from_verification(verification);
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let r = file.read(&mut buffer).await?;
            if r == 0 {
                break;
            }

            digest.update(&buffer[..r]);
        }

        Ok(digest.finish().is_ok())
    }
}
