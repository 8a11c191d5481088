use async_compression::tokio::bufread::{GzipDecoder, XzDecoder};
use std::ffi::OsStr;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct Extractor;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum Compression {
    None,
    Gzip,
    Xz,
}

const GUESSES: &[(&str, Compression)] = &[
    (".tar.xz", Compression::Xz),
    (".tar.gz", Compression::Gzip),
    (".tgz", Compression::Gzip),
    (".tar", Compression::None),
];

enum Decompressor<R: AsyncBufRead> {
    PassThrough(R),
    Xz(XzDecoder<R>),
    Gzip(GzipDecoder<R>),
}

impl<R: AsyncBufRead + Unpin> AsyncRead for Decompressor<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Decompressor::PassThrough(r) => AsyncRead::poll_read(Pin::new(r), cx, buf),
            Decompressor::Xz(r) => AsyncRead::poll_read(Pin::new(r), cx, buf),
            Decompressor::Gzip(r) => AsyncRead::poll_read(Pin::new(r), cx, buf),
        }
    }
}

fn guess_compression(archive: &Path) -> Option<Compression> {
    let name = archive.file_name().and_then(OsStr::to_str)?;

    GUESSES
        .iter()
        .find(|(ext, _)| name.ends_with(*ext))
        .map(|(_, comp)| *comp)
}

impl Extractor {
    pub fn new() -> Self {
        Extractor
    }

    /// Unpacks a tarball into `destination`, keeping the archive's own top-level directory.
    pub async fn extract(&self, archive: &Path, destination: &Path) -> anyhow::Result<()> {
        let compression = match guess_compression(archive) {
            Some(c) => c,
            None => anyhow::bail!("couldn't guess archive type of {}", archive.display()),
        };

        tokio::fs::create_dir_all(destination).await?;
        info!(archive = %archive.display(), into = %destination.display(), "extracting");

        let read = OpenOptions::new().read(true).open(archive).await?;
        let read = tokio::io::BufReader::new(read);
        let read = match compression {
            Compression::None => Decompressor::PassThrough(read),
            Compression::Gzip => Decompressor::Gzip(GzipDecoder::new(read)),
            Compression::Xz => Decompressor::Xz(XzDecoder::new(read)),
        };

        let mut tar = tokio_tar::Archive::new(read);
        tar.unpack(destination).await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_compression::tokio::write::XzEncoder;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    /// Writes a `.tar.xz` holding `(path, mode, contents)` entries.
    pub async fn write_tar_xz(path: &Path, entries: &[(&str, u32, &[u8])]) {
        let file = tokio::fs::File::create(path).await.unwrap();
        let mut builder = tokio_tar::Builder::new(XzEncoder::new(file));

        for (name, mode, data) in entries {
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).await.unwrap();
        }

        let mut encoder = builder.into_inner().await.unwrap();
        encoder.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn extracts_xz_tarballs() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("node-v20.18.0-linux-x64.tar.xz");
        write_tar_xz(
            &archive,
            &[("node-v20.18.0-linux-x64/bin/node", 0o755, b"#!/bin/sh\n")],
        )
        .await;

        let out = tmp.path().join("out");
        Extractor::new().extract(&archive, &out).await.unwrap();

        let node = out.join("node-v20.18.0-linux-x64/bin/node");
        assert_eq!(std::fs::read(&node).unwrap(), b"#!/bin/sh\n");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&node).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn rejects_unknown_archive_types() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("node.rar");
        std::fs::write(&archive, "x").unwrap();

        assert!(Extractor::new()
            .extract(&archive, &tmp.path().join("out"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn corrupt_archives_fail() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("node.tar.xz");
        std::fs::write(&archive, "definitely not xz").unwrap();

        assert!(Extractor::new()
            .extract(&archive, &tmp.path().join("out"))
            .await
            .is_err());
    }
}
