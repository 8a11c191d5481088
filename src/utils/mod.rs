use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{DirEntry, ReadDir};
use tokio::io;
use tracing::warn;

pub struct FileWalker {
    omit_directories: bool,
    follow_links: bool,
    stack: Vec<ReadDir>,
}

impl FileWalker {
    pub fn empty(with_directories: bool) -> Self {
        Self {
            omit_directories: !with_directories,
            follow_links: false,
            stack: vec![],
        }
    }

    /// Descend into symlinked directories instead of yielding the link itself.
    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub async fn push(&mut self, path: impl AsRef<Path>) -> io::Result<&mut Self> {
        self.stack.push(tokio::fs::read_dir(path).await?);

        Ok(self)
    }

    async fn is_dir(&self, entry: &DirEntry) -> io::Result<bool> {
        let file_type = entry.file_type().await?;
        if file_type.is_symlink() && self.follow_links {
            return match tokio::fs::metadata(entry.path()).await {
                Ok(md) => Ok(md.is_dir()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            };
        }

        Ok(file_type.is_dir())
    }

    pub async fn next(&mut self) -> io::Result<Option<DirEntry>> {
        loop {
            let next = {
                let top = if let Some(top) = self.stack.last_mut() {
                    top
                } else {
                    return Ok(None);
                };

                top.next_entry().await?
            };

            let next = if let Some(v) = next {
                v
            } else {
                self.stack.pop();
                continue;
            };

            if !self.is_dir(&next).await? {
                return Ok(Some(next));
            }

            self.stack.push(tokio::fs::read_dir(next.path()).await?);

            if !self.omit_directories {
                return Ok(Some(next));
            }
        }
    }
}

pub async fn path_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes a file or a directory tree. Returns whether anything was removed.
pub async fn remove_path(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = path.as_ref();
    let md = match tokio::fs::symlink_metadata(path).await {
        Ok(md) => md,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if md.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }

    Ok(true)
}

pub async fn dir_is_non_empty(path: impl AsRef<Path>) -> io::Result<bool> {
    match tokio::fs::read_dir(path).await {
        Ok(mut rd) => Ok(rd.next_entry().await?.is_some()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copies `source` into `destination` recursively, following symlinks.
///
/// Dangling links are skipped. Returns the number of files copied.
pub async fn copy_tree(source: &Path, destination: &Path) -> io::Result<usize> {
    tokio::fs::create_dir_all(destination).await?;

    let mut walker = FileWalker::empty(true).follow_links(true);
    walker.push(source).await?;

    let mut copied = 0;
    while let Some(entry) = walker.next().await? {
        let path = entry.path();
        let relative = match path.strip_prefix(source) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };
        let target = destination.join(&relative);

        let md = match tokio::fs::metadata(&path).await {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "skipping dangling symlink");
                continue;
            }
            Err(e) => return Err(e),
        };

        if md.is_dir() {
            tokio::fs::create_dir_all(&target).await?;
            continue;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::copy(&path, &target).await?;
        copied += 1;
    }

    Ok(copied)
}

pub async fn file_size(path: impl AsRef<Path>) -> io::Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

pub fn relative_to(path: &Path, root: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}
