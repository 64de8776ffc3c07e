//! Root-confined filesystem access.
//!
//! Every path is resolved lexically against the root before any I/O, so a
//! traversal that would leave the root fails with [`AccessDeniedError`]
//! without touching the disk. Writes land under a temporary name and are
//! renamed into place on commit; readers never see a partial file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use ulid::Ulid;

use crate::error::{AccessDeniedError, Error};

/// Environment variable naming the default filesystem root.
pub const FILESYSTEM_DIR_ENV: &str = "WEFT_FILESYSTEM_DIR";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filesystem {
    root: PathBuf,
}

/// Lexical normalization. `None` if a `..` would climb above the start of
/// `path`.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

impl Filesystem {
    /// Relative roots are anchored at the current directory, so confinement
    /// never depends on how the root was spelled.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root: normalize(&root).unwrap_or(root),
        }
    }

    /// Filesystem rooted at `$WEFT_FILESYSTEM_DIR`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(FILESYSTEM_DIR_ENV).map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A filesystem confined to `sub` below this root.
    pub fn scoped(&self, sub: impl AsRef<Path>) -> Result<Filesystem, AccessDeniedError> {
        Ok(Filesystem {
            root: self.resolve(sub)?,
        })
    }

    /// Confined absolute path for `path`. Relative paths are taken from the
    /// root; absolute paths must already lie under it.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, AccessDeniedError> {
        let path = path.as_ref();
        match normalize(&self.root.join(path)) {
            Some(resolved) if resolved.starts_with(&self.root) => Ok(resolved),
            _ => {
                log::warn!("denied access to {} outside {}", path.display(), self.root.display());
                Err(AccessDeniedError {
                    path: path.display().to_string(),
                })
            }
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool, Error> {
        Ok(self.resolve(path)?.exists())
    }

    pub fn size_of(&self, path: impl AsRef<Path>) -> Result<u64, Error> {
        let resolved = self.resolve(path)?;
        let meta = fs::metadata(&resolved).map_err(|e| Error::io(&resolved, e))?;
        Ok(meta.len())
    }

    pub fn make_dirs(&self, path: impl AsRef<Path>) -> Result<PathBuf, Error> {
        let resolved = self.resolve(path)?;
        fs::create_dir_all(&resolved).map_err(|e| Error::io(&resolved, e))?;
        Ok(resolved)
    }

    pub fn open_read(&self, path: impl AsRef<Path>) -> Result<File, Error> {
        let resolved = self.resolve(path)?;
        File::open(&resolved).map_err(|e| Error::io(&resolved, e))
    }

    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String, Error> {
        let resolved = self.resolve(path)?;
        fs::read_to_string(&resolved).map_err(|e| Error::io(&resolved, e))
    }

    /// Write handle whose content appears at `path` only after
    /// [`AtomicWrite::commit`].
    pub fn open_write(&self, path: impl AsRef<Path>) -> Result<AtomicWrite, Error> {
        let target = self.resolve(path)?;
        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| Error::io(&parent, e))?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{name}.{}.tmp", Ulid::new()));
        let file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        Ok(AtomicWrite {
            file: Some(BufWriter::new(file)),
            tmp,
            target,
        })
    }

    pub fn write_atomic(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<(), Error> {
        let mut handle = self.open_write(path)?;
        handle
            .write_all(contents)
            .map_err(|e| Error::io(&handle.target, e))?;
        handle.commit()
    }
}

/// Pending write to a temporary sibling of the target path. Dropping it
/// without committing removes the temporary file.
#[derive(Debug)]
pub struct AtomicWrite {
    file: Option<BufWriter<File>>,
    tmp: PathBuf,
    target: PathBuf,
}

impl AtomicWrite {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn commit(mut self) -> Result<(), Error> {
        let Some(writer) = self.file.take() else {
            return Ok(());
        };
        let file = writer
            .into_inner()
            .map_err(|e| Error::io(&self.tmp, e.into_error()))?;
        file.sync_all().map_err(|e| Error::io(&self.tmp, e))?;
        drop(file);
        fs::rename(&self.tmp, &self.target).map_err(|e| Error::io(&self.target, e))?;
        log::debug!("committed {}", self.target.display());
        Ok(())
    }
}

impl Write for AtomicWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("write after commit")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicWrite {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
