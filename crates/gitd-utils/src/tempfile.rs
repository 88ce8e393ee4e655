//! Temporary files with atomic install.
//!
//! A [`TempFile`] is created in the same directory as its eventual target so
//! the final `rename` stays on one filesystem and is atomic. Dropping an
//! unpersisted temp file removes it.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

/// A temporary file with RAII cleanup.
pub struct TempFile {
    inner: Option<::tempfile::NamedTempFile>,
}

impl TempFile {
    /// Create a new temporary file in the given directory with a unique name.
    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let named = ::tempfile::NamedTempFile::new_in(dir)?;
        Ok(Self { inner: Some(named) })
    }

    /// Create a temporary file with the given prefix in `dir`.
    pub fn with_prefix_in(prefix: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let named = ::tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
        Ok(Self { inner: Some(named) })
    }

    /// Get the path of the temporary file.
    pub fn path(&self) -> &Path {
        self.inner.as_ref().map(|n| n.path()).unwrap_or(Path::new(""))
    }

    /// Get a mutable reference to the file handle.
    pub fn file_mut(&mut self) -> Option<&mut fs::File> {
        self.inner.as_mut().map(|n| n.as_file_mut())
    }

    /// Flush file contents to stable storage.
    pub fn sync_all(&mut self) -> Result<()> {
        if let Some(named) = self.inner.as_mut() {
            named.as_file_mut().sync_all()?;
        }
        Ok(())
    }

    /// Drop write permission on the temp file ahead of install.
    pub fn set_readonly(&mut self) -> Result<()> {
        if let Some(named) = self.inner.as_ref() {
            let mut perms = named.as_file().metadata()?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(named.path(), perms)?;
        }
        Ok(())
    }

    /// Persist the temporary file by renaming it to the target path.
    /// This consumes the TempFile.
    pub fn persist(mut self, target: impl AsRef<Path>) -> Result<()> {
        if let Some(named) = self.inner.take() {
            named
                .persist(target.as_ref())
                .map_err(|e| crate::UtilError::Io(e.error))?;
        }
        Ok(())
    }

    /// Remove the temporary file immediately.
    pub fn remove(mut self) -> Result<()> {
        if let Some(named) = self.inner.take() {
            named.close()?;
        }
        Ok(())
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .flush()
    }
}
