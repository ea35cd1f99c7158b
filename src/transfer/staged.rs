//! Scoped ownership of a file in the staging directory.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

/// A local file owned by exactly one pipeline run.
///
/// Every staged file lives in its own uniquely named directory under the
/// staging root, so two runs relaying the same name never share a path. The
/// file and its directory are removed when the guard is dropped, whatever the
/// outcome of the run. A file that is already gone (the uploader deletes it
/// after a successful upload) is not an error.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl StagedFile {
    /// Reserves a fresh location for `filename` under `root`, creating `root`
    /// when missing. The file itself is not created.
    ///
    /// # Errors
    ///
    /// Returns the IO error if `root` or the private directory cannot be
    /// created.
    pub fn allocate(root: &Path, filename: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("relay-").tempdir_in(root)?;
        Ok(Self {
            path: dir.path().join(filename),
            dir: Some(dir),
        })
    }

    /// Location of the staged file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staged file"),
        }
        if let Some(dir) = self.dir.take() {
            let dir_path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %dir_path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_removes_file_and_directory() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        let staged = StagedFile::allocate(root.path(), "staged.bin")?;
        std::fs::write(staged.path(), b"data")?;
        let path = staged.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("staged.bin"));

        drop(staged);

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_drop_tolerates_missing_file() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        let staged = StagedFile::allocate(root.path(), "never-written.bin")?;
        drop(staged);
        assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_same_name_gets_distinct_paths() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        let first = StagedFile::allocate(root.path(), "file.bin")?;
        let second = StagedFile::allocate(root.path(), "file.bin")?;
        assert_ne!(first.path(), second.path());

        std::fs::write(second.path(), b"second")?;
        drop(first);
        assert_eq!(std::fs::read(second.path())?, b"second");
        Ok(())
    }

    #[test]
    fn test_root_is_created() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        let nested = root.path().join("files/staging");
        let staged = StagedFile::allocate(&nested, "a.bin")?;
        assert!(nested.is_dir());
        assert!(staged.path().starts_with(&nested));
        Ok(())
    }
}
