//! Pidfile handling: create-exclusive, write the running PID, remove on
//! exit. Mirrors `utils.c`'s `save_pidfile` (an `O_EXCL` create refuses to
//! start a second instance against the same pidfile; no `flock`/staleness
//! detection beyond that, matching the original).

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Holds an open pidfile for the lifetime of the process; the file is
/// removed when this is dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates `path` exclusively and writes the current PID followed by a
    /// newline. Fails if the file already exists (another instance, or a
    /// stale leftover from an unclean shutdown — both are the operator's
    /// problem to clear, as in the original).
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pidfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_removes_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip-rproxy.pid");

        {
            let pf = PidFile::create(&path).unwrap();
            assert!(pf.path().exists());
            let contents = std::fs::read_to_string(pf.path()).unwrap();
            assert_eq!(contents.trim(), std::process::id().to_string());
        }

        assert!(!path.exists());
    }

    #[test]
    fn refuses_to_overwrite_an_existing_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip-rproxy.pid");
        let _first = PidFile::create(&path).unwrap();

        assert!(PidFile::create(&path).is_err());
    }
}
