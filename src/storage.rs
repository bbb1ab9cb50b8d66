// Backing storage for transfers.
//
// A session only ever needs two things from storage: open an existing file for reading (and learn
// its size), or create a brand new file for writing. Failures are reported as io::Error and
// classified later by the error mapper.

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

/// Source and sink of transferred files.
#[allow(async_fn_in_trait)]
pub trait Storage {
    /// The stream a session owns for its lifetime.
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Opens an existing file for reading, returning it along with its size in bytes.
    async fn open(&self, path: &str) -> io::Result<(Self::Stream, u64)>;

    /// Creates a file that must not exist yet.
    async fn create_new(&self, path: &str) -> io::Result<Self::Stream>;
}

/// Serves files out of a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    read_only: bool,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> FsStorage {
        FsStorage { root: root.into(), read_only: false }
    }

    /// Refuses every write request with a permission error.
    pub fn read_only(mut self, read_only: bool) -> FsStorage {
        self.read_only = read_only;
        self
    }

    /// Resolves a requested filename under the root. Absolute paths are treated as relative to the
    /// root; anything that could escape it is refused.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let confined = relative.components().all(|c| matches!(c, Component::Normal(_)));

        if relative.as_os_str().is_empty() || !confined {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("path '{path}' is outside the served directory"),
            ));
        }

        Ok(self.root.join(relative))
    }
}

impl Storage for FsStorage {
    type Stream = File;

    async fn open(&self, path: &str) -> io::Result<(File, u64)> {
        let full_path = self.resolve(path)?;
        log::info!("Reading from {:#?}", full_path);

        let f = File::open(&full_path).await?;
        let meta = f.metadata().await?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is a directory", full_path.display()),
            ));
        }

        Ok((f, meta.len()))
    }

    async fn create_new(&self, path: &str) -> io::Result<File> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "server does not accept writes",
            ));
        }

        let full_path = self.resolve(path)?;
        log::info!("Writing to {:#?}", full_path);
        File::create_new(&full_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_open_invalid_path() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path());

        assert_eq!(
            storage.open("some/invalid/file.txt").await.err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_open_reports_size() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut file = File::create(tmpdir.path().join("test.txt")).await.unwrap();
        file.write_all(b"testing").await.unwrap();
        file.flush().await.unwrap();

        let storage = FsStorage::new(tmpdir.path());
        let (_, size) = assert_ok!(storage.open("/test.txt").await);
        assert_eq!(size, 7);
    }

    #[tokio::test]
    async fn test_open_directory_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::create_dir(tmpdir.path().join("sub")).unwrap();

        let storage = FsStorage::new(tmpdir.path());
        assert_eq!(
            storage.open("sub").await.err().unwrap().kind(),
            io::ErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_create_new_refuses_existing() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("test.txt"), b"keep me").unwrap();

        let storage = FsStorage::new(tmpdir.path());
        assert_eq!(
            storage.create_new("test.txt").await.err().unwrap().kind(),
            io::ErrorKind::AlreadyExists
        );
        assert_eq!(std::fs::read(tmpdir.path().join("test.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_create_new_valid_path() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path());

        assert_ok!(storage.create_new("test.txt").await);
        assert!(tmpdir.path().join("test.txt").exists());
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path()).read_only(true);

        assert_eq!(
            storage.create_new("test.txt").await.err().unwrap().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert!(!tmpdir.path().join("test.txt").exists());
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path().join("root"));

        for path in ["../secret.txt", "a/../../secret.txt", "./a.txt", "", "/"] {
            assert_eq!(
                storage.open(path).await.err().unwrap().kind(),
                io::ErrorKind::PermissionDenied,
                "path {path:?} should be refused"
            );
        }
    }
}
