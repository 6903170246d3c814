//! Read-only file access used by static mounts.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// File attributes the file server needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub is_dir: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Read-only filesystem capability.
///
/// Paths are slash-separated and interpreted relative to the root of the
/// implementation.
pub trait FileSystem: Send + Sync {
    fn metadata(&self, path: &Path) -> io::Result<Metadata>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Entries sorted by name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
}

/// The host filesystem, paths are used as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl FileSystem for OsFs {
    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        let meta = fs::metadata(path)?;
        Ok(Metadata {
            is_dir: meta.is_dir(),
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// A view of another filesystem restricted to a base directory.
///
/// Every path is cleaned and joined onto the base. A path that would
/// climb out of the base is reported as not found.
#[derive(Clone)]
pub struct BasePathFs {
    inner: Arc<dyn FileSystem>,
    base: PathBuf,
}

impl BasePathFs {
    pub fn new(inner: Arc<dyn FileSystem>, base: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            base: base.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn real_path(&self, path: &Path) -> io::Result<PathBuf> {
        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for comp in path.components() {
            match comp {
                Component::Normal(s) => parts.push(s),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(outside_base(path));
                    }
                }
                Component::Prefix(_) => return Err(outside_base(path)),
            }
        }

        let mut real = self.base.clone();
        real.extend(parts);
        Ok(real)
    }
}

fn outside_base(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} is outside the base directory", path.display()),
    )
}

impl FileSystem for BasePathFs {
    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        self.inner.metadata(&self.real_path(path)?)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(&self.real_path(path)?)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.inner.read_dir(&self.real_path(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooted() -> (tempfile::TempDir, BasePathFs) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let fs = BasePathFs::new(Arc::new(OsFs), dir.path());
        (dir, fs)
    }

    #[test]
    fn test_reads_below_base() {
        let (_dir, fs) = rooted();

        assert_eq!(fs.read(Path::new("/css/site.css")).unwrap(), b"body{}");
        assert_eq!(fs.read(Path::new("css/./site.css")).unwrap(), b"body{}");
        assert!(fs.metadata(Path::new("/css")).unwrap().is_dir);
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, fs) = rooted();

        let err = fs.read(Path::new("/../Cargo.toml")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = fs.metadata(Path::new("css/../../etc/passwd")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_dot_dot_inside_base_is_allowed() {
        let (_dir, fs) = rooted();

        assert_eq!(fs.read(Path::new("/css/../index.html")).unwrap(), b"<h1>hi</h1>");
    }

    #[test]
    fn test_read_dir_is_sorted() {
        let (_dir, fs) = rooted();

        let names: Vec<_> = fs
            .read_dir(Path::new("/"))
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(
            names,
            vec![("css".to_string(), true), ("index.html".to_string(), false)]
        );
    }

    #[test]
    fn test_nested_base_paths() {
        let (dir, _) = rooted();
        let outer: Arc<dyn FileSystem> = Arc::new(BasePathFs::new(Arc::new(OsFs), dir.path()));
        let inner = BasePathFs::new(outer, "/css");

        assert_eq!(inner.read(Path::new("site.css")).unwrap(), b"body{}");
        assert!(inner.read(Path::new("../index.html")).is_err());
    }
}
