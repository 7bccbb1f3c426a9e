//! On-disk cache entries.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use tracing::warn;

use crate::package::{BackendType, RepoPackage};
use crate::util::content_type_for;

/// Suffix of staging files written during a fetch.
pub const STAGING_SUFFIX: &str = ".tmp";

/// The cache entry for one resource path of one backend.
///
/// A `PoolObject` is a handle, not the data: it may point at a file that does
/// not exist yet. The final file's own modification time is the object's
/// last-modified stamp, so an object "exists" exactly when that file does.
///
/// Writers fill the staging file and then [`commit`](Self::commit) it over
/// the final path in one rename. Every mutation must happen under the
/// resource's write lock.
///
/// Parent directories are only created when staging starts. A cached file
/// that sits where a directory is needed (an upstream directory listing
/// stored under the directory's name) is dropped to make room, as long as it
/// lies below the object's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolObject {
    name: String,
    root: PathBuf,
    path: PathBuf,
    staging_path: PathBuf,
    backend_type: BackendType,
    package: Option<RepoPackage>,
}

impl PoolObject {
    pub(crate) fn new(path: PathBuf, backend_type: BackendType, package: Option<RepoPackage>) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging_path = path.with_file_name(format!("{}{}", name, STAGING_SUFFIX));
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Self {
            name,
            root,
            path,
            staging_path,
            backend_type,
            package,
        }
    }

    /// Directory below which cached files may be cleared to make room.
    pub(crate) fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// File name of the resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Final storage location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging location used while fetching.
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Parsed package identity, absent for unversioned files.
    pub fn package(&self) -> Option<&RepoPackage> {
        self.package.as_ref()
    }

    /// Whether the content can never change once cached.
    pub fn is_immutable(&self) -> bool {
        self.package.as_ref().is_some_and(RepoPackage::is_immutable)
    }

    /// Last-modified stamp, `None` when no regular file is cached.
    pub fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path)
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Size of the cached file.
    pub fn size(&self) -> Option<u64> {
        fs::metadata(&self.path)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Whether the path is occupied by a directory, so nothing can be stored.
    pub fn is_directory(&self) -> bool {
        self.path.is_dir()
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.name)
    }

    /// Open the cached file for reading.
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    /// Create (or truncate) the staging file, creating parents as needed.
    pub fn create_staging(&self) -> io::Result<File> {
        self.prepare_parent()?;
        File::create(&self.staging_path)
    }

    fn prepare_parent(&self) -> io::Result<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        let Err(e) = fs::create_dir_all(parent) else {
            return Ok(());
        };

        let blocker = parent
            .ancestors()
            .take_while(|dir| dir.starts_with(&self.root) && **dir != *self.root)
            .find(|dir| dir.is_file());
        match blocker {
            Some(file) => {
                warn!(file = %file.display(), "Dropping cached file in the way of a directory");
                fs::remove_file(file)?;
                fs::create_dir_all(parent)
            }
            None => Err(e),
        }
    }

    /// Stamp the staging file; the stamp survives the commit rename.
    pub fn set_staging_modified(&self, time: SystemTime) -> io::Result<()> {
        let stamp = FileTime::from_system_time(time);
        filetime::set_file_times(&self.staging_path, stamp, stamp)
    }

    /// Replace the final file with the staging file.
    pub fn commit(&self) -> io::Result<()> {
        match fs::rename(&self.staging_path, &self.path) {
            Ok(()) => Ok(()),
            // rename over an existing file is not atomic everywhere
            Err(_) if self.path.exists() => {
                fs::remove_file(&self.path)?;
                fs::rename(&self.staging_path, &self.path)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the staging file if present.
    pub fn discard_staging(&self) -> io::Result<()> {
        remove_if_present(&self.staging_path)
    }

    /// Delete both final and staging files. A directory at the final path
    /// is left alone.
    pub fn remove(&self) -> io::Result<()> {
        let staging = remove_if_present(&self.staging_path);
        if !self.is_directory() {
            remove_if_present(&self.path)?;
        }
        staging
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
