//! Core package identity type.

use std::fmt;

/// Parsed identity of a package filename.
///
/// Two packages belong to the same family when their basename and
/// architecture match; only packages of one family can be ordered by
/// version.
///
/// # Example
///
/// ```
/// use repocache::package::RepoPackage;
///
/// let package = RepoPackage::new("qemu", "0.9.0.cvs", Some("35"), "i586", "rpm", true);
/// assert_eq!(package.basename(), "qemu");
/// assert_eq!(package.revision(), Some("35"));
/// assert!(package.is_immutable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoPackage {
    basename: String,
    version: String,
    revision: Option<String>,
    arch: String,
    extension: String,
    immutable: bool,
}

impl RepoPackage {
    /// Create a new package identity.
    pub fn new(
        basename: impl Into<String>,
        version: impl Into<String>,
        revision: Option<&str>,
        arch: impl Into<String>,
        extension: impl Into<String>,
        immutable: bool,
    ) -> Self {
        Self {
            basename: basename.into(),
            version: version.into(),
            revision: revision.map(str::to_string),
            arch: arch.into(),
            extension: extension.into(),
            immutable,
        }
    }

    /// Package name without version information.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Upstream version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Packaging revision, if the filename carries one.
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Target architecture.
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// File extension (e.g. `deb`, `delta.rpm`).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Whether content under this exact filename never changes.
    ///
    /// Immutable packages are never re-validated against the upstream.
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Whether `other` belongs to the same package family.
    pub fn same_family(&self, other: &RepoPackage) -> bool {
        self.basename == other.basename && self.arch == other.arch
    }
}

impl fmt::Display for RepoPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(revision) => write!(
                f,
                "{} {}-{} ({})",
                self.basename, self.version, revision, self.arch
            ),
            None => write!(f, "{} {} ({})", self.basename, self.version, self.arch),
        }
    }
}
