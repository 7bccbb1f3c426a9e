//! Repository flavours.

use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

/// Default pattern for Debian package filenames.
///
/// `name_version[-revision]_arch.(deb|udeb)`
pub const DEB_PACKAGE_PATTERN: &str = r"^([^_]+)_(.+?)(?:-([^-_]+))?_([^_]+)\.(u?deb)$";

/// Default pattern for RPM package filenames.
///
/// `name-version[-release].arch.(rpm|delta.rpm)`
pub const RPM_PACKAGE_PATTERN: &str =
    r"^(.+?)-(\d[^-]*?)(?:-([^-]+?))?\.([^.-]+)\.((?:delta\.)?rpm)$";

/// Type of package repository served by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    /// Debian/APT style repository.
    Deb,
    /// RPM/YUM style repository.
    Rpm,
}

impl BackendType {
    /// All known backend types.
    pub const ALL: [BackendType; 2] = [BackendType::Deb, BackendType::Rpm];

    /// Filename pattern used when the configuration does not override it.
    pub fn default_pattern(&self) -> &'static str {
        match self {
            BackendType::Deb => DEB_PACKAGE_PATTERN,
            BackendType::Rpm => RPM_PACKAGE_PATTERN,
        }
    }

    /// Configuration key for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Deb => "deb",
            BackendType::Rpm => "rpm",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deb" | "debian" => Ok(BackendType::Deb),
            "rpm" => Ok(BackendType::Rpm),
            other => Err(ProxyError::Initialization(format!(
                "unknown backend type '{}'",
                other
            ))),
        }
    }
}
