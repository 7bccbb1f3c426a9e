//! Filename to package metadata parsing.

use regex::Regex;

use super::core::RepoPackage;
use super::types::BackendType;
use crate::error::{ProxyError, ProxyResult};

/// Parses package filenames with a five-group pattern.
///
/// The pattern must capture, in order: basename, version, revision,
/// architecture and extension. The revision group may be optional.
///
/// Every package produced by this parser is immutable: a repository never
/// republishes different content under the same name/version/revision, so
/// cached copies never need a freshness check.
#[derive(Debug, Clone)]
pub struct PackageNameParser {
    /// Pattern as configured.
    source: String,
    /// Pattern anchored to match the whole filename.
    pattern: Regex,
}

/// Number of capture groups a package pattern must have.
const REQUIRED_GROUPS: usize = 5;

impl PackageNameParser {
    /// Create a parser from a pattern string.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` if the pattern does not compile or does not
    /// have exactly five capture groups.
    pub fn new(pattern: &str) -> ProxyResult<Self> {
        let source = pattern.to_string();
        let pattern = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            ProxyError::Initialization(format!("invalid package pattern '{}': {}", source, e))
        })?;

        // captures_len() counts the implicit whole-match group
        let groups = pattern.captures_len() - 1;
        if groups != REQUIRED_GROUPS {
            return Err(ProxyError::Initialization(format!(
                "package pattern '{}' has {} capture groups, expected {}",
                source, groups, REQUIRED_GROUPS
            )));
        }

        Ok(Self { source, pattern })
    }

    /// Create a parser with the built-in pattern for a backend type.
    pub fn for_type(backend_type: BackendType) -> Self {
        Self::new(backend_type.default_pattern()).expect("built-in package pattern must compile")
    }

    /// Parse a filename into package metadata.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPackageName` if the filename does not match. Callers
    /// treat such files as opaque resources (e.g. repository indices).
    pub fn parse(&self, filename: &str) -> ProxyResult<RepoPackage> {
        let caps = self
            .pattern
            .captures(filename)
            .ok_or_else(|| {
                ProxyError::InvalidPackageName(format!(
                    "package name '{}' has an illegal format",
                    filename
                ))
            })?;

        let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

        Ok(RepoPackage::new(
            group(1),
            group(2),
            caps.get(3).map(|m| m.as_str()),
            group(4),
            group(5),
            true,
        ))
    }

    /// Parse several filenames, failing on the first invalid one.
    pub fn parse_all<'a, I>(&self, filenames: I) -> ProxyResult<Vec<RepoPackage>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        filenames.into_iter().map(|name| self.parse(name)).collect()
    }

    /// The underlying pattern.
    pub fn pattern(&self) -> &str {
        &self.source
    }
}
