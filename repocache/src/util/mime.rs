//! Content types for repository files.

use std::path::Path;

/// Fallback for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for a repository file, derived from its extension.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("deb") | Some("udeb") => "application/vnd.debian.binary-package",
        Some("dsc") => "text/prs.lines.tag",
        Some("rpm") => "application/x-rpm",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("xz") => "application/x-xz",
        Some("bz2") => "application/x-bzip2",
        Some("lzma") => "application/x-lzma",
        Some("zst") => "application/zstd",
        Some("gpg") | Some("asc") | Some("sig") => "application/pgp-signature",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain",
        Some(_) => OCTET_STREAM,
        // Release, Packages, InRelease, ...
        None => "text/plain",
    }
}
