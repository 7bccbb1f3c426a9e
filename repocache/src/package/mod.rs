//! Package identity, filename parsing and version ordering.
//!
//! This module turns repository filenames into structured [`RepoPackage`]
//! values and orders versions of the same package family:
//!
//! - [`PackageNameParser`] - filename to metadata via a five-group pattern
//! - [`VersionComparator`] / [`DebianVersionComparator`] - dpkg ordering
//! - [`BackendType`] - repository flavour, selects the default pattern
//!
//! # Example
//!
//! ```
//! use repocache::package::{BackendType, DebianVersionComparator, PackageNameParser, VersionComparator};
//!
//! let parser = PackageNameParser::for_type(BackendType::Deb);
//! let old = parser.parse("dummy_1.0.9-2_i386.deb").unwrap();
//! let new = parser.parse("dummy_1.0.10-1_i386.deb").unwrap();
//!
//! let comparator = DebianVersionComparator;
//! assert!(comparator.compare(&old, &new).unwrap().is_lt());
//! ```

mod core;
mod parser;
mod types;
mod version;

pub use self::core::RepoPackage;
pub use parser::PackageNameParser;
pub use types::BackendType;
pub use version::{compare_fragment, DebianVersionComparator, VersionComparator};
