//! dpkg-compatible version ordering.
//!
//! Versions are compared fragment by fragment: a run of non-digits is
//! compared character by character with a custom order, then the following
//! run of digits is compared numerically (leading zeros ignored). This is
//! the algorithm `dpkg --compare-versions` uses for upstream versions and
//! revisions.
//!
//! # Character order
//!
//! | Character       | Order          |
//! |-----------------|----------------|
//! | `~`             | -1             |
//! | end of string   | 0              |
//! | ASCII digit     | 0              |
//! | ASCII letter    | code point     |
//! | anything else   | code point+256 |
//!
//! So `1.0~rc1 < 1.0 < 1.0a < 1.0+b1`.

use std::cmp::Ordering;

use tracing::trace;

use super::core::RepoPackage;
use crate::error::{ProxyError, ProxyResult};

/// Offset that places non-letter symbols above all letters.
const NON_ALPHA_OFFSET: i32 = 256;

/// Orders packages of the same family by version.
///
/// Implementations define how version strings compare; the family check is
/// shared. Comparing packages with a different basename or architecture is a
/// caller error: it means a directory listing was not filtered properly.
pub trait VersionComparator: Send + Sync {
    /// Compare versions without checking the package family.
    fn compare_versions(&self, a: &RepoPackage, b: &RepoPackage) -> Ordering;

    /// Compare two packages of the same family.
    ///
    /// # Errors
    ///
    /// Returns `PackageFamilyMismatch` if basename or architecture differ.
    fn compare(&self, a: &RepoPackage, b: &RepoPackage) -> ProxyResult<Ordering> {
        if !a.same_family(b) {
            return Err(ProxyError::PackageFamilyMismatch {
                left: a.to_string(),
                right: b.to_string(),
            });
        }

        Ok(self.compare_versions(a, b))
    }
}

/// Debian (dpkg) version comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebianVersionComparator;

impl VersionComparator for DebianVersionComparator {
    fn compare_versions(&self, a: &RepoPackage, b: &RepoPackage) -> Ordering {
        trace!(left = %a, right = %b, "Comparing package versions");

        compare_fragment(a.version(), b.version()).then_with(|| {
            compare_fragment(a.revision().unwrap_or(""), b.revision().unwrap_or(""))
        })
    }
}

/// Compare a single version fragment (version or revision) dpkg-style.
///
/// ```
/// use repocache::package::compare_fragment;
///
/// assert!(compare_fragment("1.0.9", "1.0.10").is_lt());
/// assert!(compare_fragment("2.2.4~pre4", "2.2.4").is_lt());
/// assert!(compare_fragment("1.0.009", "1.0.9").is_eq());
/// ```
pub fn compare_fragment(a: &str, b: &str) -> Ordering {
    fragment_difference(a, b).cmp(&0)
}

/// Rank of the character at `pos`, or 0 past the end.
fn order(chars: &[char], pos: usize) -> i32 {
    match chars.get(pos) {
        None => 0,
        Some('~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => *c as i32,
        Some(c) => *c as i32 + NON_ALPHA_OFFSET,
    }
}

fn is_digit_at(chars: &[char], pos: usize) -> bool {
    chars.get(pos).is_some_and(|c| c.is_ascii_digit())
}

fn is_non_digit_at(chars: &[char], pos: usize) -> bool {
    chars.get(pos).is_some_and(|c| !c.is_ascii_digit())
}

/// Signed difference between two fragments; only the sign is meaningful.
fn fragment_difference(a: &str, b: &str) -> i32 {
    let c1: Vec<char> = a.chars().collect();
    let c2: Vec<char> = b.chars().collect();

    let mut p1 = 0;
    let mut p2 = 0;

    while p1 < c1.len() || p2 < c2.len() {
        let mut first_diff = 0;

        // Leading non-digit runs
        while is_non_digit_at(&c1, p1) || is_non_digit_at(&c2, p2) {
            let diff = order(&c1, p1) - order(&c2, p2);
            if diff != 0 {
                return diff;
            }
            p1 += 1;
            p2 += 1;
        }

        while c1.get(p1) == Some(&'0') {
            p1 += 1;
        }
        while c2.get(p2) == Some(&'0') {
            p2 += 1;
        }

        // Digit runs: remember the first differing digit, but a longer run wins
        while is_digit_at(&c1, p1) && is_digit_at(&c2, p2) {
            if first_diff == 0 {
                first_diff = c1[p1] as i32 - c2[p2] as i32;
            }
            p1 += 1;
            p2 += 1;
        }

        if is_digit_at(&c1, p1) {
            return 1;
        }
        if is_digit_at(&c2, p2) {
            return -1;
        }
        if first_diff != 0 {
            return first_diff;
        }
    }

    0
}
