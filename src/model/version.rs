//! Version comparison used to decide whether a remote release is newer.
//!
//! Versions with a numeric release part (`1.2`, `v2.0.1-SNAPSHOT`, `5.4b`)
//! are compared numerically segment by segment, padding the shorter side
//! with zeros, so `1.2` and `1.2.0` are equal. A version carrying a
//! pre-release suffix sorts before the same release without one. When
//! either side has no numeric release part the comparison falls back to
//! string inequality: identical strings are equal, anything else is
//! treated as newer on the remote side.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[vV]?(\d+(?:\.\d+)*)(.*)$").expect("valid release regex")
});

/// Compares a declared version against a remote one.
///
/// Returns `Ordering::Greater` when `remote` is newer than `declared`.
pub fn compare(declared: &str, remote: &str) -> Ordering {
    let declared = declared.trim();
    let remote = remote.trim();

    if declared == remote {
        return Ordering::Equal;
    }

    match (parse(declared), parse(remote)) {
        (Some(local), Some(other)) => other.cmp_to(&local),
        _ => Ordering::Greater,
    }
}

/// `true` iff `remote` is strictly newer than `declared`.
///
/// A plugin without a declared version cannot be proven current, so any
/// remote version counts as an update.
pub fn is_newer(declared: Option<&str>, remote: &str) -> bool {
    match declared.map(str::trim).filter(|v| !v.is_empty()) {
        Some(declared) => compare(declared, remote) == Ordering::Greater,
        None => !remote.trim().is_empty(),
    }
}

#[derive(Debug)]
struct ParsedVersion {
    release: Vec<u64>,
    suffix: String,
}

impl ParsedVersion {
    fn cmp_to(&self, other: &ParsedVersion) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for idx in 0..len {
            let a = self.release.get(idx).copied().unwrap_or(0);
            let b = other.release.get(idx).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }

        match (self.suffix.is_empty(), other.suffix.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self
                .suffix
                .to_lowercase()
                .cmp(&other.suffix.to_lowercase()),
        }
    }
}

fn parse(raw: &str) -> Option<ParsedVersion> {
    let caps = RELEASE_RE.captures(raw)?;
    let release = caps
        .get(1)?
        .as_str()
        .split('.')
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let suffix = caps
        .get(2)
        .map(|m| m.as_str().trim_start_matches(['-', '+', '_', ' ']))
        .unwrap_or_default()
        .to_string();

    Some(ParsedVersion { release, suffix })
}
