//! Leafname filtering.

use std::ffi::OsStr;

use glob::Pattern;

/// Decides which directory entries are worth tracking.
///
/// `""`, `"."` and `".."` are always rejected. With an exclude list, any
/// name matching one of the globs is rejected; without one, names ending in
/// `~` or `.tmp` are rejected instead.
pub(crate) struct NameFilter {
    excludes: Vec<Pattern>,
}

impl NameFilter {
    pub(crate) fn new(excludes: &[String]) -> Result<Self, crate::Error> {
        let excludes = excludes
            .iter()
            .map(|text| Pattern::new(text).map_err(|_| crate::Error::bad_exclude(text)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NameFilter { excludes })
    }

    pub(crate) fn accept(&self, name: &OsStr) -> bool {
        if name.is_empty() || name == OsStr::new(".") || name == OsStr::new("..") {
            return false;
        }

        let text = name.to_string_lossy();
        if !self.excludes.is_empty() {
            return !self.excludes.iter().any(|pattern| pattern.matches(&text));
        }

        // Default exclusions, matching the exclude seeds the sync worker
        // hands to rsync.
        if text.ends_with('~') {
            return false;
        }
        if text.len() > 4 && text.ends_with(".tmp") {
            return false;
        }
        true
    }
}
