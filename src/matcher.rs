//! Include/exclude path filtering.
//!
//! Patterns follow doublestar glob semantics (`*`, `?`, `[class]`, `**`).
//! A pattern containing `/` is matched against the full path, anything else
//! against the basename only. Exclusion wins over inclusion; an empty
//! include list means match-all. Include matching is case-insensitive,
//! exclusion is not. Hidden files (leading `.` in the basename) are never
//! supported.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled filter verdict. Pure; no filesystem access.
#[derive(Debug)]
pub struct Matcher {
    exclude_path: GlobSet,
    exclude_base: GlobSet,
    include_path: GlobSet,
    include_base: GlobSet,
    include_empty: bool,
}

impl Matcher {
    /// Compile pattern lists. Unparsable patterns are dropped, matching the
    /// behavior of glob engines that report no match on error.
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let (exclude_path, exclude_base) = compile_split(exclude, false);
        let (include_path, include_base) = compile_split(include, true);
        Self {
            exclude_path,
            exclude_base,
            include_path,
            include_base,
            include_empty: include.is_empty(),
        }
    }

    /// Is this path in scope for the task?
    pub fn is_supported(&self, path: &Path) -> bool {
        let base = match path.file_name() {
            Some(name) => name.to_string_lossy(),
            None => return false,
        };

        if base.starts_with('.') {
            return false;
        }

        if self.exclude_base.is_match(base.as_ref()) || self.exclude_path.is_match(path) {
            return false;
        }

        if self.include_empty {
            return true;
        }

        self.include_base.is_match(base.as_ref()) || self.include_path.is_match(path)
    }
}

/// One-shot form of [`Matcher::is_supported`].
pub fn supported(path: &Path, include: &[String], exclude: &[String]) -> bool {
    Matcher::new(include, exclude).is_supported(path)
}

fn compile_split(patterns: &[String], case_insensitive: bool) -> (GlobSet, GlobSet) {
    let mut path_set = GlobSetBuilder::new();
    let mut base_set = GlobSetBuilder::new();

    for pattern in patterns {
        let with_separator = pattern.contains('/');
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            // `*` must not cross directory boundaries in path globs
            .literal_separator(with_separator)
            .build();
        match glob {
            Ok(glob) => {
                if with_separator {
                    path_set.add(glob);
                } else {
                    base_set.add(glob);
                }
            }
            Err(e) => tracing::debug!(pattern = %pattern, "skipping invalid glob: {e}"),
        }
    }

    (
        path_set.build().unwrap_or_else(|_| GlobSet::empty()),
        base_set.build().unwrap_or_else(|_| GlobSet::empty()),
    )
}
