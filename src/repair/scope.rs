//! Allowed-file scope for repair diffs.
//!
//! Entries are either literal paths or glob patterns (`src/**/*.ts`).
//! A proposal touching anything outside the scope needs human approval.

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Set of files a repair may touch without asking.
#[derive(Debug, Clone)]
pub struct AllowedFiles {
    entries: Vec<String>,
    globs: GlobSet,
}

impl AllowedFiles {
    /// Build a scope from literal paths and glob patterns.
    ///
    /// Invalid globs are logged and matched literally.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries: Vec<String> = entries
            .into_iter()
            .map(|e| normalize_path(&e.into()))
            .collect();
        let globs = build_globset(&entries);
        Self { entries, globs }
    }

    /// Entries as given (normalized).
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Whether `path` is inside the scope.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.entries.iter().any(|e| *e == path) || self.globs.is_match(&path)
    }

    /// Files from `files` outside the scope, in input order.
    #[must_use]
    pub fn out_of_scope(&self, files: &[String]) -> Vec<String> {
        let mut outside: Vec<String> = Vec::new();
        for file in files {
            if !self.contains(file) && !outside.contains(file) {
                outside.push(file.clone());
            }
        }
        outside
    }

    /// Add approved files to the scope.
    pub fn extend(&mut self, files: &[String]) {
        for file in files {
            let file = normalize_path(file);
            if !self.entries.contains(&file) {
                self.entries.push(file);
            }
        }
        self.globs = build_globset(&self.entries);
    }
}

fn normalize_path(path: &str) -> String {
    path.trim()
        .trim_start_matches("./")
        .replace('\\', "/")
}

fn build_globset(entries: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for entry in entries {
        if !entry.contains(['*', '?', '[', '{']) {
            continue;
        }
        match Glob::new(entry) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("Invalid allowed-file glob '{}': {}", entry, e),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!("Could not build allowed-file globs: {}", e);
        GlobSet::empty()
    })
}
