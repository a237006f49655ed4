//! Include/exclude filtering of relative keys
//!
//! Both sides of a transfer are reduced to `/`-separated relative keys before filtering, so the
//! same pattern behaves identically for a local tree and for a remote prefix.
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/`
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - Leading `/` anchors the pattern to the transfer root
//! - Trailing `/` matches only directories
//!
//! # Examples
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//!
//! let mut settings = FilterSettings::default();
//! settings.add_exclude("*.tmp").unwrap();
//! settings.add_exclude("cache/").unwrap();
//!
//! assert!(matches!(
//!     settings.should_include("logs/run.tmp", false),
//!     FilterResult::ExcludedByPattern(_)
//! ));
//! assert!(settings.includes_key("logs/run.txt"));
//! assert!(!settings.includes_key("cache/"));
//! ```

use anyhow::{Context, anyhow};

/// A compiled glob together with the markers that were stripped from it
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// pattern as the user wrote it
    pub original: String,
    matcher: globset::GlobMatcher,
    /// pattern ends with / (matches only directories)
    pub dir_only: bool,
    /// pattern starts with / (anchored to the transfer root)
    pub anchored: bool,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let core = pattern.trim_start_matches('/').trim_end_matches('/');
        if core.is_empty() {
            return Err(anyhow!(
                "pattern '{}' results in empty glob after stripping / markers",
                pattern
            ));
        }
        let matcher = globset::GlobBuilder::new(core)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?
            .compile_matcher();
        Ok(Self {
            original: pattern.to_string(),
            matcher,
            dir_only: pattern.ends_with('/'),
            anchored: pattern.starts_with('/'),
        })
    }

    /// The glob without its anchor and directory markers
    fn core(&self) -> &str {
        self.original.trim_start_matches('/').trim_end_matches('/')
    }

    /// Patterns containing an inner `/` must match the whole key
    fn spans_directories(&self) -> bool {
        self.core().contains('/')
    }

    /// Check a relative key (no leading or trailing `/`) against this pattern
    pub fn matches(&self, key: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.matcher.is_match(key) {
            return true;
        }
        if self.anchored || self.spans_directories() {
            return false;
        }
        // simple patterns like `*.txt` also match the last component anywhere in the tree
        match key.rsplit_once('/') {
            Some((_, name)) => self.matcher.is_match(name),
            None => false,
        }
    }
}

/// Result of checking whether a key should be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    Included,
    /// include patterns exist but none matched
    ExcludedByDefault,
    /// an exclude pattern matched
    ExcludedByPattern(String),
}

impl FilterResult {
    pub fn is_included(&self) -> bool {
        matches!(self, FilterResult::Included)
    }
}

/// Include/exclude pattern sets
///
/// Excludes are checked first; when includes exist at least one of them must match. Directories
/// that do not match themselves are still included when they could contain a match, so that
/// walkers keep descending into them.
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    pub includes: Vec<FilterPattern>,
    pub excludes: Vec<FilterPattern>,
}

impl FilterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_include(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.includes.push(FilterPattern::parse(pattern)?);
        Ok(())
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.excludes.push(FilterPattern::parse(pattern)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn should_include(&self, key: &str, is_dir: bool) -> FilterResult {
        let key = key.trim_matches('/');
        if let Some(pattern) = self.excludes.iter().find(|p| p.matches(key, is_dir)) {
            return FilterResult::ExcludedByPattern(pattern.original.clone());
        }
        if self.includes.is_empty() || self.includes.iter().any(|p| p.matches(key, is_dir)) {
            return FilterResult::Included;
        }
        if is_dir && self.includes.iter().any(|p| could_contain_matches(key, p)) {
            return FilterResult::Included;
        }
        FilterResult::ExcludedByDefault
    }

    /// Convenience for keys that carry their own directory marker (a trailing `/`)
    pub fn includes_key(&self, key: &str) -> bool {
        self.should_include(key, key.ends_with('/')).is_included()
    }

    /// Parse filter settings from a file
    ///
    /// # File Format
    /// ```text
    /// # comments supported
    /// --include *.parquet
    /// --exclude tmp/
    /// ```
    pub fn from_file(path: &std::path::Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {:?}", path))?;
        Self::parse_content(&content)
    }

    pub fn parse_content(content: &str) -> Result<Self, anyhow::Error> {
        let mut settings = Self::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_num = idx + 1;
            if let Some(pattern) = line.strip_prefix("--include ") {
                settings
                    .add_include(pattern.trim())
                    .with_context(|| format!("line {}: invalid include pattern", line_num))?;
            } else if let Some(pattern) = line.strip_prefix("--exclude ") {
                settings
                    .add_exclude(pattern.trim())
                    .with_context(|| format!("line {}: invalid exclude pattern", line_num))?;
            } else {
                return Err(anyhow!(
                    "line {}: invalid syntax '{}', expected '--include PATTERN' or '--exclude PATTERN'",
                    line_num,
                    line
                ));
            }
        }
        Ok(settings)
    }
}

/// Whether keys below directory `dir` could still match `pattern`
fn could_contain_matches(dir: &str, pattern: &FilterPattern) -> bool {
    if !pattern.anchored && !pattern.spans_directories() {
        return true;
    }
    let prefix = literal_prefix(pattern.core());
    if prefix.is_empty() || dir.is_empty() {
        return true;
    }
    // dir is an ancestor of (or equal to) the literal prefix
    if prefix
        .strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    {
        return true;
    }
    // dir lies underneath the literal prefix
    match dir.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Portion of a glob before its first wildcard, cut back to a whole path component
fn literal_prefix(pattern: &str) -> &str {
    let Some(wildcard) = pattern.find(['*', '?', '[']) else {
        return pattern;
    };
    match pattern[..wildcard].rfind('/') {
        Some(pos) => &pattern[..pos],
        None => "",
    }
}
