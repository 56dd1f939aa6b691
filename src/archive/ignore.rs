//! Exclusion rules applied while building an archive
//!
//! Rules are written one per line in a gitignore-like dialect:
//!
//! * blank lines and lines starting with `#` are skipped
//! * `!pattern` re-includes paths an earlier rule excluded
//! * `/pattern` is anchored to the archive root
//! * `pattern/` only matches directories
//! * a pattern without any `/` matches at every depth
//!
//! The last rule that matches a path decides whether it is excluded.

use super::ArchiveError;
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

#[derive(Debug, Clone)]
struct Rule {
    matcher: GlobMatcher,
    negated: bool,
    dir_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn parse(source: &str) -> Result<Self, ArchiveError> {
        let mut rules = Vec::new();

        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (negated, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (dir_only, pattern) = match pattern.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            if pattern.is_empty() {
                continue;
            }

            let glob = if let Some(anchored) = pattern.strip_prefix('/') {
                anchored.to_string()
            } else if pattern.contains('/') {
                pattern.to_string()
            } else {
                format!("**/{}", pattern)
            };

            let matcher = GlobBuilder::new(&glob)
                .literal_separator(true)
                .build()
                .map_err(|source| ArchiveError::Pattern {
                    pattern: line.to_string(),
                    source,
                })?
                .compile_matcher();

            rules.push(Rule {
                matcher,
                negated,
                dir_only,
            });
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `relative` (a path relative to the archive root) is excluded.
    pub fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            if rule.matcher.is_match(relative) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unanchored_pattern_matches_any_depth() {
        let rules = IgnoreRules::parse("*.log").unwrap();
        assert!(rules.is_ignored(Path::new("debug.log"), false));
        assert!(rules.is_ignored(Path::new("logs/2024/debug.log"), false));
        assert!(!rules.is_ignored(Path::new("save.dat"), false));
    }

    #[test]
    fn test_anchored_pattern_only_matches_root() {
        let rules = IgnoreRules::parse("/cache").unwrap();
        assert!(rules.is_ignored(Path::new("cache"), true));
        assert!(!rules.is_ignored(Path::new("plugins/cache"), true));
    }

    #[test]
    fn test_directory_only_pattern() {
        let rules = IgnoreRules::parse("tmp/").unwrap();
        assert!(rules.is_ignored(Path::new("tmp"), true));
        assert!(!rules.is_ignored(Path::new("tmp"), false));
    }

    #[test]
    fn test_last_rule_wins() {
        let rules = IgnoreRules::parse("*.log\n!keep.log\n").unwrap();
        assert!(rules.is_ignored(Path::new("server.log"), false));
        assert!(!rules.is_ignored(Path::new("keep.log"), false));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let rules = IgnoreRules::parse("# comment\n\n   \n").unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = IgnoreRules::parse("[unclosed").unwrap_err();
        assert!(matches!(err, ArchiveError::Pattern { .. }));
    }
}
