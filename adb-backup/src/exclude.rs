//! Exclusion patterns.
//!
//! A `*` is a wildcard only as the first or last character of a pattern
//! segment; anywhere else it is a literal asterisk. So `*.log` matches
//! names ending in `.log`, `cache*` matches names starting with `cache`,
//! `*thumb*` matches names containing `thumb`, and `a*b*c` only matches a
//! file literally named `a*b*c`.
//!
//! A pattern without `/` is tested against every component of a path, so
//! excluding a directory name excludes everything below it. A pattern with
//! `/` is anchored at the backup root and matched segment by segment
//! against the leading components of the path.

use crate::{BackupError, Result};
use std::path::Path;

/// Decides whether a remote path is left out of the backup.
pub trait PathFilter: Send + Sync {
    fn is_excluded(&self, path: &str) -> bool;
}

impl<F> PathFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_excluded(&self, path: &str) -> bool {
        self(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Segment {
    fn parse(text: &str) -> Self {
        if text == "*" {
            return Segment::Any;
        }

        let leading = text.starts_with('*');
        let trailing = text.ends_with('*');
        let start = usize::from(leading);
        let end = text.len() - usize::from(trailing);
        let literal = text[start..end].to_string();

        match (leading, trailing) {
            (true, true) => Segment::Contains(literal),
            (true, false) => Segment::Suffix(literal),
            (false, true) => Segment::Prefix(literal),
            (false, false) => Segment::Exact(literal),
        }
    }

    fn matches(&self, component: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(s) => component == s,
            Segment::Prefix(s) => component.starts_with(s.as_str()),
            Segment::Suffix(s) => component.ends_with(s.as_str()),
            Segment::Contains(s) => component.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<Segment>,
    anchored: bool,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self> {
        let anchored = raw.trim_matches('/').contains('/');
        let segments: Vec<Segment> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(Segment::parse)
            .collect();

        if segments.is_empty() {
            return Err(BackupError::Pattern(format!("'{}' has no path segments", raw)));
        }

        Ok(Self { segments, anchored })
    }

    fn matches(&self, components: &[&str]) -> bool {
        if self.anchored {
            components.len() >= self.segments.len()
                && self
                    .segments
                    .iter()
                    .zip(components)
                    .all(|(segment, component)| segment.matches(component))
        } else {
            let segment = &self.segments[0];
            components.iter().any(|component| segment.matches(component))
        }
    }
}

/// Compiled set of exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    /// Compile patterns. Blank entries and `#` comments are ignored.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() || pattern.starts_with('#') {
                continue;
            }
            compiled.push(Pattern::parse(pattern)?);
        }
        Ok(Self { patterns: compiled })
    }

    /// Compile patterns read from files, one pattern per line.
    pub fn from_files<P: AsRef<Path>>(files: &[P]) -> Result<Self> {
        let mut lines = Vec::new();
        for file in files {
            let file = file.as_ref();
            let text = std::fs::read_to_string(file).map_err(|e| {
                BackupError::Config(format!("cannot read exclude file {}: {}", file.display(), e))
            })?;
            lines.extend(text.lines().map(str::to_string));
        }

        let set = Self::new(lines)?;
        tracing::info!("Loaded {} exclude patterns from {} files", set.len(), files.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl PathFilter for ExcludeSet {
    fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        self.patterns.iter().any(|p| p.matches(&components))
    }
}
