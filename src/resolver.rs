//! URL to rate-limit-group resolution
//!
//! Endpoint groups share a quota policy. The resolver turns an arbitrary URL
//! into a short, stable group name: an api-path anchor takes precedence, then
//! literal segment mappings, then regex patterns in insertion order, and as a
//! last resort the canonicalized URL itself. The result is never empty.
//!
//! Query strings and fragments never influence the group.

use std::collections::HashMap;

use regex::Regex;
use url::Url;

use crate::error::{Error, Result};

/// Strips the query and fragment, leaving only scheme, authority and path.
pub fn canonicalize(url: &Url) -> Url {
    let mut canonical = url.clone();
    canonical.set_query(None);
    canonical.set_fragment(None);
    canonical
}

/// Maps URLs to rate-limit group names. Immutable after construction.
#[derive(Debug)]
pub struct GroupResolver {
    literal: HashMap<String, String>,
    literal_lower: HashMap<String, String>,
    patterns: Vec<(Regex, String)>,
    api_path_anchor: String,
}

impl Default for GroupResolver {
    fn default() -> Self {
        GroupResolver::builder().build()
    }
}

impl GroupResolver {
    pub fn builder() -> GroupResolverBuilder {
        GroupResolverBuilder::new()
    }

    /// Resolves a URL to its group name.
    pub fn resolve(&self, url: &Url) -> String {
        let segments: Vec<&str> = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        if !self.api_path_anchor.is_empty() {
            if let Some(found) = self.resolve_by_anchor(&segments) {
                return found;
            }
        }

        let path = segments.join("/");
        if let Some(found) = self.resolve_by_map(&path, &segments) {
            return found;
        }

        // Degenerate group: the canonicalized URL itself.
        canonicalize(url).to_string()
    }

    /// The path segment immediately following the last anchor occurrence.
    fn resolve_by_anchor(&self, segments: &[&str]) -> Option<String> {
        let last = segments
            .iter()
            .rposition(|s| *s == self.api_path_anchor)?;
        segments.get(last + 1).map(|s| s.to_string())
    }

    /// Literal lookups first (case-sensitive, then lowercased), then regex
    /// patterns in insertion order, against the whole path and each segment.
    fn resolve_by_map(&self, path: &str, segments: &[&str]) -> Option<String> {
        for candidate in std::iter::once(path).chain(segments.iter().copied()) {
            if let Some(group) = self.literal.get(candidate) {
                return Some(group.clone());
            }
            if let Some(group) = self.literal_lower.get(&candidate.to_lowercase()) {
                return Some(group.clone());
            }
        }

        for (pattern, group) in &self.patterns {
            if pattern.is_match(path) || segments.iter().any(|s| pattern.is_match(s)) {
                return Some(group.clone());
            }
        }

        None
    }
}

/// Builder for [`GroupResolver`].
#[derive(Debug, Default)]
pub struct GroupResolverBuilder {
    literal: HashMap<String, String>,
    patterns: Vec<(Regex, String)>,
    api_path_anchor: String,
}

impl GroupResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps an exact path or segment to a group.
    pub fn literal(mut self, from: impl Into<String>, group: impl Into<String>) -> Self {
        self.literal.insert(from.into(), group.into());
        self
    }

    /// Maps a regex pattern to a group. Patterns are tried in the order they
    /// were added; the first match wins.
    pub fn pattern(mut self, pattern: &str, group: impl Into<String>) -> Result<Self> {
        let compiled = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid group pattern {pattern:?}: {e}")))?;
        self.patterns.push((compiled, group.into()));
        Ok(self)
    }

    /// Sets the api-path anchor: the group name is the segment immediately
    /// after the anchor's last occurrence in the path.
    pub fn anchor(mut self, anchor: impl Into<String>) -> Self {
        self.api_path_anchor = anchor.into();
        self
    }

    pub fn build(self) -> GroupResolver {
        let literal_lower = self
            .literal
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        GroupResolver {
            literal: self.literal,
            literal_lower,
            patterns: self.patterns,
            api_path_anchor: self.api_path_anchor,
        }
    }
}
