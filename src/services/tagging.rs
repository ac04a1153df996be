//! Path-derived tags
//!
//! The directories a file was found in are usually the best description a
//! personal archive has: `Projects/Site/logo.png` yields `projects` and
//! `site`. Both `/` and `\` separate segments so that paths recorded on
//! Windows machines tag the same way.

use std::collections::{BTreeSet, HashSet};

/// Root-ish directory names that carry no meaning as tags
pub const DEFAULT_STOPWORDS: &[&str] = &["users", "home", "volumes", "mnt", "media"];

/// Tag extractor with a case-insensitive stopword list
#[derive(Debug, Clone)]
pub struct TagExtractor {
    stopwords: HashSet<String>,
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_STOPWORDS.iter().copied())
    }
}

impl TagExtractor {
    pub fn new<I, S>(stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stopwords: stopwords
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Tags for the directories of `path`; the file name is never a tag
    pub fn extract(&self, path: &str) -> BTreeSet<String> {
        let mut segments: Vec<&str> = path.split(['/', '\\']).collect();
        segments.pop();

        segments
            .into_iter()
            .filter_map(|segment| self.normalize(segment))
            .collect()
    }

    /// Normalize user-supplied tags with the same rules as path segments
    pub fn normalize_all<I, S>(&self, tags: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter()
            .filter_map(|tag| self.normalize(tag.as_ref()))
            .collect()
    }

    fn normalize(&self, segment: &str) -> Option<String> {
        let tag = segment.trim().to_lowercase();
        if tag.is_empty() || tag == "." || tag == ".." || is_drive_root(&tag) {
            return None;
        }
        if self.stopwords.contains(&tag) {
            return None;
        }
        Some(tag)
    }
}

/// `c:` and friends
fn is_drive_root(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Convenience wrapper for one-off extraction
pub fn extract_path_tags<S: AsRef<str>>(path: &str, stopwords: &[S]) -> BTreeSet<String> {
    TagExtractor::new(stopwords.iter().map(|s| s.as_ref())).extract(path)
}
