//! Charm reference parsing.
//!
//! Accepted shapes:
//! - `cs:bionic/glance-301`, `cs:~owner/xenial/glance-12`, `cs:glance`
//! - bare names: `glance`, `glance-7`
//! - local charms: `local:/tmp/glance-build`, `local:xenial/glance-3`,
//!   `/srv/charms/glance`, `./glance`
//!
//! Parsing is total. Malformed input degrades to a catalogued reference
//! whose name is the raw input.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a charm comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharmSource {
    /// Published in the remote catalog.
    Catalog,
    /// A filesystem path or an explicitly local charm.
    Local,
}

/// A parsed charm reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmRef {
    pub source: CharmSource,
    pub series: Option<String>,
    pub name: String,
    pub revision: Option<u32>,
}

impl CharmRef {
    /// Parse a charm reference. Never fails.
    pub fn parse(input: &str) -> Self {
        match Self::try_parse(input) {
            Some(parsed) => parsed,
            None => {
                warn!(reference = %input, "unable to parse charm reference");
                Self {
                    source: CharmSource::Catalog,
                    series: None,
                    name: input.to_string(),
                    revision: None,
                }
            }
        }
    }

    fn try_parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        if is_path(trimmed) {
            return Some(Self::local_path(trimmed));
        }

        let (source, rest) = match trimmed.split_once(':') {
            Some(("local", rest)) => (CharmSource::Local, rest),
            Some(("cs" | "ch", rest)) => (CharmSource::Catalog, rest),
            Some(_) => return None,
            None => (CharmSource::Catalog, trimmed),
        };

        if source == CharmSource::Local && is_path(rest) {
            return Some(Self::local_path(rest));
        }

        let segments: Vec<&str> = rest.split('/').collect();
        let last = *segments.last()?;
        if last.is_empty() {
            return None;
        }

        // `~owner/series/name` keeps the series in the second-to-last slot.
        let series = match segments.len() {
            0 | 1 => None,
            n => {
                let candidate = segments[n - 2];
                if candidate.is_empty() || candidate.starts_with('~') {
                    None
                } else {
                    Some(candidate.to_string())
                }
            }
        };

        let (name, revision) = split_revision(last);
        if name.is_empty() {
            return None;
        }

        Some(Self {
            source,
            series,
            name: name.to_string(),
            revision,
        })
    }

    fn local_path(path: &str) -> Self {
        Self {
            source: CharmSource::Local,
            series: None,
            name: path.to_string(),
            revision: None,
        }
    }

    pub fn is_catalogued(&self) -> bool {
        self.source == CharmSource::Catalog
    }

    /// Same charm, pinned to `revision`.
    pub fn at_revision(&self, revision: u32) -> Self {
        Self {
            revision: Some(revision),
            ..self.clone()
        }
    }
}

impl fmt::Display for CharmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            CharmSource::Local => write!(f, "local:")?,
            CharmSource::Catalog => write!(f, "cs:")?,
        }
        if let Some(series) = &self.series {
            write!(f, "{series}/")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(revision) = self.revision {
            write!(f, "-{revision}")?;
        }
        Ok(())
    }
}

fn is_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with("./") || s.starts_with("../") || s.starts_with('~')
}

/// Split `glance-301` into (`glance`, Some(301)). A trailing segment that
/// is not a plain integer stays part of the name.
fn split_revision(segment: &str) -> (&str, Option<u32>) {
    match segment.rsplit_once('-') {
        Some((name, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
            match rev.parse::<u32>() {
                Ok(revision) => (name, Some(revision)),
                Err(_) => (segment, None),
            }
        }
        _ => (segment, None),
    }
}
