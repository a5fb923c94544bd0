//! Storage keys for unique-job lock sets.

use std::fmt;

use crate::error::Result;
use crate::unique_job::LockScope;

const BASE: &str = "uniqueness";
const SEPARATOR: &str = ":";

/// The key of the sorted set grouping locks of similar jobs.
///
/// Segments are normally `[backend, queue]`. With [`LockScope::Queue`] every
/// segment is kept; with [`LockScope::Systemwide`] the trailing (queue)
/// segment is dropped so one set covers the whole backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDigest {
    namespace: Option<String>,
    segments: Vec<String>,
    across: LockScope,
}

impl LockDigest {
    /// Create a digest. Segments are trimmed and lower-cased.
    pub fn new<I, S>(namespace: Option<&str>, segments: I, across: LockScope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            namespace: namespace.map(str::to_string),
            segments: segments
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect(),
            across,
        }
    }

    /// Create a digest from an unvalidated scope name.
    pub fn parse<I, S>(namespace: Option<&str>, segments: I, across: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::new(namespace, segments, across.parse()?))
    }

    /// The uniqueness scope this digest was built for.
    pub fn across(&self) -> LockScope {
        self.across
    }
}

impl fmt::Display for LockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kept = match self.across {
            LockScope::Queue => self.segments.len(),
            LockScope::Systemwide => self.segments.len().saturating_sub(1),
        };

        let parts: Vec<&str> = self
            .namespace
            .as_deref()
            .into_iter()
            .chain(std::iter::once(BASE))
            .chain(self.segments[..kept].iter().map(String::as_str))
            .collect();

        f.write_str(&parts.join(SEPARATOR))
    }
}
