use crate::SluiceError;
use std::fmt;
use std::str::FromStr;

/// What a work unit fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// One page of keyword search results
    SearchPage,
    /// A single post
    PostDetail,
    /// One page of comments under a post
    CommentPage,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchPage => "search-page",
            Self::PostDetail => "post-detail",
            Self::CommentPage => "comment-page",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search-page" | "search" => Ok(Self::SearchPage),
            "post-detail" | "post" => Ok(Self::PostDetail),
            "comment-page" | "comments" => Ok(Self::CommentPage),
            other => Err(SluiceError::InvalidUnit(format!(
                "unknown work kind '{}'",
                other
            ))),
        }
    }
}

/// One schedulable item of scraping work
///
/// Only `attempt` changes after construction; it starts at 1 and increments
/// each time the unit is retried or requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Externally meaningful id (post id, keyword page, ...)
    pub id: String,
    pub kind: WorkKind,
    pub payload: String,
    pub attempt: u32,
    /// Lower values are dispatched first
    pub priority: u32,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, kind: WorkKind, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
            attempt: 1,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The same unit, one attempt further along
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }

    /// The same unit as a fresh submission
    pub fn resubmitted(mut self) -> Self {
        self.attempt = 1;
        self
    }

    /// Parses `<kind> <id> [payload]`
    pub fn from_line(line: &str) -> Result<Self, SluiceError> {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let kind = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SluiceError::InvalidUnit("empty line".to_string()))?;
        let id = parts
            .next()
            .ok_or_else(|| SluiceError::InvalidUnit(format!("missing id in '{}'", line)))?;
        let payload = parts.next().unwrap_or("").trim();
        Ok(Self::new(id, kind.parse()?, payload))
    }
}

/// Parses a units file, one unit per line
///
/// Blank lines and lines starting with `#` are skipped.
pub fn parse_units(text: &str) -> Result<Vec<WorkUnit>, SluiceError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkUnit::from_line)
        .collect()
}
