//! Request types for the backend endpoints. Response payloads are passed
//! through as JSON; the front end interprets them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A GitHub repository addressed as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// GitHub owner and repository names only use these characters, so they
    /// can be placed in a URL path as-is.
    fn is_valid_segment(s: &str) -> bool {
        !s.is_empty()
            && s != "."
            && s != ".."
            && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, name) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected owner/name, got '{}'", s))?;
        let name = name.trim_end_matches(".git");
        if !Self::is_valid_segment(owner) || !Self::is_valid_segment(name) {
            return Err(format!("invalid repository reference '{}'", s));
        }
        Ok(Self::new(owner, name))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Query options for the health score endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthQuery {
    pub analyze_code: bool,
    pub detailed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateDocsRequest {
    pub repo_data: Value,
    pub doc_type: String,
    pub file_analysis: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeneratedDocs {
    pub documentation: String,
}
