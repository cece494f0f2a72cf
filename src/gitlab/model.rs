use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One merge request as returned by the GitLab list endpoints.
/// Immutable once fetched; the sync run owns it transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: i64,
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: MergeRequestState,
    pub author: Author,
    pub source_branch: String,
    pub target_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub web_url: String,
    #[serde(default)]
    pub labels: Option<Vec<Label>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestState {
    Opened,
    Merged,
    Closed,
    Locked,
}

impl MergeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Opened => "opened",
            MergeRequestState::Merged => "merged",
            MergeRequestState::Closed => "closed",
            MergeRequestState::Locked => "locked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub username: String,
}

/// GitLab returns labels either as bare strings or as objects with a `name`
/// field, depending on the endpoint and API version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Name(String),
    Object { name: String },
}

impl Label {
    pub fn name(&self) -> &str {
        match self {
            Label::Name(name) => name,
            Label::Object { name } => name,
        }
    }
}
