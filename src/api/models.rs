//! Resource shapes exchanged with the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_ext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteType {
    Upvote,
    Downvote,
}

impl VoteType {
    /// Contribution of one vote of this type to a score.
    pub fn weight(self) -> i64 {
        match self {
            VoteType::Upvote => 1,
            VoteType::Downvote => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    Post,
    Comment,
}

impl TargetType {
    pub(crate) fn collection(self) -> &'static str {
        match self {
            TargetType::Post => "posts",
            TargetType::Comment => "comments",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub author_username: String,
    pub subreddit_id: i64,
    #[serde(default)]
    pub subreddit_name: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub upvotes: i64,
    #[serde(default)]
    pub downvotes: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub user_vote: Option<VoteType>,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub subreddit_id: i64,
}

impl NewPost {
    pub fn text(subreddit_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: Some(content.into()),
            url: None,
            subreddit_id,
        }
    }

    pub fn link(subreddit_id: i64, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: None,
            url: Some(url.into()),
            subreddit_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub content: String,
    pub author_username: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub user_vote: Option<VoteType>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

impl NewComment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            parent_id: None,
        }
    }

    #[must_use]
    pub fn reply_to(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subreddit {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_count: i64,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Body of `POST /{posts|comments}/{id}/vote`. `None` removes the vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub vote_type: Option<VoteType>,
}

/// The server's authoritative view of a target after a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub target_id: i64,
    pub target_type: TargetType,
    pub new_score: i64,
    #[serde(default)]
    pub user_vote: Option<VoteType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub karma: i64,
    #[serde(default)]
    pub banned: bool,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Results of `GET /search`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub subreddits: Vec<Subreddit>,
    #[serde(default)]
    pub users: Vec<UserProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Ban length in days; `None` bans permanently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
}
