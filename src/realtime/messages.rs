//! Inbound payloads and their validation.
//!
//! Every message is decoded into a concrete shape chosen by the topic it
//! arrived on, then checked. Payloads that fail either step never reach a
//! handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::api::models::{TargetType, VoteType};
use crate::realtime::topics::TopicKind;
use crate::serde_ext;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("payload type could not be determined")]
    UnknownType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    /// Server-defined category such as `COMMENT_REPLY`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub actor_username: Option<String>,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostUpdate {
    pub post_id: i64,
    pub score: i64,
    pub comment_count: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub view_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentUpdate {
    pub comment_id: i64,
    pub post_id: i64,
    pub score: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KarmaUpdate {
    pub user_id: i64,
    pub change: i64,
    pub new_total: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteUpdate {
    pub target_id: i64,
    pub target_type: TargetType,
    /// The vote that triggered the update; `None` when one was removed.
    #[serde(default)]
    pub vote_type: Option<VoteType>,
    pub new_score: i64,
    #[serde(default)]
    pub user_vote: Option<VoteType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAnnouncement {
    #[serde(default)]
    pub id: Option<i64>,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Notification(Notification),
    PostUpdate(PostUpdate),
    CommentUpdate(CommentUpdate),
    KarmaUpdate(KarmaUpdate),
    VoteUpdate(VoteUpdate),
    Announcement(SystemAnnouncement),
}

impl RealtimeEvent {
    /// Decode `payload` as the shape `kind` carries. For
    /// [`TopicKind::Unknown`] the payload's `type` field picks the shape.
    pub fn decode(kind: TopicKind, payload: &str) -> Result<Self, DecodeError> {
        match kind {
            TopicKind::Notification => parse(payload).map(RealtimeEvent::Notification),
            TopicKind::Karma => parse(payload).map(RealtimeEvent::KarmaUpdate),
            TopicKind::Vote => parse(payload).map(RealtimeEvent::VoteUpdate),
            TopicKind::PostUpdate => parse(payload).map(RealtimeEvent::PostUpdate),
            TopicKind::CommentUpdate => parse(payload).map(RealtimeEvent::CommentUpdate),
            TopicKind::Announcement => parse(payload).map(RealtimeEvent::Announcement),
            TopicKind::Unknown => {
                let value: serde_json::Value = serde_json::from_str(payload)?;
                let embedded = value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .and_then(kind_for_type)
                    .ok_or(DecodeError::UnknownType)?;
                Self::decode(embedded, payload)
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            RealtimeEvent::Notification(_) => "notification",
            RealtimeEvent::PostUpdate(_) => "post update",
            RealtimeEvent::CommentUpdate(_) => "comment update",
            RealtimeEvent::KarmaUpdate(_) => "karma update",
            RealtimeEvent::VoteUpdate(_) => "vote update",
            RealtimeEvent::Announcement(_) => "announcement",
        }
    }
}

fn kind_for_type(name: &str) -> Option<TopicKind> {
    match name.to_ascii_uppercase().as_str() {
        "NOTIFICATION" => Some(TopicKind::Notification),
        "POST_UPDATE" => Some(TopicKind::PostUpdate),
        "COMMENT_UPDATE" => Some(TopicKind::CommentUpdate),
        "KARMA_UPDATE" => Some(TopicKind::Karma),
        "VOTE_UPDATE" => Some(TopicKind::Vote),
        "ANNOUNCEMENT" | "SYSTEM_ANNOUNCEMENT" => Some(TopicKind::Announcement),
        _ => None,
    }
}

fn parse<T: DeserializeOwned + Validate>(payload: &str) -> Result<T, DecodeError> {
    let message: T = serde_json::from_str(payload)?;
    message.validate().map_err(|reason| DecodeError::Invalid {
        kind: T::KIND,
        reason,
    })?;
    Ok(message)
}

trait Validate {
    const KIND: &'static str;

    fn validate(&self) -> Result<(), String>;
}

fn positive_id(name: &str, value: i64) -> Result<(), String> {
    if value > 0 {
        Ok(())
    } else {
        Err(format!("{name} must be a positive identifier, got {value}"))
    }
}

fn non_negative(name: &str, value: i64) -> Result<(), String> {
    if value >= 0 {
        Ok(())
    } else {
        Err(format!("{name} must not be negative, got {value}"))
    }
}

fn non_blank(name: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{name} must not be empty"))
    } else {
        Ok(())
    }
}

impl Validate for Notification {
    const KIND: &'static str = "notification";

    fn validate(&self) -> Result<(), String> {
        positive_id("id", self.id)?;
        non_blank("type", &self.kind)?;
        non_blank("message", &self.message)
    }
}

impl Validate for PostUpdate {
    const KIND: &'static str = "post update";

    fn validate(&self) -> Result<(), String> {
        positive_id("postId", self.post_id)?;
        non_negative("commentCount", self.comment_count)?;
        non_negative("upvotes", self.upvotes)?;
        non_negative("downvotes", self.downvotes)?;
        non_negative("viewCount", self.view_count)
    }
}

impl Validate for CommentUpdate {
    const KIND: &'static str = "comment update";

    fn validate(&self) -> Result<(), String> {
        positive_id("commentId", self.comment_id)?;
        positive_id("postId", self.post_id)
    }
}

impl Validate for KarmaUpdate {
    const KIND: &'static str = "karma update";

    fn validate(&self) -> Result<(), String> {
        positive_id("userId", self.user_id)
    }
}

impl Validate for VoteUpdate {
    const KIND: &'static str = "vote update";

    fn validate(&self) -> Result<(), String> {
        positive_id("targetId", self.target_id)
    }
}

impl Validate for SystemAnnouncement {
    const KIND: &'static str = "announcement";

    fn validate(&self) -> Result<(), String> {
        non_blank("title", &self.title)?;
        non_blank("message", &self.message)
    }
}
