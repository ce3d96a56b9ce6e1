//! Topic keys published by the broker.

use crate::realtime::types::Topic;

pub const ANNOUNCEMENTS: &str = "/topic/announcements";

/// Per-user queues. The broker routes them to the authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserQueue {
    Notifications,
    Karma,
    Votes,
    Posts,
    Comments,
}

impl UserQueue {
    pub const ALL: [UserQueue; 5] = [
        UserQueue::Notifications,
        UserQueue::Karma,
        UserQueue::Votes,
        UserQueue::Posts,
        UserQueue::Comments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserQueue::Notifications => "notifications",
            UserQueue::Karma => "karma",
            UserQueue::Votes => "votes",
            UserQueue::Posts => "posts",
            UserQueue::Comments => "comments",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|queue| queue.as_str() == name)
    }
}

pub fn user_queue(username: &str, queue: UserQueue) -> Topic {
    format!("/user/{username}/queue/{}", queue.as_str())
}

/// Topics tied to the signed-in principal, registered on every connect.
pub fn session_topics(username: &str) -> Vec<Topic> {
    UserQueue::ALL
        .into_iter()
        .map(|queue| user_queue(username, queue))
        .collect()
}

/// Score and counter updates for one post.
pub fn post(post_id: i64) -> Topic {
    format!("/topic/posts/{post_id}")
}

/// Comment activity on one post.
pub fn post_comments(post_id: i64) -> Topic {
    format!("/topic/posts/{post_id}/comments")
}

/// Post activity inside one subreddit.
pub fn subreddit(subreddit_id: i64) -> Topic {
    format!("/topic/subreddits/{subreddit_id}")
}

/// Which payload shape a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Notification,
    Karma,
    Vote,
    PostUpdate,
    CommentUpdate,
    Announcement,
    /// Not a known topic; the payload's own `type` field decides.
    Unknown,
}

impl TopicKind {
    pub fn classify(topic: &str) -> TopicKind {
        let segments: Vec<&str> = topic.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["user", user, "queue", queue] if !user.is_empty() => match UserQueue::parse(queue) {
                Some(UserQueue::Notifications) => TopicKind::Notification,
                Some(UserQueue::Karma) => TopicKind::Karma,
                Some(UserQueue::Votes) => TopicKind::Vote,
                Some(UserQueue::Posts) => TopicKind::PostUpdate,
                Some(UserQueue::Comments) => TopicKind::CommentUpdate,
                None => TopicKind::Unknown,
            },
            ["topic", "posts", id] if is_id(id) => TopicKind::PostUpdate,
            ["topic", "posts", id, "comments"] if is_id(id) => TopicKind::CommentUpdate,
            ["topic", "subreddits", id] if is_id(id) => TopicKind::PostUpdate,
            ["topic", "announcements"] => TopicKind::Announcement,
            _ => TopicKind::Unknown,
        }
    }
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
