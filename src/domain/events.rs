use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::infrastructure::publisher::OutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Created,
    Updated,
    Deleted,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Created => "created",
            ChangeReason::Updated => "updated",
            ChangeReason::Deleted => "deleted",
        }
    }
}

/// Comment lifecycle notification. Every change is delivered, so these go
/// through a preserve-all notifier keyed by comment id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub comment_id: i64,
    pub content_id: i64,
    pub author_id: i64,
    pub parent_id: Option<i64>,
    pub text: Option<String>,
    pub reason: ChangeReason,
    pub occurred_at: DateTime<Utc>,
}

impl OutboundEvent for CommentEvent {
    fn event_type(&self) -> &'static str {
        match self.reason {
            ChangeReason::Created => "comment_created",
            ChangeReason::Updated => "comment_updated",
            ChangeReason::Deleted => "comment_deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Upvote,
    Downvote,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoteKey {
    pub content_id: i64,
    pub user_id: i64,
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_id, self.user_id)
    }
}

/// Latest vote of one user on one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub content_id: i64,
    pub user_id: i64,
    pub vote: VoteKind,
    pub reason: ChangeReason,
}

impl VoteEvent {
    pub fn key(&self) -> VoteKey {
        VoteKey {
            content_id: self.content_id,
            user_id: self.user_id,
        }
    }
}

impl OutboundEvent for VoteEvent {
    fn event_type(&self) -> &'static str {
        "vote_changed"
    }
}

/// Absolute number of comments on a content item, read from storage when the
/// change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCommentsCount {
    pub content_id: i64,
    pub comments_count: i64,
}

impl OutboundEvent for ContentCommentsCount {
    fn event_type(&self) -> &'static str {
        "content_comments_count"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommentsCount {
    pub user_id: i64,
    pub comments_count: i64,
}

impl OutboundEvent for UserCommentsCount {
    fn event_type(&self) -> &'static str {
        "user_comments_count"
    }
}

/// Absolute engagement counters of a content item. Absent fields did not
/// change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStatsChanged {
    pub content_id: i64,
    #[serde(default)]
    pub likes: Option<i64>,
    #[serde(default)]
    pub dislikes: Option<i64>,
    #[serde(default)]
    pub shares: Option<i64>,
    #[serde(default)]
    pub listens: Option<i64>,
}

impl OutboundEvent for ContentStatsChanged {
    fn event_type(&self) -> &'static str {
        "content_stats_changed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Creator,
    User,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorStatus {
    Pending,
    Active,
    Suspended,
    Banned,
}

impl CreatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatorStatus::Pending => "pending",
            CreatorStatus::Active => "active",
            CreatorStatus::Suspended => "suspended",
            CreatorStatus::Banned => "banned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorStatusEvent {
    pub creator_id: i64,
    pub entity: EntityKind,
    pub status: CreatorStatus,
    pub reason: ChangeReason,
}

impl OutboundEvent for CreatorStatusEvent {
    fn event_type(&self) -> &'static str {
        "creator_status_changed"
    }
}
