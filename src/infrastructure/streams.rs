use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    ChangeReason, CommentEvent, ContentCommentsCount, ContentStatsChanged, CreatorStatusEvent,
    EntityKind, SetCounter, StatsDelta, StatusDelta, UserCommentsCount, VoteEvent, VoteKey,
};
use crate::infrastructure::aggregator::AggregationMode;
use crate::infrastructure::batch_mapper::DeltaMapping;
use crate::infrastructure::codec::Encoding;
use crate::infrastructure::error::ConfigError;
use crate::infrastructure::metrics::PipelineMetrics;
use crate::infrastructure::notifier::{Notifier, NotifierConfig};
use crate::infrastructure::publisher::BrokerPublisher;
use crate::infrastructure::shutdown::ShutdownManager;

pub const COMMENTS_TOPIC: &str = "comments";
pub const VOTES_TOPIC: &str = "votes";
pub const CONTENT_COMMENTS_COUNT_TOPIC: &str = "content-comments-count";
pub const USER_COMMENTS_COUNT_TOPIC: &str = "user-comments-count";
pub const CONTENT_STATS_TOPIC: &str = "content-stats";
pub const CREATOR_STATUS_TOPIC: &str = "creator-status";

/// `prefix.base`, or just `base` when no prefix is configured.
pub fn topic_name(prefix: &str, base: &str) -> String {
    if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{}.{}", prefix, base)
    }
}

/// Sets `contents.comments_count` to the latest reported total.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentCommentsCounterMapping {
    pub encoding: Encoding,
}

impl DeltaMapping for ContentCommentsCounterMapping {
    type Event = ContentCommentsCount;
    type Key = i64;
    type Delta = SetCounter;

    fn name(&self) -> &str {
        "content_comments_count"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn key(&self, event: &ContentCommentsCount) -> i64 {
        event.content_id
    }

    fn fold(&self, _current: Option<SetCounter>, event: ContentCommentsCount) -> SetCounter {
        SetCounter {
            value: event.comments_count,
        }
    }
}

/// Sets `users.comments_count` to the latest reported total.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserCommentsCounterMapping {
    pub encoding: Encoding,
}

impl DeltaMapping for UserCommentsCounterMapping {
    type Event = UserCommentsCount;
    type Key = i64;
    type Delta = SetCounter;

    fn name(&self) -> &str {
        "user_comments_count"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn key(&self, event: &UserCommentsCount) -> i64 {
        event.user_id
    }

    fn fold(&self, _current: Option<SetCounter>, event: UserCommentsCount) -> SetCounter {
        SetCounter {
            value: event.comments_count,
        }
    }
}

/// Keeps the newest value of each engagement column seen for a content item.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentStatsMapping {
    pub encoding: Encoding,
}

impl DeltaMapping for ContentStatsMapping {
    type Event = ContentStatsChanged;
    type Key = i64;
    type Delta = StatsDelta;

    fn name(&self) -> &str {
        "content_stats"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn accepts(&self, event: &ContentStatsChanged) -> bool {
        event.likes.is_some()
            || event.dislikes.is_some()
            || event.shares.is_some()
            || event.listens.is_some()
    }

    fn key(&self, event: &ContentStatsChanged) -> i64 {
        event.content_id
    }

    fn fold(&self, current: Option<StatsDelta>, event: ContentStatsChanged) -> StatsDelta {
        let mut delta = current.unwrap_or_default();
        delta.merge(&event);
        delta
    }
}

/// Only status updates of creator entities touch storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatorStatusMapping {
    pub encoding: Encoding,
}

impl DeltaMapping for CreatorStatusMapping {
    type Event = CreatorStatusEvent;
    type Key = i64;
    type Delta = StatusDelta;

    fn name(&self) -> &str {
        "creator_status"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn accepts(&self, event: &CreatorStatusEvent) -> bool {
        event.reason == ChangeReason::Updated && event.entity == EntityKind::Creator
    }

    fn key(&self, event: &CreatorStatusEvent) -> i64 {
        event.creator_id
    }

    fn fold(&self, _current: Option<StatusDelta>, event: CreatorStatusEvent) -> StatusDelta {
        StatusDelta {
            status: event.status,
        }
    }
}

/// The outbound notifiers of the service, one per stream.
pub struct ProducerNotifiers {
    pub comments: Arc<Notifier<i64, CommentEvent>>,
    pub votes: Arc<Notifier<VoteKey, VoteEvent>>,
    pub content_comments: Arc<Notifier<i64, ContentCommentsCount>>,
    pub user_comments: Arc<Notifier<i64, UserCommentsCount>>,
    pub content_stats: Arc<Notifier<i64, ContentStatsChanged>>,
    pub creator_status: Arc<Notifier<i64, CreatorStatusEvent>>,
}

impl ProducerNotifiers {
    /// Builds every notifier from `template`; only topic and mode differ
    /// between streams.
    pub fn new(
        template: &NotifierConfig,
        topic_prefix: &str,
        publisher: Arc<dyn BrokerPublisher>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        let config = |base: &str, mode: AggregationMode| NotifierConfig {
            topic: topic_name(topic_prefix, base),
            mode,
            ..template.clone()
        };

        Ok(Self {
            comments: Arc::new(Notifier::new(
                "comments",
                config(COMMENTS_TOPIC, AggregationMode::PreserveAll),
                publisher.clone(),
                metrics.clone(),
            )?),
            votes: Arc::new(Notifier::new(
                "votes",
                config(VOTES_TOPIC, AggregationMode::Coalesce),
                publisher.clone(),
                metrics.clone(),
            )?),
            content_comments: Arc::new(Notifier::new(
                "content_comments_count",
                config(CONTENT_COMMENTS_COUNT_TOPIC, AggregationMode::Coalesce),
                publisher.clone(),
                metrics.clone(),
            )?),
            user_comments: Arc::new(Notifier::new(
                "user_comments_count",
                config(USER_COMMENTS_COUNT_TOPIC, AggregationMode::Coalesce),
                publisher.clone(),
                metrics.clone(),
            )?),
            content_stats: Arc::new(Notifier::new(
                "content_stats",
                config(CONTENT_STATS_TOPIC, AggregationMode::Coalesce),
                publisher.clone(),
                metrics.clone(),
            )?),
            creator_status: Arc::new(Notifier::new(
                "creator_status",
                config(CREATOR_STATUS_TOPIC, AggregationMode::Coalesce),
                publisher,
                metrics,
            )?),
        })
    }

    pub fn start(&self, shutdown: &CancellationToken) {
        self.comments.start(shutdown);
        self.votes.start(shutdown);
        self.content_comments.start(shutdown);
        self.user_comments.start(shutdown);
        self.content_stats.start(shutdown);
        self.creator_status.start(shutdown);
    }

    /// Registers every notifier so shutdown closes it with a final flush.
    pub fn register(&self, manager: &ShutdownManager) {
        manager.register(self.comments.clone());
        manager.register(self.votes.clone());
        manager.register(self.content_comments.clone());
        manager.register(self.user_comments.clone());
        manager.register(self.content_stats.clone());
        manager.register(self.creator_status.clone());
    }

    pub fn comment_changed(&self, event: CommentEvent) {
        self.comments.enqueue(event.comment_id, event);
    }

    pub fn vote_changed(&self, event: VoteEvent) {
        self.votes.enqueue(event.key(), event);
    }

    pub fn content_comments_counted(&self, event: ContentCommentsCount) {
        self.content_comments.enqueue(event.content_id, event);
    }

    pub fn user_comments_counted(&self, event: UserCommentsCount) {
        self.user_comments.enqueue(event.user_id, event);
    }

    pub fn content_stats_changed(&self, event: ContentStatsChanged) {
        self.content_stats.enqueue(event.content_id, event);
    }

    pub fn creator_status_changed(&self, event: CreatorStatusEvent) {
        self.creator_status.enqueue(event.creator_id, event);
    }

    pub fn pending(&self) -> usize {
        self.comments.pending()
            + self.votes.pending()
            + self.content_comments.pending()
            + self.user_comments.pending()
            + self.content_stats.pending()
            + self.creator_status.pending()
    }
}
