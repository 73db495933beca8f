use crate::domain::events::{ContentStatsChanged, CreatorStatus};

/// `SET counter = value`. Counters travel as absolute values so coalescing
/// never double-counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCounter {
    pub value: i64,
}

/// Latest known value per engagement column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub likes: Option<i64>,
    pub dislikes: Option<i64>,
    pub shares: Option<i64>,
    pub listens: Option<i64>,
}

impl StatsDelta {
    /// Fields present in `newer` replace ours.
    pub fn merge(&mut self, newer: &ContentStatsChanged) {
        self.likes = newer.likes.or(self.likes);
        self.dislikes = newer.dislikes.or(self.dislikes);
        self.shares = newer.shares.or(self.shares);
        self.listens = newer.listens.or(self.listens);
    }

    pub fn columns(&self) -> Vec<(&'static str, i64)> {
        [
            ("likes_count", self.likes),
            ("dislikes_count", self.dislikes),
            ("shares_count", self.shares),
            ("listens_count", self.listens),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.map(|v| (column, v)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDelta {
    pub status: CreatorStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_fields_missing_from_newer_event() {
        let mut delta = StatsDelta::default();
        delta.merge(&ContentStatsChanged {
            content_id: 1,
            likes: Some(4),
            shares: Some(1),
            ..Default::default()
        });
        delta.merge(&ContentStatsChanged {
            content_id: 1,
            likes: Some(5),
            ..Default::default()
        });

        assert_eq!(delta.columns(), vec![("likes_count", 5), ("shares_count", 1)]);
    }

    #[test]
    fn test_empty_delta_has_no_columns() {
        assert!(StatsDelta::default().is_empty());
    }
}
