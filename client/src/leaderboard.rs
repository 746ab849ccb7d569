//! Live "best record per participant" aggregation over the chart feed
//!
//! The feed interleaves full snapshots with single records that may be
//! partial, duplicated or out of order. [`Leaderboard`] folds them into one
//! best record per participant per stage:
//!
//! - A snapshot replaces everything, after reducing its own rows to the best
//!   row per participant (the sender does not deduplicate).
//! - A single record replaces the participant's entry only when it is
//!   strictly better: lower score, or equal score and lower duration.
//!
//! A bounded window of raw records is kept alongside for display; it never
//! influences the aggregate, which is bounded only by participant count.

use log::debug;
use shared::{Category, FeedEvent, Record};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_RETENTION: usize = 500;

/// What an applied feed event did to the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardChange {
    /// A snapshot replaced every stage.
    Replaced,
    /// The participant's best record in this stage improved (or was created).
    Improved(Category),
    /// The record was no better than what the participant already had.
    Unchanged(Category),
}

impl BoardChange {
    /// Whether the ranked view of `category` may differ after this change.
    pub fn affects(&self, category: &Category) -> bool {
        match self {
            BoardChange::Replaced => true,
            BoardChange::Improved(changed) => changed == category,
            BoardChange::Unchanged(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Leaderboard {
    best: HashMap<Category, HashMap<String, Record>>,
    recent: VecDeque<Record>,
    retention: usize,
}

impl Leaderboard {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            best: HashMap::new(),
            recent: VecDeque::with_capacity(retention.min(DEFAULT_RETENTION)),
            retention,
        }
    }

    pub fn apply(&mut self, event: FeedEvent) -> BoardChange {
        match event {
            FeedEvent::Snapshot(rows) => {
                self.apply_snapshot(rows);
                BoardChange::Replaced
            }
            FeedEvent::Single(record) => {
                let category = record.category.clone();
                if self.apply_record(record) {
                    BoardChange::Improved(category)
                } else {
                    BoardChange::Unchanged(category)
                }
            }
        }
    }

    /// Discards all state and rebuilds it from `rows`.
    pub fn apply_snapshot(&mut self, rows: Vec<Record>) {
        self.best.clear();
        self.recent.clear();

        let row_count = rows.len();
        for row in rows {
            self.remember(row.clone());
            self.offer(row);
        }

        debug!(
            "Snapshot applied: {} rows, {} stages",
            row_count,
            self.best.len()
        );
    }

    /// Folds one record in. Returns true if it became the participant's best.
    pub fn apply_record(&mut self, record: Record) -> bool {
        self.remember(record.clone());
        self.offer(record)
    }

    fn offer(&mut self, record: Record) -> bool {
        let stage = self.best.entry(record.category.clone()).or_default();

        let improves = stage
            .get(&record.participant_id)
            .map_or(true, |current| record.is_better_than(current));

        if improves {
            stage.insert(record.participant_id.clone(), record);
        }
        improves
    }

    fn remember(&mut self, record: Record) {
        if self.retention == 0 {
            return;
        }
        self.recent.push_back(record);
        while self.recent.len() > self.retention {
            self.recent.pop_front();
        }
    }

    /// Best records of `category`, ascending by score then duration.
    ///
    /// Recomputed on every call; participant id orders exact ties so repeated
    /// queries with no new events yield the same sequence.
    pub fn ranked_view(&self, category: &Category) -> impl Iterator<Item = &Record> + '_ {
        let mut rows: Vec<&Record> = self
            .best
            .get(category)
            .map(|stage| stage.values().collect())
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            a.rank_key()
                .cmp(&b.rank_key())
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        rows.into_iter()
    }

    pub fn ranked(&self, category: &Category) -> Vec<Record> {
        self.ranked_view(category).cloned().collect()
    }

    pub fn best(&self, category: &Category, participant_id: &str) -> Option<&Record> {
        self.best
            .get(category)
            .and_then(|stage| stage.get(participant_id))
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> + '_ {
        self.best.keys()
    }

    pub fn participant_count(&self, category: &Category) -> usize {
        self.best.get(category).map_or(0, HashMap::len)
    }

    /// Most recent raw records, oldest first, at most `retention` of them.
    pub fn recent(&self) -> impl Iterator<Item = &Record> + '_ {
        self.recent.iter()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }
}

impl Default for Leaderboard {
    fn default() -> Self {
        Self::new()
    }
}
