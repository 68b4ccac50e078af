use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::pipeline::{FeedOutcome, FeedPipeline, Stage};

#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub feed_id: String,
    #[serde(flatten)]
    pub outcome: FeedOutcome,
}

/// Result of one dispatch over the working set.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub fresh: usize,
    pub not_modified: usize,
    pub baseline: usize,
    pub published: usize,
    pub empty: usize,
    pub failed: usize,
    /// Total new-entry events published
    pub events: usize,
}

impl CycleReport {
    pub fn summary(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        for report in &self.feeds {
            match &report.outcome {
                FeedOutcome::Fresh => summary.fresh += 1,
                FeedOutcome::NotModified => summary.not_modified += 1,
                FeedOutcome::Baseline { .. } => summary.baseline += 1,
                FeedOutcome::Published { events } => {
                    summary.published += 1;
                    summary.events += events;
                }
                FeedOutcome::Empty => summary.empty += 1,
                FeedOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    pub fn outcome(&self, feed_id: &str) -> Option<&FeedOutcome> {
        self.feeds
            .iter()
            .find(|r| r.feed_id == feed_id)
            .map(|r| &r.outcome)
    }
}

/// Split `feed_ids` into at most `max_concurrency` groups.
///
/// With no more feeds than slots every feed gets its own group; otherwise feed `i`
/// goes to group `i % max_concurrency`, so group sizes differ by at most one.
pub fn partition(feed_ids: Vec<String>, max_concurrency: usize) -> Vec<Vec<String>> {
    let slots = max_concurrency.max(1);

    if feed_ids.len() <= slots {
        return feed_ids.into_iter().map(|id| vec![id]).collect();
    }

    let mut groups = vec![Vec::new(); slots];
    for (i, id) in feed_ids.into_iter().enumerate() {
        groups[i % slots].push(id);
    }
    groups
}

/// Runs one worker per fetch group; feeds within a group go one after another.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<FeedPipeline>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<FeedPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &FeedPipeline {
        &self.pipeline
    }

    pub async fn run(&self, feed_ids: Vec<String>, max_concurrency: usize) -> CycleReport {
        let started_at = Utc::now();
        let total = feed_ids.len();
        let groups = partition(feed_ids, max_concurrency);
        info!("Dispatching {} feeds in {} groups", total, groups.len());

        let mut workers = JoinSet::new();
        for (index, group) in groups.into_iter().enumerate() {
            let pipeline = self.pipeline.clone();
            workers.spawn(async move {
                debug!(group = index, size = group.len(), "Fetch group started");
                let mut reports = Vec::with_capacity(group.len());
                for feed_id in group {
                    reports.push(run_isolated(pipeline.clone(), feed_id).await);
                }
                reports
            });
        }

        let mut feeds = Vec::with_capacity(total);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(reports) => feeds.extend(reports),
                Err(e) => error!(error = %e, "Fetch group worker failed"),
            }
        }

        let report = CycleReport {
            started_at,
            finished_at: Utc::now(),
            feeds,
        };
        let summary = report.summary();
        info!(
            fresh = summary.fresh,
            not_modified = summary.not_modified,
            baseline = summary.baseline,
            published = summary.published,
            empty = summary.empty,
            failed = summary.failed,
            events = summary.events,
            "Dispatch complete"
        );
        report
    }
}

/// Run one feed in its own task so a panic only costs that feed.
async fn run_isolated(pipeline: Arc<FeedPipeline>, feed_id: String) -> FeedReport {
    let id = feed_id.clone();
    let outcome = match tokio::spawn(async move { pipeline.process(&id).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(feed = %feed_id, error = %e, "Feed pipeline task aborted");
            FeedOutcome::Failed {
                stage: Stage::Unknown,
                error: e.to_string(),
            }
        }
    };
    FeedReport { feed_id, outcome }
}
