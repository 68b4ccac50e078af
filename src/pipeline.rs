use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::cache::{CacheEntry, FeedCache};
use crate::diff;
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::parser;

/// Pipeline stage a feed failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CacheCheck,
    Fetching,
    Storing,
    /// The pipeline task panicked or was cancelled
    Unknown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CacheCheck => "cache check",
            Stage::Fetching => "fetching",
            Stage::Storing => "storing",
            Stage::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How one feed's pass through the pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeedOutcome {
    /// Cache entry younger than the freshness window; no request made
    Fresh,
    /// Server answered 304
    NotModified,
    /// First successful fetch, stored without publishing
    Baseline { entries: usize },
    /// Stored and published `events` new entries (possibly zero)
    Published { events: usize },
    /// Fetch succeeded but yielded no entries; cache left untouched
    Empty,
    Failed { stage: Stage, error: String },
}

impl FeedOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FeedOutcome::Failed { .. })
    }
}

/// Drives a single feed from cache check to publish.
pub struct FeedPipeline {
    cache: FeedCache,
    fetcher: Fetcher,
    bus: EventBus,
    max_age: Duration,
}

impl FeedPipeline {
    pub fn new(cache: FeedCache, fetcher: Fetcher, bus: EventBus, max_age: Duration) -> Self {
        Self {
            cache,
            fetcher,
            bus,
            max_age,
        }
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    /// Run the pipeline for `feed_id`. Errors are logged and reported in the outcome.
    pub async fn process(&self, feed_id: &str) -> FeedOutcome {
        let outcome = self.run(feed_id).await;
        if let FeedOutcome::Failed { stage, error } = &outcome {
            error!(feed = %feed_id, stage = %stage, error = %error, "Feed pipeline failed");
        }
        outcome
    }

    async fn run(&self, feed_id: &str) -> FeedOutcome {
        // Held until the new entry is stored
        let _guard = self.cache.lock(feed_id).await;

        let previous = match self.cache.get(feed_id).await {
            Ok(previous) => previous,
            Err(e) => return failed(Stage::CacheCheck, e),
        };

        if let Some(entry) = &previous {
            if entry.is_fresh_at(Utc::now(), self.max_age) {
                debug!(feed = %feed_id, "Using cached feed");
                return FeedOutcome::Fresh;
            }
        }

        let modified_since = previous.as_ref().map(CacheEntry::modified_since);
        let (body, last_modified) = match self.fetcher.fetch(feed_id, modified_since).await {
            Ok(FetchOutcome::Unchanged) => return FeedOutcome::NotModified,
            Ok(FetchOutcome::Fetched {
                body,
                last_modified,
            }) => (body, last_modified),
            Err(e) => return failed(Stage::Fetching, e),
        };

        let feed = parser::parse(&body);
        if let Some(reason) = &feed.degraded {
            warn!(
                feed = %feed_id,
                entries = feed.entries.len(),
                reason = %reason,
                "Feed parsed leniently"
            );
        }

        let events = diff::diff(previous.as_ref().map(|e| &e.feed), &feed, feed_id);

        if feed.is_empty() {
            if previous.is_none() {
                warn!(feed = %feed_id, "Feed contains no entries");
            }
            return FeedOutcome::Empty;
        }

        let entry = CacheEntry {
            fetched_at: Utc::now(),
            last_modified,
            feed,
        };
        if let Err(e) = self.cache.put_entry(feed_id, &entry).await {
            return failed(Stage::Storing, e);
        }

        if previous.is_none() {
            info!(
                feed = %feed_id,
                entries = entry.feed.entries.len(),
                "Stored baseline for new feed"
            );
            return FeedOutcome::Baseline {
                entries: entry.feed.entries.len(),
            };
        }

        for event in &events {
            self.bus.publish_entry(event);
        }
        FeedOutcome::Published {
            events: events.len(),
        }
    }
}

fn failed(stage: Stage, error: impl fmt::Display) -> FeedOutcome {
    FeedOutcome::Failed {
        stage,
        error: error.to_string(),
    }
}
