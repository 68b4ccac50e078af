use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::parser::ParsedFeed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewEntryEvent {
    pub topic: String,
    pub title: String,
    pub link: String,
}

/// Topic that new entries of `feed_id` are published on.
pub fn topic_for(feed_id: &str) -> String {
    format!("feed.{}", feed_id)
}

/// Find entries of `current` that were not in `previous`.
///
/// Entries are identified by their exact title. Events come out oldest first,
/// assuming the feed lists its newest entry first. No previous snapshot means
/// this fetch is the baseline and yields nothing.
pub fn diff(
    previous: Option<&ParsedFeed>,
    current: &ParsedFeed,
    feed_id: &str,
) -> Vec<NewEntryEvent> {
    let Some(previous) = previous else {
        return Vec::new();
    };

    if current.entries.is_empty() {
        warn!(feed = %feed_id, "Feed contains no entries");
        return Vec::new();
    }

    if let (Some(newest), Some(previous_newest)) = (current.newest_title(), previous.newest_title())
    {
        if newest == previous_newest {
            return Vec::new();
        }
    }

    let seen: HashSet<&str> = previous.entries.iter().map(|e| e.title.as_str()).collect();
    let topic = topic_for(feed_id);

    current
        .entries
        .iter()
        .rev()
        .filter(|entry| !seen.contains(entry.title.as_str()))
        .map(|entry| {
            info!(feed = %feed_id, title = %entry.title, "New feed entry found");
            NewEntryEvent {
                topic: topic.clone(),
                title: entry.title.clone(),
                link: entry.link.clone().unwrap_or_else(|| feed_id.to_string()),
            }
        })
        .collect()
}
