use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::FeedCache;
use crate::dispatcher::{CycleReport, Dispatcher};

/// Externally supplied feed addresses: a static list plus an optional file that is
/// re-read every cycle.
#[derive(Debug, Clone, Default)]
pub struct SeedList {
    pub feeds: Vec<String>,
    pub file: Option<PathBuf>,
}

impl SeedList {
    pub fn load(&self) -> Vec<String> {
        let mut feeds = self.feeds.clone();
        if let Some(path) = &self.file {
            feeds.extend(load_seed_file(path));
        }
        feeds
    }
}

/// Read one feed address per line, skipping blank lines and `#` comments.
/// A missing file is an empty list.
pub fn load_seed_file(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_seed_list(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No seed file at {}", path.display());
            Vec::new()
        }
        Err(e) => {
            warn!("Failed to read seed file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

pub fn parse_seed_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Union of cached feeds, registered subscriptions and seeds, sorted.
pub async fn working_set(cache: &FeedCache, seeds: &SeedList) -> Vec<String> {
    let mut feeds = BTreeSet::new();

    match cache.keys().await {
        Ok(keys) => feeds.extend(keys),
        Err(e) => error!("Failed to list cached feeds: {}", e),
    }
    match cache.subscriptions().await {
        Ok(subscriptions) => feeds.extend(subscriptions),
        Err(e) => error!("Failed to list subscriptions: {}", e),
    }
    feeds.extend(seeds.load());

    feeds.into_iter().collect()
}

pub struct Poller {
    dispatcher: Dispatcher,
    seeds: SeedList,
    frequency: Duration,
    max_concurrency: usize,
    trigger: Arc<Notify>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

impl Poller {
    pub fn new(
        dispatcher: Dispatcher,
        seeds: SeedList,
        frequency: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            dispatcher,
            seeds,
            frequency,
            max_concurrency,
            trigger: Arc::new(Notify::new()),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    pub fn control(&self) -> PollerControl {
        PollerControl {
            trigger: self.trigger.clone(),
            last_report: self.last_report.clone(),
        }
    }

    fn cache(&self) -> &FeedCache {
        self.dispatcher.pipeline().cache()
    }

    /// Run one cycle over the current working set.
    pub async fn poll(&self) -> CycleReport {
        let feeds = working_set(self.cache(), &self.seeds).await;
        info!("Polling {} feeds", feeds.len());

        let report = self.dispatcher.run(feeds, self.max_concurrency).await;
        *self.last_report.write().await = Some(report.clone());
        report
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    /// Start the recurring job: poll now, then every `frequency` or when triggered.
    pub fn spawn(self) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let control = self.control();
        let cache = self.cache().clone();

        let task = tokio::spawn(async move {
            info!("Starting feed poller (every {:?})", self.frequency);
            loop {
                self.poll().await;

                tokio::select! {
                    _ = tokio::time::sleep(self.frequency) => {
                        info!("Starting scheduled feed poll");
                    }
                    _ = self.trigger.notified() => {
                        info!("Starting requested feed poll");
                    }
                    _ = shutdown_rx.changed() => break,
                }

                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!("Feed poller stopped");
        });

        PollerHandle {
            shutdown: shutdown_tx,
            task,
            cache,
            control,
        }
    }
}

/// Cloneable access to a running poller.
#[derive(Clone)]
pub struct PollerControl {
    trigger: Arc<Notify>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

impl PollerControl {
    /// Ask for a poll now. Has no effect on a cycle already running beyond
    /// starting the next one as soon as it finishes.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }
}

pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    cache: FeedCache,
    control: PollerControl,
}

impl PollerHandle {
    pub fn control(&self) -> PollerControl {
        self.control.clone()
    }

    pub fn trigger(&self) {
        self.control.trigger();
    }

    /// Stop polling, wait for an in-flight cycle to finish, then close the cache.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Feed poller task failed: {}", e);
        }
        self.cache.close().await;
        info!("Feed cache closed");
    }
}
