use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Number of fetch groups that may run at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Location of the feed cache store
    #[serde(default = "default_cache_url")]
    pub cache_url: String,
    /// Optional file with one feed address per line, re-read every cycle
    #[serde(default = "default_seed_file")]
    pub seed_file: Option<PathBuf>,
    /// Static seed addresses
    #[serde(default)]
    pub feeds: Vec<String>,
    /// Address of the status endpoint
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub poll: PollSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedSettings {
    /// Freshness window in seconds
    #[serde(default = "default_max_age")]
    pub max_age: u64,
    /// Per-fetch timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollSettings {
    /// Cycle interval in seconds
    #[serde(default = "default_frequency")]
    pub frequency: u64,
}

fn default_max_concurrency() -> usize {
    60
}

fn default_cache_url() -> String {
    "sqlite:feedwatch.db?mode=rwc".to_string()
}

fn default_seed_file() -> Option<PathBuf> {
    Some(PathBuf::from("feeds.txt"))
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_age() -> u64 {
    300
}

fn default_timeout() -> u64 {
    30
}

fn default_frequency() -> u64 {
    600
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            timeout: default_timeout(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            cache_url: default_cache_url(),
            seed_file: default_seed_file(),
            feeds: Vec::new(),
            listen: default_listen(),
            feed: FeedSettings::default(),
            poll: PollSettings::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.poll.frequency == 0 {
            anyhow::bail!("poll.frequency must be at least 1 second");
        }
        if self.feed.timeout == 0 {
            anyhow::bail!("feed.timeout must be at least 1 second");
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.feed.max_age)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.feed.timeout)
    }

    pub fn poll_frequency(&self) -> Duration {
        Duration::from_secs(self.poll.frequency)
    }
}
