pub mod http;
pub mod stdout;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::value::RawValue;

use crate::clock::unix_millis;
use crate::config::{OutputConfig, OutputKind};

pub use self::http::HttpFeeder;
pub use self::stdout::StdoutFeeder;

/// One serialized flow document plus its routing metadata.
#[derive(Debug, Clone)]
pub struct FeedItem {
    /// Logical source name.
    pub source: Arc<str>,
    /// User tags plus the `host` tag.
    pub tags: Arc<BTreeMap<String, String>>,
    /// JSON-encoded flow document.
    pub body: String,
    /// Flush time.
    pub time: SystemTime,
}

/// Line format shared by the stdout and HTTP feeders.
#[derive(Serialize)]
struct Envelope<'a> {
    source: &'a str,
    tags: &'a BTreeMap<String, String>,
    time_ms: i64,
    flow: &'a RawValue,
}

impl FeedItem {
    /// Encodes the item as a single JSON object without a trailing newline.
    pub fn to_json_line(&self) -> Result<Vec<u8>> {
        let flow: &RawValue =
            serde_json::from_str(&self.body).context("flow body is not valid JSON")?;
        let envelope = Envelope {
            source: &self.source,
            tags: &self.tags,
            time_ms: unix_millis(self.time),
            flow,
        };
        serde_json::to_vec(&envelope).context("serializing feed envelope")
    }
}

/// Downstream sink for flushed documents.
pub trait Feeder: Send + Sync + 'static {
    /// Returns the feeder's name for logging.
    fn name(&self) -> &str;

    /// Delivers one document. Errors are reported, never retried.
    fn feed(&self, item: FeedItem) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Enum dispatch over the configured output.
pub enum Output {
    Stdout(StdoutFeeder),
    Http(HttpFeeder),
}

impl Output {
    /// Builds the feeder selected by `cfg`.
    pub fn from_config(cfg: &OutputConfig) -> Result<Self> {
        match cfg.kind {
            OutputKind::Stdout => Ok(Self::Stdout(StdoutFeeder::new())),
            OutputKind::Http => Ok(Self::Http(HttpFeeder::new(cfg.http.clone())?)),
        }
    }
}

impl Feeder for Output {
    fn name(&self) -> &str {
        match self {
            Self::Stdout(f) => f.name(),
            Self::Http(f) => f.name(),
        }
    }

    async fn feed(&self, item: FeedItem) -> Result<()> {
        match self {
            Self::Stdout(f) => f.feed(item).await,
            Self::Http(f) => f.feed(item).await,
        }
    }
}
