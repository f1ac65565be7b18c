use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use super::{FeedItem, Feeder};

/// Writes one JSON object per line to standard output.
#[derive(Debug, Default)]
pub struct StdoutFeeder {
    lock: tokio::sync::Mutex<()>,
}

impl StdoutFeeder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feeder for StdoutFeeder {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn feed(&self, item: FeedItem) -> Result<()> {
        let mut line = item.to_json_line()?;
        line.push(b'\n');

        // Serialize writers so concurrent lines never interleave.
        let _guard = self.lock.lock().await;
        let mut out = tokio::io::stdout();
        out.write_all(&line).await.context("writing to stdout")?;
        out.flush().await.context("flushing stdout")
    }
}
