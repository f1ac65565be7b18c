use std::io::Write;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::HttpOutputConfig;

use super::{FeedItem, Feeder};

/// POSTs each document as one NDJSON line.
pub struct HttpFeeder {
    client: reqwest::Client,
    cfg: HttpOutputConfig,
}

impl HttpFeeder {
    pub fn new(cfg: HttpOutputConfig) -> Result<Self> {
        if cfg.address.is_empty() {
            bail!("http address is required");
        }
        compress(&[], &cfg.compression)?;

        let mut headers = HeaderMap::new();
        for (k, v) in &cfg.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .with_context(|| format!("invalid header name {k:?}"))?;
            let value = HeaderValue::from_str(v)
                .with_context(|| format!("invalid value for header {k:?}"))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .default_headers(headers)
            .build()
            .context("building HTTP client")?;

        Ok(Self { client, cfg })
    }
}

impl Feeder for HttpFeeder {
    fn name(&self) -> &str {
        "http"
    }

    async fn feed(&self, item: FeedItem) -> Result<()> {
        let mut buf = item.to_json_line()?;
        buf.push(b'\n');
        let raw_len = buf.len();

        let body = compress(&buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .header("X-Source", &*item.source)
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in item.tags.iter() {
            request = request.header(format!("X-Tag-{k}"), v.as_str());
        }

        let resp = request.send().await.context("sending flow document")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP feed unexpected status: {status}");
        }

        tracing::trace!(bytes = raw_len, "fed flow document via HTTP");

        Ok(())
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}
