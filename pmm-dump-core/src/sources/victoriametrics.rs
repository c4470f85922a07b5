//! The metric-store adapter (VictoriaMetrics-compatible).
//!
//! Reads go through the range-export endpoint, writes through the import
//! endpoint. Two wire encodings are supported: native (compact binary,
//! version-sensitive) and line-json (verbose, stable). The encoding is chosen
//! at export time and recorded in the archive metadata.

use crate::chunk::{ChunkDescriptor, SourceKind};
use crate::error::{DumpError, Result};
use crate::meta::VmDataFormat;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Selector applied when the caller provides none.
const MATCH_ALL: &str = "{__name__!=\"\"}";

/// Configuration of one metric-store adapter.
#[derive(Debug, Clone)]
pub struct VmSourceConfig {
    pub url: Url,
    pub credentials: Option<(String, Option<String>)>,
    /// Pre-resolved label-set predicates pushed into read requests.
    pub selectors: Vec<String>,
    pub data_format: VmDataFormat,
    /// Maximum bytes per import request for line-json writes. 0 disables.
    pub content_limit: u64,
}

/// Metric-store adapter.
pub struct VmSource {
    client: reqwest::Client,
    config: VmSourceConfig,
}

impl VmSource {
    /// Create the adapter. Native encoding cannot be combined with a content
    /// limit; that conflict is rejected here, before any I/O.
    pub fn new(client: reqwest::Client, config: VmSourceConfig) -> Result<Self> {
        if config.data_format.is_native() && config.content_limit > 0 {
            return Err(DumpError::Config {
                reason: "--vm-content-limit is not supported with the native data format".into(),
            });
        }
        Ok(Self { client, config })
    }

    /// Chunk file extension for the configured encoding.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        self.config.data_format.extension()
    }

    /// Partition `[start, end)` into windows of `window` length.
    ///
    /// The final chunk is truncated to end exactly at `end`; an empty range
    /// produces an empty plan.
    pub fn plan(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Duration,
    ) -> Vec<ChunkDescriptor> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5));
        let mut chunks = Vec::new();
        let mut cursor = start;
        let mut index = 0u32;
        while cursor < end {
            let next = std::cmp::min(cursor + window, end);
            chunks.push(ChunkDescriptor {
                source: SourceKind::VictoriaMetrics,
                index,
                start: Some(cursor),
                end: Some(next),
                row_offset: None,
                row_limit: None,
                extension: self.extension(),
            });
            cursor = next;
            index += 1;
        }
        chunks
    }

    /// Fetch one chunk from the range-export endpoint.
    pub async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let (start, end) = window_of(descriptor)?;
        let mut url = self.endpoint(if self.config.data_format.is_native() {
            &["api", "v1", "export", "native"]
        } else {
            &["api", "v1", "export"]
        })?;

        {
            let mut query = url.query_pairs_mut();
            if self.config.selectors.is_empty() {
                query.append_pair("match[]", MATCH_ALL);
            }
            for selector in &self.config.selectors {
                query.append_pair("match[]", selector);
            }
            query.append_pair("start", &start.timestamp().to_string());
            query.append_pair("end", &end.timestamp().to_string());
        }

        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| DumpError::from_transport(e, "metric store export"))?;
        if !response.status().is_success() {
            return Err(DumpError::from_status(response.status(), "metric store export"));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DumpError::from_transport(e, "metric store export"))?;
        debug!(chunk = %descriptor.filename(), bytes = body.len(), "Fetched metric-store chunk");
        Ok(body.to_vec())
    }

    /// Post one chunk to the import endpoint, splitting line-json payloads
    /// that exceed the content limit.
    pub async fn write_chunk(&self, descriptor: &ChunkDescriptor, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            debug!(chunk = %descriptor.filename(), "Skipping empty metric-store chunk");
            return Ok(());
        }

        // The encoding on disk decides the endpoint; the configured format
        // only picks defaults when metadata is unavailable.
        let native = descriptor.extension != "json";
        let path: &[&str] = if native {
            &["api", "v1", "import", "native"]
        } else {
            &["api", "v1", "import"]
        };

        if !native && self.config.content_limit > 0 && data.len() as u64 > self.config.content_limit
        {
            for part in split_lines_by_limit(data, self.config.content_limit as usize)? {
                self.post_chunk(path, descriptor, part).await?;
            }
            return Ok(());
        }

        self.post_chunk(path, descriptor, data).await
    }

    async fn post_chunk(
        &self,
        path: &[&str],
        descriptor: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<()> {
        let url = self.endpoint(path)?;
        let response = self
            .request(reqwest::Method::POST, url)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| DumpError::from_transport(e, "metric store import"))?;
        if !response.status().is_success() {
            return Err(DumpError::from_status(response.status(), "metric store import"));
        }
        debug!(chunk = %descriptor.filename(), bytes = data.len(), "Posted metric-store chunk");
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.url.clone();
        url.path_segments_mut()
            .map_err(|()| DumpError::Config { reason: "metric store URL cannot be a base".into() })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some((user, pass)) = &self.config.credentials {
            builder = builder.basic_auth(user, pass.as_deref());
        }
        builder
    }
}

fn window_of(descriptor: &ChunkDescriptor) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    match (descriptor.start, descriptor.end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(DumpError::Format {
            reason: format!("chunk {} has no time window", descriptor.filename()),
        }),
    }
}

/// Split a line-delimited payload into segments of at most `limit` bytes,
/// cutting only at line boundaries. A single line larger than the limit
/// cannot be split and is a payload error.
fn split_lines_by_limit(data: &[u8], limit: usize) -> Result<Vec<&[u8]>> {
    let mut parts = Vec::new();
    let mut segment_start = 0usize;
    let mut segment_end = 0usize; // exclusive, always at a line boundary
    let mut line_start = 0usize;

    for (i, &b) in data.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line_len = i + 1 - line_start;
        if line_len > limit {
            return Err(DumpError::PayloadTooLarge {
                reason: format!("a single {line_len}-byte line exceeds the {limit}-byte limit"),
            });
        }
        if i + 1 - segment_start > limit {
            parts.push(&data[segment_start..segment_end]);
            segment_start = segment_end;
        }
        segment_end = i + 1;
        line_start = i + 1;
    }

    // Trailing bytes without a final newline count as one more line.
    if line_start < data.len() {
        let line_len = data.len() - line_start;
        if line_len > limit {
            return Err(DumpError::PayloadTooLarge {
                reason: format!("a single {line_len}-byte line exceeds the {limit}-byte limit"),
            });
        }
        if data.len() - segment_start > limit {
            parts.push(&data[segment_start..segment_end]);
            segment_start = segment_end;
        }
    }

    if segment_start < data.len() {
        parts.push(&data[segment_start..]);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source(format: VmDataFormat, content_limit: u64) -> Result<VmSource> {
        VmSource::new(
            reqwest::Client::new(),
            VmSourceConfig {
                url: Url::parse("http://pmm.example.com/prometheus").unwrap(),
                credentials: None,
                selectors: Vec::new(),
                data_format: format,
                content_limit,
            },
        )
    }

    #[test]
    fn test_native_with_content_limit_is_config_error() {
        assert!(matches!(
            source(VmDataFormat::Native, 1024),
            Err(DumpError::Config { .. })
        ));
        assert!(source(VmDataFormat::Json, 1024).is_ok());
        assert!(source(VmDataFormat::Native, 0).is_ok());
    }

    #[test]
    fn test_plan_partitions_four_hours_into_48_chunks() {
        let src = source(VmDataFormat::Native, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let chunks = src.plan(start, end, Duration::from_secs(300));

        assert_eq!(chunks.len(), 48);
        assert_eq!(chunks[0].start, Some(start));
        assert_eq!(chunks[47].end, Some(end));
        assert_eq!(chunks[0].filename(), "vm/0.bin");
        // Windows tile the range exactly once.
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_plan_truncates_last_window_and_handles_empty_range() {
        let src = source(VmDataFormat::Json, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = start + chrono::Duration::seconds(70);
        let chunks = src.plan(start, end, Duration::from_secs(60));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].end, Some(end));
        assert_eq!(chunks[1].filename(), "vm/1.json");

        assert!(src.plan(start, start, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_split_lines_by_limit() {
        let data = b"aaaa\nbbbb\ncccc\n";
        let parts = split_lines_by_limit(data, 10).unwrap();
        assert_eq!(parts, vec![&b"aaaa\nbbbb\n"[..], &b"cccc\n"[..]]);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), data.len());

        // No trailing newline on the last line.
        let parts = split_lines_by_limit(b"aaaa\nbb", 5).unwrap();
        assert_eq!(parts, vec![&b"aaaa\n"[..], &b"bb"[..]]);
    }

    #[test]
    fn test_split_rejects_oversized_line() {
        assert!(matches!(
            split_lines_by_limit(b"aaaa\nbbbbbbbbbb\n", 8),
            Err(DumpError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_split_fits_in_single_part() {
        let parts = split_lines_by_limit(b"a\nb\n", 100).unwrap();
        assert_eq!(parts, vec![&b"a\nb\n"[..]]);
    }
}
