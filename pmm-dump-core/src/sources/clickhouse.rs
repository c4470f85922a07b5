//! The columnar-store adapter (ClickHouse-compatible).
//!
//! Speaks the store's HTTP interface. Rows travel in tab-separated form;
//! column-type metadata is fetched once at construction and used on import to
//! re-type values before insertion. Partitioning is by row count.

use crate::chunk::{ChunkDescriptor, SourceKind};
use crate::error::{DumpError, Result};
use crate::sources::tsv::{self, Column};
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

/// Table holding the query-analytics rows.
const QAN_TABLE: &str = "metrics";

/// Configuration of one columnar-store adapter.
#[derive(Debug, Clone)]
pub struct ChSourceConfig {
    pub url: Url,
    pub database: String,
    pub credentials: Option<(String, Option<String>)>,
    /// Optional server-side row filter, appended to the base query verbatim.
    pub where_clause: Option<String>,
}

/// Columnar-store adapter.
pub struct ChSource {
    client: reqwest::Client,
    config: ChSourceConfig,
    columns: Vec<Column>,
}

impl ChSource {
    /// Validate the filter and fetch column-type metadata.
    pub async fn connect(client: reqwest::Client, config: ChSourceConfig) -> Result<Self> {
        if let Some(clause) = &config.where_clause {
            validate_where(clause)?;
        }

        let mut source = Self { client, config, columns: Vec::new() };
        source.columns = source.fetch_columns().await?;
        debug!(columns = source.columns.len(), "Fetched columnar-store schema");
        Ok(source)
    }

    /// Column metadata fetched at construction.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Partition the windowed query into row-count chunks.
    ///
    /// Emits descriptors with monotonically increasing offsets until the
    /// query is exhausted; an empty result set produces an empty plan.
    pub async fn plan(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_rows: u64,
    ) -> Result<Vec<ChunkDescriptor>> {
        if chunk_rows == 0 {
            return Err(DumpError::Config { reason: "--chunk-rows must be positive".into() });
        }
        if start >= end {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT count() FROM {} {}",
            self.table(),
            self.row_filter(start, end)
        );
        let body = self.execute(&sql, Vec::new()).await?;
        let total: u64 = String::from_utf8_lossy(&body)
            .trim()
            .parse()
            .map_err(|e| DumpError::Format { reason: format!("columnar row count: {e}") })?;

        let chunks = (0..total.div_ceil(chunk_rows))
            .map(|i| ChunkDescriptor {
                source: SourceKind::ClickHouse,
                index: i as u32,
                start: Some(start),
                end: Some(end),
                row_offset: Some(i * chunk_rows),
                row_limit: Some(chunk_rows),
                extension: "tsv",
            })
            .collect();
        Ok(chunks)
    }

    /// Stream one row range as tab-separated bytes.
    pub async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let (start, end) = match (descriptor.start, descriptor.end) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return Err(DumpError::Format {
                    reason: format!("chunk {} has no time window", descriptor.filename()),
                })
            }
        };
        let (offset, limit) = match (descriptor.row_offset, descriptor.row_limit) {
            (Some(o), Some(l)) => (o, l),
            _ => {
                return Err(DumpError::Format {
                    reason: format!("chunk {} has no row bounds", descriptor.filename()),
                })
            }
        };

        let sql = format!(
            "SELECT * FROM {} {} LIMIT {offset}, {limit} FORMAT TSV",
            self.table(),
            self.row_filter(start, end)
        );
        let body = self.execute(&sql, Vec::new()).await?;
        debug!(chunk = %descriptor.filename(), bytes = body.len(), "Fetched columnar-store chunk");
        Ok(body)
    }

    /// Re-type and insert one chunk of rows.
    pub async fn write_chunk(&self, descriptor: &ChunkDescriptor, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            debug!(chunk = %descriptor.filename(), "Skipping empty columnar-store chunk");
            return Ok(());
        }

        let text = std::str::from_utf8(data).map_err(|e| DumpError::Format {
            reason: format!("chunk {} is not valid UTF-8: {e}", descriptor.filename()),
        })?;

        let mut normalised = String::with_capacity(text.len());
        for line in text.lines().filter(|l| !l.is_empty()) {
            let fields = tsv::parse_line(line)?;
            tsv::retype_row(&fields, &self.columns)?;
            normalised.push_str(&tsv::encode_line(&fields));
            normalised.push('\n');
        }

        let sql = format!("INSERT INTO {} FORMAT TSV", self.table());
        self.execute(&sql, normalised.into_bytes()).await?;
        debug!(chunk = %descriptor.filename(), "Inserted columnar-store chunk");
        Ok(())
    }

    async fn fetch_columns(&self) -> Result<Vec<Column>> {
        let sql = format!(
            "SELECT name, type FROM system.columns \
             WHERE database = '{}' AND table = '{QAN_TABLE}' FORMAT TSV",
            self.config.database.replace('\'', "''")
        );
        let body = self.execute(&sql, Vec::new()).await?;
        let text = String::from_utf8_lossy(&body);

        let columns: Vec<Column> = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                line.split_once('\t')
                    .map(|(name, type_name)| Column::new(name, type_name))
                    .ok_or_else(|| DumpError::Format {
                        reason: format!("malformed schema row: {line:?}"),
                    })
            })
            .collect::<Result<_>>()?;

        if columns.is_empty() {
            return Err(DumpError::Config {
                reason: format!(
                    "table {}.{QAN_TABLE} does not exist or has no columns",
                    self.config.database
                ),
            });
        }
        Ok(columns)
    }

    fn table(&self) -> String {
        format!("{}.{QAN_TABLE}", self.config.database)
    }

    fn row_filter(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let mut clause = format!(
            "WHERE period_start >= toDateTime({}) AND period_start <= toDateTime({})",
            start.timestamp(),
            end.timestamp()
        );
        if let Some(filter) = &self.config.where_clause {
            clause.push_str(" AND (");
            clause.push_str(filter);
            clause.push(')');
        }
        clause
    }

    /// Run one statement over the HTTP interface. The statement travels as a
    /// query parameter so the body can carry row data for inserts.
    async fn execute(&self, sql: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let mut url = self.config.url.clone();
        url.query_pairs_mut().append_pair("query", sql);

        let mut request = self.client.post(url).body(body);
        if let Some((user, pass)) = &self.config.credentials {
            request = request.basic_auth(user, pass.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DumpError::from_transport(e, "columnar store"))?;
        if !response.status().is_success() {
            return Err(DumpError::from_status(response.status(), "columnar store"));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DumpError::from_transport(e, "columnar store"))?;
        Ok(bytes.to_vec())
    }
}

/// A row filter must be non-empty and must not smuggle extra statements.
pub fn validate_where(clause: &str) -> Result<()> {
    if clause.trim().is_empty() {
        return Err(DumpError::Config { reason: "WHERE filter must not be empty".into() });
    }
    if clause.contains(';') {
        return Err(DumpError::Config {
            reason: "WHERE filter must not contain statement terminators".into(),
        });
    }
    Ok(())
}
