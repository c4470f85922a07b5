//! Source adapters for the two remote stores.
//!
//! Only two variants exist, so dispatch is a tagged enum rather than a trait
//! object. Adapters classify their own errors; the retry helper here applies
//! the bounded backoff policy to the transient kind.

pub mod clickhouse;
pub mod tsv;
pub mod victoriametrics;

use crate::chunk::{ChunkDescriptor, SourceKind};
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub use clickhouse::{ChSource, ChSourceConfig};
pub use victoriametrics::{VmSource, VmSourceConfig};

/// Attempts per chunk request, transient failures only.
const RETRY_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// One remote store behind the transfer engine.
pub enum Source {
    VictoriaMetrics(VmSource),
    ClickHouse(ChSource),
}

impl Source {
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::VictoriaMetrics(_) => SourceKind::VictoriaMetrics,
            Self::ClickHouse(_) => SourceKind::ClickHouse,
        }
    }

    /// Fetch one chunk from the remote store. The returned bytes are opaque
    /// to the engine and the archive.
    pub async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        match self {
            Self::VictoriaMetrics(s) => s.read_chunk(descriptor).await,
            Self::ClickHouse(s) => s.read_chunk(descriptor).await,
        }
    }

    /// Post one chunk to the remote store.
    pub async fn write_chunk(&self, descriptor: &ChunkDescriptor, data: &[u8]) -> Result<()> {
        match self {
            Self::VictoriaMetrics(s) => s.write_chunk(descriptor, data).await,
            Self::ClickHouse(s) => s.write_chunk(descriptor, data).await,
        }
    }
}

/// Run `op` with the bounded retry policy: up to [`RETRY_ATTEMPTS`] tries,
/// exponential backoff, transient errors only.
pub(crate) async fn with_retries<T, F, Fut>(context: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(error = %e, attempt, "Retrying {context}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
