//! The concurrent transfer engine.
//!
//! A bounded pool of workers draws chunk descriptors from the plan, calls the
//! matching source adapter, and hands the resulting bytes to a single
//! archive-writer task through a bounded channel. On import the direction
//! reverses: an archive-reader task feeds entries to workers that post them
//! to the remote stores.
//!
//! Cancellation is cooperative: a shared flag is observed at every suspension
//! point, flipped by red load classification, any fatal adapter error, or an
//! external signal. The archive is finalised on every exit path so partial
//! output stays inspectable.

use crate::archive::{ArchiveReader, ArchiveWriter, EntryName, LOG_FILENAME, META_FILENAME};
use crate::chunk::{ChunkDescriptor, ChunkPlan};
use crate::error::{DumpError, Result};
use crate::load::{LoadChecker, LoadLevel};
use crate::logbuf::LogBuffer;
use crate::meta::Meta;
use crate::sources::{with_retries, Source};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause between load re-checks while the classification is yellow.
const YELLOW_BACKOFF: Duration = Duration::from_secs(1);
/// Consecutive yellow checks before a worker proceeds anyway.
const MAX_YELLOW_CHECKS: u32 = 10;

type Handoff = (ChunkDescriptor, Vec<u8>);

/// The transfer engine. Shared by value across worker tasks.
pub struct Transferer {
    sources: Arc<Vec<Source>>,
    workers: usize,
}

impl Transferer {
    /// Create an engine over the given sources.
    ///
    /// `workers` of `None` or `Some(0)` means one worker per available core.
    pub fn new(sources: Vec<Source>, workers: Option<usize>) -> Result<Self> {
        if sources.is_empty() {
            return Err(DumpError::Config {
                reason: "at least one data source must be selected".into(),
            });
        }
        let workers = match workers {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
        };
        Ok(Self { sources: Arc::new(sources), workers })
    }

    /// Number of parallel workers this engine will spawn.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Export every chunk in `plan` into an archive written to `out`.
    ///
    /// `meta` becomes the first archive entry and the captured log the last,
    /// on every exit path. A partial transfer returns the causing error after
    /// finalising whatever was written.
    pub async fn export<W: Write + Send + 'static>(
        &self,
        meta: &Meta,
        plan: ChunkPlan,
        load: LoadChecker,
        log: LogBuffer,
        out: W,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let meta_bytes = meta.to_json()?;
        let plan = Arc::new(plan);
        let load = Arc::new(load);
        let total = plan.len();
        info!(chunks = total, workers = self.workers, "Starting export");

        let (cancel, cancel_rx) = cancel_pair();
        let forwarder = forward_shutdown(shutdown, Arc::clone(&cancel));
        let (tx, rx) = mpsc::channel::<Handoff>(2 * self.workers);

        // Single-writer task: owns the archive for its whole lifetime.
        let writer = {
            let cancel = Arc::clone(&cancel);
            let drain = cancel_rx.clone();
            tokio::task::spawn_blocking(move || {
                write_archive(out, meta_bytes, log, rx, cancel, drain)
            })
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(export_worker(
                worker_id,
                Arc::clone(&plan),
                Arc::clone(&self.sources),
                Arc::clone(&load),
                tx.clone(),
                Arc::clone(&cancel),
                cancel_rx.clone(),
            ));
        }
        drop(tx);

        let mut outcome = Outcome::default();
        while let Some(joined) = workers.join_next().await {
            outcome.absorb(joined);
        }

        let written = match writer.await {
            Ok(Ok(written)) => written,
            Ok(Err(e)) => {
                outcome.record(e);
                0
            }
            Err(e) => {
                outcome.record(DumpError::Internal(format!("archive writer panicked: {e}")));
                0
            }
        };
        forwarder.abort();
        let _ = forwarder.await;

        match outcome.into_result() {
            Ok(()) => {
                info!(chunks = written, "Export finished");
                Ok(())
            }
            Err(e) => {
                warn!(written, total, error = %e, "Export incomplete; archive was finalised");
                Err(e)
            }
        }
    }

    /// Import every chunk entry of the archive read from `input`.
    ///
    /// The load checker does not run on import.
    pub async fn import<R: Read + Send + 'static>(
        &self,
        input: R,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(workers = self.workers, "Starting import");

        let (cancel, cancel_rx) = cancel_pair();
        let forwarder = forward_shutdown(shutdown, Arc::clone(&cancel));
        let (tx, rx) = mpsc::channel::<Handoff>(2 * self.workers);
        let rx = Arc::new(Mutex::new(rx));

        // Archive-reader task: feeds chunk entries into the hand-off channel.
        let reader = {
            let cancel = Arc::clone(&cancel);
            let drain = cancel_rx.clone();
            tokio::task::spawn_blocking(move || read_archive(input, tx, cancel, drain))
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(import_worker(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&self.sources),
                Arc::clone(&cancel),
                cancel_rx.clone(),
            ));
        }

        let mut outcome = Outcome::default();
        while let Some(joined) = workers.join_next().await {
            outcome.absorb(joined);
        }

        let restored = match reader.await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                outcome.record(e);
                0
            }
            Err(e) => {
                outcome.record(DumpError::Internal(format!("archive reader panicked: {e}")));
                0
            }
        };
        forwarder.abort();
        let _ = forwarder.await;

        let result = outcome.into_result();
        if result.is_ok() {
            info!(chunks = restored, "Import finished");
        }
        result
    }
}

/// Shared cancellation flag plus a receiver template for tasks.
fn cancel_pair() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (Arc::new(tx), rx)
}

/// Bridge an external shutdown signal into the engine's own flag.
fn forward_shutdown(
    mut shutdown: watch::Receiver<bool>,
    cancel: Arc<watch::Sender<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                warn!("Shutdown requested, cancelling transfer");
                let _ = cancel.send(true);
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    })
}

/// First error wins; cancellations only count when nothing else failed.
#[derive(Default)]
struct Outcome {
    error: Option<DumpError>,
    cancelled: bool,
}

impl Outcome {
    fn record(&mut self, error: DumpError) {
        if matches!(error, DumpError::Cancelled) {
            self.cancelled = true;
        } else if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn absorb(&mut self, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.record(e),
            Err(e) => self.record(DumpError::Internal(format!("worker panicked: {e}"))),
        }
    }

    fn into_result(self) -> Result<()> {
        match (self.error, self.cancelled) {
            (Some(e), _) => Err(e),
            (None, true) => Err(DumpError::Cancelled),
            (None, false) => Ok(()),
        }
    }
}

/// Export-side worker loop: gate on load, draw, fetch, hand off.
async fn export_worker(
    worker_id: usize,
    plan: Arc<ChunkPlan>,
    sources: Arc<Vec<Source>>,
    load: Arc<LoadChecker>,
    tx: mpsc::Sender<Handoff>,
    cancel: Arc<watch::Sender<bool>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut yellow_checks = 0u32;
    loop {
        if *cancel_rx.borrow() {
            return Err(DumpError::Cancelled);
        }

        match load.level() {
            LoadLevel::Red => {
                let (metric, value, threshold) = load
                    .red_detail()
                    .unwrap_or_else(|| ("unknown".to_string(), 0.0, 0.0));
                let _ = cancel.send(true);
                return Err(DumpError::LoadCritical { metric, value, threshold });
            }
            LoadLevel::Yellow if yellow_checks < MAX_YELLOW_CHECKS => {
                yellow_checks += 1;
                debug!(worker_id, yellow_checks, "Server load above max threshold, backing off");
                tokio::select! {
                    _ = cancel_rx.changed() => {}
                    _ = tokio::time::sleep(YELLOW_BACKOFF) => {}
                }
                continue;
            }
            LoadLevel::Yellow => {
                warn!(worker_id, "Server load still above max threshold, proceeding anyway");
                yellow_checks = 0;
            }
            LoadLevel::Green => yellow_checks = 0,
        }

        let Some(descriptor) = plan.next() else {
            debug!(worker_id, "Chunk plan exhausted");
            return Ok(());
        };

        let source = match source_for(&sources, &descriptor) {
            Ok(source) => source,
            Err(e) => {
                let _ = cancel.send(true);
                return Err(e);
            }
        };
        let read = with_retries("metric chunk read", || source.read_chunk(&descriptor));
        let bytes = tokio::select! {
            _ = cancel_rx.changed() => return Err(DumpError::Cancelled),
            result = read => match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = cancel.send(true);
                    return Err(e);
                }
            },
        };

        debug!(worker_id, chunk = %descriptor.filename(), bytes = bytes.len(), "Chunk read");
        if tx.send((descriptor, bytes)).await.is_err() {
            // Writer is gone; it already recorded why.
            return Err(DumpError::Cancelled);
        }
    }
}

/// Import-side worker loop: take an entry, post it to its store.
async fn import_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Handoff>>>,
    sources: Arc<Vec<Source>>,
    cancel: Arc<watch::Sender<bool>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *cancel_rx.borrow() {
            return Err(DumpError::Cancelled);
        }

        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel_rx.changed() => return Err(DumpError::Cancelled),
                item = rx.recv() => item,
            }
        };
        let Some((descriptor, bytes)) = next else {
            debug!(worker_id, "Archive exhausted");
            return Ok(());
        };

        let source = match source_for(&sources, &descriptor) {
            Ok(source) => source,
            Err(e) => {
                let _ = cancel.send(true);
                return Err(e);
            }
        };
        let write = with_retries("chunk write", || source.write_chunk(&descriptor, &bytes));
        let result = tokio::select! {
            _ = cancel_rx.changed() => return Err(DumpError::Cancelled),
            result = write => result,
        };
        if let Err(e) = result {
            let _ = cancel.send(true);
            return Err(e);
        }
        debug!(worker_id, chunk = %descriptor.filename(), "Chunk restored");
    }
}

fn source_for<'a>(sources: &'a [Source], descriptor: &ChunkDescriptor) -> Result<&'a Source> {
    sources.iter().find(|s| s.kind() == descriptor.source).ok_or_else(|| DumpError::Format {
        reason: format!(
            "dump contains {} chunks but that source was not selected",
            descriptor.source
        ),
    })
}

/// Archive-writer task body. Runs on the blocking pool; the archive is not
/// safe for concurrent writes, so this is the only place that touches it.
///
/// Meta goes first, the captured log last, both on every exit path. After
/// cancellation the channel is drained without writing further chunk entries.
fn write_archive<W: Write>(
    out: W,
    meta_bytes: Vec<u8>,
    log: LogBuffer,
    mut rx: mpsc::Receiver<Handoff>,
    cancel: Arc<watch::Sender<bool>>,
    drain: watch::Receiver<bool>,
) -> Result<u64> {
    let mut archive = ArchiveWriter::new(out);
    let mut failure: Option<DumpError> = None;
    let mut written = 0u64;

    if let Err(e) = archive.put(META_FILENAME, &meta_bytes) {
        let _ = cancel.send(true);
        failure = Some(e);
    }

    while let Some((descriptor, bytes)) = rx.blocking_recv() {
        if failure.is_some() || *drain.borrow() {
            continue;
        }
        match archive.put(&descriptor.filename(), &bytes) {
            Ok(()) => written += 1,
            Err(e) => {
                let _ = cancel.send(true);
                failure = Some(e);
            }
        }
    }

    let log_bytes = log.snapshot();
    if !log_bytes.is_empty() {
        if let Err(e) = archive.put(LOG_FILENAME, &log_bytes) {
            failure.get_or_insert(e);
        }
    }
    if let Err(e) = archive.finish() {
        failure.get_or_insert(e);
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Archive-reader task body. Yields chunk entries into the hand-off channel;
/// meta and log entries are consumed here. Any entry outside the skeleton
/// fails the import.
fn read_archive<R: Read>(
    input: R,
    tx: mpsc::Sender<Handoff>,
    cancel: Arc<watch::Sender<bool>>,
    drain: watch::Receiver<bool>,
) -> Result<u64> {
    let mut archive = ArchiveReader::new(input);
    let mut sent = 0u64;

    let result = (|| {
        for entry in archive.entries()? {
            if *drain.borrow() {
                return Err(DumpError::Cancelled);
            }
            match entry? {
                (EntryName::Meta | EntryName::Log, _) => continue,
                (EntryName::Chunk(descriptor), bytes) => {
                    if tx.blocking_send((descriptor, bytes)).is_err() {
                        return Err(DumpError::Cancelled);
                    }
                    sent += 1;
                }
            }
        }
        Ok(sent)
    })();

    if result.is_err() {
        let _ = cancel.send(true);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::VmDataFormat;
    use crate::sources::{VmSource, VmSourceConfig};

    fn unreachable_vm_source() -> Source {
        Source::VictoriaMetrics(
            VmSource::new(
                reqwest::Client::new(),
                VmSourceConfig {
                    url: url::Url::parse("http://127.0.0.1:1").unwrap(),
                    credentials: None,
                    selectors: Vec::new(),
                    data_format: VmDataFormat::Native,
                    content_limit: 0,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_worker_count_defaults() {
        let t = Transferer::new(vec![unreachable_vm_source()], None).unwrap();
        assert!(t.workers() >= 1);
        let t = Transferer::new(vec![unreachable_vm_source()], Some(0)).unwrap();
        assert!(t.workers() >= 1);
        let t = Transferer::new(vec![unreachable_vm_source()], Some(4)).unwrap();
        assert_eq!(t.workers(), 4);
    }

    #[test]
    fn test_no_sources_is_config_error() {
        assert!(matches!(
            Transferer::new(Vec::new(), None),
            Err(DumpError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_export_empty_plan_writes_meta_only() {
        let t = Transferer::new(vec![unreachable_vm_source()], Some(2)).unwrap();
        let plan = ChunkPlan::new(Vec::new()).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let out: std::sync::Arc<std::sync::Mutex<Vec<u8>>> = Default::default();

        struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        t.export(
            &Meta::default(),
            plan,
            LoadChecker::disabled(),
            LogBuffer::new(),
            Shared(out.clone()),
            shutdown_rx,
        )
        .await
        .unwrap();

        let bytes = out.lock().unwrap().clone();
        let mut reader = ArchiveReader::new(bytes.as_slice());
        let names: Vec<EntryName> =
            reader.entries().unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(names, vec![EntryName::Meta]);
    }
}
