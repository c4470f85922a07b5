//! Integration tests for the transfer engine and archive format.
//!
//! These exercise the engine against unreachable endpoints and in-memory
//! archives; no monitoring server is required.

use pmm_dump_core::archive::EntryName;
use pmm_dump_core::{
    ArchiveReader, ArchiveWriter, ChunkDescriptor, ChunkPlan, DumpError, LoadChecker, LogBuffer,
    Meta, SourceKind, Source, Transferer, VmDataFormat, VmSource, VmSourceConfig,
    LOG_FILENAME, META_FILENAME,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// In-memory sink that can outlive the writer task.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A metric-store source pointing at a port nothing listens on.
fn unreachable_source(format: VmDataFormat) -> Source {
    Source::VictoriaMetrics(
        VmSource::new(
            reqwest::Client::new(),
            VmSourceConfig {
                url: url::Url::parse("http://127.0.0.1:1").unwrap(),
                credentials: None,
                selectors: Vec::new(),
                data_format: format,
                content_limit: 0,
            },
        )
        .unwrap(),
    )
}

fn vm_chunk(index: u32, format: VmDataFormat) -> ChunkDescriptor {
    let start = chrono::DateTime::from_timestamp(1_700_000_000 + i64::from(index) * 300, 0);
    let end = chrono::DateTime::from_timestamp(1_700_000_000 + (i64::from(index) + 1) * 300, 0);
    ChunkDescriptor {
        source: SourceKind::VictoriaMetrics,
        index,
        start,
        end,
        row_offset: None,
        row_limit: None,
        extension: format.extension(),
    }
}

fn entry_names(bytes: &[u8]) -> Vec<String> {
    let mut reader = ArchiveReader::new(bytes);
    reader
        .entries()
        .unwrap()
        .map(|e| e.unwrap().0)
        .map(|name| match name {
            EntryName::Meta => META_FILENAME.to_string(),
            EntryName::Log => LOG_FILENAME.to_string(),
            EntryName::Chunk(d) => d.filename(),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn export_failure_still_finalises_archive() {
    let engine = Transferer::new(vec![unreachable_source(VmDataFormat::Native)], Some(2)).unwrap();
    let plan = ChunkPlan::new(vec![
        vm_chunk(0, VmDataFormat::Native),
        vm_chunk(1, VmDataFormat::Native),
    ])
    .unwrap();

    let out = SharedBuf::default();
    let log = LogBuffer::new();
    log.clone().write_all(b"{\"level\":\"info\",\"fields\":{\"message\":\"start\"}}\n").unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = engine
        .export(&Meta::default(), plan, LoadChecker::disabled(), log, out.clone(), shutdown_rx)
        .await;

    // Every descriptor either made it into the archive or the engine errored.
    assert!(matches!(result, Err(DumpError::RemoteTransient { .. })), "{result:?}");

    // The archive is finalised even on failure: meta first, log last.
    let names = entry_names(&out.contents());
    assert_eq!(names.first().map(String::as_str), Some(META_FILENAME));
    assert_eq!(names.last().map(String::as_str), Some(LOG_FILENAME));
    assert!(names.iter().all(|n| !n.starts_with("vm/")));
}

#[tokio::test(flavor = "multi_thread")]
async fn import_rejects_corrupted_dump() {
    // Build an archive whose only flaw is an entry outside the skeleton.
    let mut raw = Vec::new();
    {
        use flate2::write::GzEncoder;
        let mut tar = tar::Builder::new(GzEncoder::new(&mut raw, flate2::Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(2);
        tar.append_data(&mut header, "qan/0.tsv", &b"x\n"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap();
    }

    let engine = Transferer::new(vec![unreachable_source(VmDataFormat::Native)], Some(2)).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = engine.import(std::io::Cursor::new(raw), shutdown_rx).await;
    assert!(matches!(result, Err(DumpError::Format { .. })), "{result:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn import_skips_meta_and_log_entries() {
    // An archive with only meta and log has nothing to restore: import
    // succeeds without a single remote call.
    let mut raw = Vec::new();
    {
        let mut writer = ArchiveWriter::new(&mut raw);
        writer.put(META_FILENAME, &Meta::default().to_json().unwrap()).unwrap();
        writer.put(LOG_FILENAME, b"{}\n").unwrap();
        writer.finish().unwrap();
    }

    let engine = Transferer::new(vec![unreachable_source(VmDataFormat::Native)], Some(3)).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    engine.import(std::io::Cursor::new(raw), shutdown_rx).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn import_fails_when_chunk_source_is_unreachable() {
    let mut raw = Vec::new();
    {
        let mut writer = ArchiveWriter::new(&mut raw);
        writer.put(META_FILENAME, &Meta::default().to_json().unwrap()).unwrap();
        writer.put("vm/0.bin", b"payload").unwrap();
        writer.finish().unwrap();
    }

    let engine = Transferer::new(vec![unreachable_source(VmDataFormat::Native)], Some(1)).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = engine.import(std::io::Cursor::new(raw), shutdown_rx).await;
    assert!(matches!(result, Err(DumpError::RemoteTransient { .. })), "{result:?}");
}

#[test]
fn show_meta_is_idempotent_over_one_archive() {
    let meta = Meta {
        pmm_server_version: "2.41.0".into(),
        max_chunk_size: 123_456,
        vm_data_format: VmDataFormat::Json,
        arguments: "export --dump-core".into(),
        ..Meta::default()
    };

    let mut raw = Vec::new();
    {
        let mut writer = ArchiveWriter::new(&mut raw);
        writer.put(META_FILENAME, &meta.to_json().unwrap()).unwrap();
        writer.finish().unwrap();
    }

    let first = pmm_dump_core::read_meta(raw.as_slice()).unwrap();
    let second = pmm_dump_core::read_meta(raw.as_slice()).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.vm_data_format, VmDataFormat::Json);
}
