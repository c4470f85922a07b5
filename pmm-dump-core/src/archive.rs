//! The dump archive container: tar over gzip with a fixed internal layout.
//!
//! ```text
//! meta.json        metadata record, first entry, required
//! log.json         captured structured log of the export, optional, last
//! vm/<n>.{bin|json} metric-store chunks
//! ch/<n>.tsv       columnar-store chunks
//! ```
//!
//! The writer is single-writer and the reader single-reader; the transfer
//! engine serialises access through its hand-off channel.

use crate::chunk::ChunkDescriptor;
use crate::error::{DumpError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the metadata entry.
pub const META_FILENAME: &str = "meta.json";
/// Name of the embedded log entry.
pub const LOG_FILENAME: &str = "log.json";

/// A classified archive entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryName {
    Meta,
    Log,
    Chunk(ChunkDescriptor),
}

impl EntryName {
    /// Parse and validate an entry path against the archive skeleton.
    /// Anything else means the dump is corrupted.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            META_FILENAME => Ok(Self::Meta),
            LOG_FILENAME => Ok(Self::Log),
            other => ChunkDescriptor::from_filename(other).map(Self::Chunk),
        }
    }
}

/// Streaming archive writer.
pub struct ArchiveWriter<W: Write> {
    tar: tar::Builder<GzEncoder<W>>,
}

impl<W: Write> ArchiveWriter<W> {
    /// Begin a new archive on `out`.
    pub fn new(out: W) -> Self {
        Self { tar: tar::Builder::new(GzEncoder::new(out, Compression::default())) }
    }

    /// Append one file. The name must belong to the archive skeleton.
    pub fn put(&mut self, name: &str, data: &[u8]) -> Result<()> {
        EntryName::parse(name)?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        );

        self.tar
            .append_data(&mut header, name, data)
            .map_err(|e| DumpError::Io { path: PathBuf::from(name), source: e })
    }

    /// Flush the tar trailer and the gzip stream.
    pub fn finish(self) -> Result<()> {
        let gz = self
            .tar
            .into_inner()
            .map_err(|e| DumpError::Io { path: PathBuf::from("<archive>"), source: e })?;
        gz.finish()
            .map(|_| ())
            .map_err(|e| DumpError::Io { path: PathBuf::from("<archive>"), source: e })
    }
}

/// Streaming archive reader.
pub struct ArchiveReader<R: Read> {
    archive: tar::Archive<GzDecoder<R>>,
}

impl<R: Read> ArchiveReader<R> {
    /// Begin reading an archive from `input`.
    pub fn new(input: R) -> Self {
        Self { archive: tar::Archive::new(GzDecoder::new(input)) }
    }

    /// Iterate `(entry name, contents)` pairs in stream order.
    ///
    /// Entry names are validated against the skeleton; an unknown name turns
    /// the whole stream into a format error. Callers must not assume `meta`
    /// comes first, although this writer does place it first.
    pub fn entries(
        &mut self,
    ) -> Result<impl Iterator<Item = Result<(EntryName, Vec<u8>)>> + '_> {
        let entries = self
            .archive
            .entries()
            .map_err(|e| DumpError::Format { reason: format!("reading dump: {e}") })?;

        Ok(entries.map(|entry| {
            let mut entry =
                entry.map_err(|e| DumpError::Format { reason: format!("reading dump: {e}") })?;
            let path = entry
                .path()
                .map_err(|e| DumpError::Format { reason: format!("reading dump entry: {e}") })?
                .to_string_lossy()
                .into_owned();
            let name = EntryName::parse(&path)?;

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| DumpError::Io { path: PathBuf::from(&path), source: e })?;
            Ok((name, data))
        }))
    }
}

/// Scan an archive for its metadata record.
///
/// Used by `show-meta` and by import when the input is seekable. Works on any
/// entry position, so dumps written by older tools (meta last) still load.
pub fn read_meta<R: Read>(input: R) -> Result<crate::meta::Meta> {
    let mut reader = ArchiveReader::new(input);
    for entry in reader.entries()? {
        let (name, data) = entry?;
        if name == EntryName::Meta {
            return crate::meta::Meta::from_json(&data);
        }
    }
    Err(DumpError::Format { reason: format!("dump does not contain {META_FILENAME}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Meta;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = ArchiveWriter::new(&mut out);
        for (name, data) in entries {
            w.put(name, data).unwrap();
        }
        w.finish().unwrap();
        out
    }

    #[test]
    fn test_round_trip_preserves_entries() {
        let meta = Meta::default().to_json().unwrap();
        let bytes = build_archive(&[
            (META_FILENAME, &meta),
            ("vm/0.bin", b"chunk zero"),
            ("ch/0.tsv", b"a\tb\n"),
            (LOG_FILENAME, b"{}"),
        ]);

        let mut reader = ArchiveReader::new(bytes.as_slice());
        let entries: Vec<_> = reader.entries().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].0, EntryName::Meta);
        assert_eq!(entries[1].1, b"chunk zero");
        assert_eq!(entries[3].0, EntryName::Log);
    }

    #[test]
    fn test_writer_rejects_foreign_names() {
        let mut out = Vec::new();
        let mut w = ArchiveWriter::new(&mut out);
        assert!(w.put("etc/passwd", b"nope").is_err());
        assert!(w.put("vm/1.tsv", b"nope").is_err());
        assert!(w.put("metadata.json", b"nope").is_err());
    }

    #[test]
    fn test_reader_rejects_unknown_entry() {
        // Hand-build a tar with an entry outside the skeleton.
        let mut out = Vec::new();
        {
            let mut tar = tar::Builder::new(GzEncoder::new(&mut out, Compression::default()));
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(3);
            header.set_mode(0o600);
            tar.append_data(&mut header, "extra/file.txt", &b"abc"[..]).unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }

        let mut reader = ArchiveReader::new(out.as_slice());
        let result: Result<Vec<_>> = reader.entries().unwrap().collect();
        assert!(matches!(result, Err(DumpError::Format { .. })));
    }

    #[test]
    fn test_entries_written_with_mode_0600() {
        let bytes = build_archive(&[("vm/0.bin", b"x")]);
        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap() & 0o777, 0o600);
        assert_eq!(entry.header().entry_type(), tar::EntryType::Regular);
    }

    #[test]
    fn test_read_meta_finds_meta_anywhere() {
        let meta = Meta { pmm_server_version: "2.41.0".into(), ..Meta::default() };
        let encoded = meta.to_json().unwrap();
        // meta deliberately not first
        let bytes = build_archive(&[("vm/0.bin", b"x"), (META_FILENAME, &encoded)]);
        let parsed = read_meta(bytes.as_slice()).unwrap();
        assert_eq!(parsed.pmm_server_version, "2.41.0");
    }

    #[test]
    fn test_read_meta_missing() {
        let bytes = build_archive(&[("vm/0.bin", b"x")]);
        assert!(matches!(read_meta(bytes.as_slice()), Err(DumpError::Format { .. })));
    }
}
