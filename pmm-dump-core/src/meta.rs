//! The archive metadata record.
//!
//! Composed once per export and written as the first entry of the archive;
//! read first on import to negotiate the metric-store wire encoding.

use serde::{Deserialize, Serialize};

/// Wire encoding used for metric-store chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmDataFormat {
    /// Compact binary export format. Version-sensitive.
    #[default]
    Native,
    /// Line-delimited JSON. Verbose but stable across versions.
    Json,
    /// Unknown (meta produced by a tool that did not record the format).
    #[serde(rename = "", other)]
    Unspecified,
}

impl VmDataFormat {
    /// Chunk file extension for this encoding.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Native | Self::Unspecified => "bin",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        !matches!(self, Self::Json)
    }
}

/// Version of the tool that produced a dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolVersion {
    pub git_branch: String,
    pub git_commit: String,
    pub git_version: String,
}

/// One monitored service, captured when `--export-services-info` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub node_id: String,
    pub node_name: String,
    pub agents_ids: Vec<String>,
}

/// Structured descriptor of archive contents (`meta.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub version: ToolVersion,
    #[serde(default)]
    pub pmm_server_version: String,
    /// Largest chunk the producer planned for, in bytes. Informational.
    #[serde(default)]
    pub max_chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmm_timezone: Option<String>,
    /// The command line that produced the dump, joined for display.
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub vm_data_format: VmDataFormat,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pmm_server_services: Vec<ServiceInfo>,
}

impl Meta {
    pub fn to_json(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::DumpError::Format { reason: format!("encoding meta: {e}") })
    }

    pub fn from_json(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::DumpError::Format { reason: format!("decoding meta: {e}") })
    }
}

/// Format a byte count with decimal (SI) units, e.g. `1.5 MB`.
#[must_use]
pub fn byte_count_decimal(bytes: u64) -> String {
    byte_count(bytes, 1000, ["kB", "MB", "GB", "TB", "PB", "EB"])
}

/// Format a byte count with binary units, e.g. `1.4 MiB`.
#[must_use]
pub fn byte_count_binary(bytes: u64) -> String {
    byte_count(bytes, 1024, ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"])
}

fn byte_count(bytes: u64, unit: u64, suffixes: [&str; 6]) -> String {
    if bytes < unit {
        return format!("{bytes} B");
    }
    let mut div = unit;
    let mut exp = 0;
    while bytes / div >= unit && exp < suffixes.len() - 1 {
        div *= unit;
        exp += 1;
    }
    format!("{:.1} {}", bytes as f64 / div as f64, suffixes[exp])
}
