//! The `import` command: restore a dump into the remote stores.

use crate::client::PmmClient;
use crate::commands::{credentials, CommonOpts};
use anyhow::Result;
use clap::Args;
use pmm_dump_core::{
    read_meta, ChSource, ChSourceConfig, ConnectionConfig, DumpError, Source, Transferer,
    VmDataFormat, VmSource, VmSourceConfig,
};
use std::fs::File;
use std::io::{IsTerminal, Read};
use std::path::Path;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Args)]
pub struct ImportArgs {
    /// Limit the chunk content size for metric-store requests, in bytes
    /// (0 = disabled). Doesn't work with the native format
    #[arg(long, default_value_t = 0)]
    pub vm_content_limit: u64,
}

pub async fn import(
    common: CommonOpts,
    args: ImportArgs,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if !(common.dump_core || common.dump_qan) {
        return Err(DumpError::Config {
            reason: "specify at least one data source (--dump-core, --dump-qan)".into(),
        }
        .into());
    }

    let piped = !std::io::stdin().is_terminal();
    if common.dump_path.is_none() && !piped {
        return Err(DumpError::Config {
            reason: "specify the path to the dump file with --dump-path".into(),
        }
        .into());
    }

    let data_format = match &common.dump_path {
        Some(path) => negotiated_format(path),
        None => {
            if common.vm_native_data {
                warn!("Cannot read meta from a piped dump; using the native format because --vm-native-data was provided");
            } else {
                warn!("Cannot read meta from a piped dump; using the native format by default");
            }
            VmDataFormat::Native
        }
    };

    let config = ConnectionConfig::resolve(common.connection)?;
    let http = config.http_client()?;
    let pmm = PmmClient::new(http.clone(), &config);
    let pmm_version = pmm.server_version().await?;
    info!(version = %pmm_version, "Connected to PMM server");

    let mut sources = Vec::new();
    if common.dump_core {
        sources.push(Source::VictoriaMetrics(VmSource::new(
            http.clone(),
            VmSourceConfig {
                url: config.victoria_metrics_url.clone(),
                credentials: credentials(&config),
                selectors: Vec::new(),
                data_format,
                content_limit: args.vm_content_limit,
            },
        )?));
    }
    if common.dump_qan {
        sources.push(Source::ClickHouse(
            ChSource::connect(
                http.clone(),
                ChSourceConfig {
                    url: config.click_house_url.clone(),
                    database: config.click_house_database(),
                    credentials: credentials(&config),
                    where_clause: None,
                },
            )
            .await?,
        ));
    }

    let input: Box<dyn Read + Send> = match &common.dump_path {
        Some(path) => Box::new(
            File::open(path).map_err(|e| DumpError::Io { path: path.clone(), source: e })?,
        ),
        None => Box::new(std::io::stdin()),
    };

    let engine = Transferer::new(sources, common.workers)?;
    engine.import(input, shutdown).await?;
    Ok(())
}

/// Read the dump metadata to pick the metric-store wire decoder, falling back
/// to native when the meta is unreadable or silent.
fn negotiated_format(path: &Path) -> VmDataFormat {
    let meta = File::open(path)
        .map_err(|e| DumpError::Io { path: path.to_path_buf(), source: e })
        .and_then(read_meta);
    match meta {
        Ok(meta) => match meta.vm_data_format {
            VmDataFormat::Json => VmDataFormat::Json,
            VmDataFormat::Native => VmDataFormat::Native,
            VmDataFormat::Unspecified => {
                warn!("Dump meta does not record the data format; assuming native");
                VmDataFormat::Native
            }
        },
        Err(e) => {
            warn!(error = %e, "Could not read dump meta; assuming the native format");
            VmDataFormat::Native
        }
    }
}
