//! The `export` command: stream chunks from the remote stores into a dump.

use crate::client::PmmClient;
use crate::commands::{credentials, tool_version, CommonOpts};
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use pmm_dump_core::{
    parse_threshold_list, ChSource, ChSourceConfig, ChunkPlan, ConnectionConfig, DumpError,
    LoadChecker, LogBuffer, Meta, Source, Transferer, VmDataFormat, VmSource, VmSourceConfig,
};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Args)]
pub struct ExportArgs {
    /// Start date-time to filter exported metrics, RFC 3339. Default: end - 4h
    #[arg(long)]
    pub start_ts: Option<String>,

    /// End date-time to filter exported metrics, RFC 3339. Default: now
    #[arg(long)]
    pub end_ts: Option<String>,

    /// Time series selector to pass to the metric store
    #[arg(long)]
    pub ts_selector: Option<String>,

    /// QAN only. WHERE statement appended to the row query
    #[arg(short = 'w', long = "where")]
    pub where_clause: Option<String>,

    /// Service name to filter instances. Use multiple times to filter by multiple instances
    #[arg(long = "instance")]
    pub instances: Vec<String>,

    /// Dashboard name to filter. Use multiple times to filter by multiple dashboards
    #[arg(long = "dashboard")]
    pub dashboards: Vec<String>,

    /// Time range to fit into a single core-metrics chunk, e.g. '45s', '5m', '1h'
    #[arg(long, default_value = "5m", value_parser = parse_chunk_duration)]
    pub chunk_time_range: Duration,

    /// Amount of rows to fit into a single QAN chunk
    #[arg(long, default_value_t = 1000)]
    pub chunk_rows: u64,

    /// Disable checking for load threshold values
    #[arg(long)]
    pub ignore_load: bool,

    /// Max load threshold values as name=value pairs. CPU is overall, regardless of core count: 0-100%
    #[arg(long, default_value = "cpu=70,ram=80,db-ram=10")]
    pub max_load: String,

    /// Critical load threshold values as name=value pairs
    #[arg(long, default_value = "cpu=90,ram=90,db-ram=30")]
    pub critical_load: String,

    /// Redirect the archive to STDOUT
    #[arg(long)]
    pub stdout: bool,

    /// Export overview info about all monitored services
    #[arg(long)]
    pub export_services_info: bool,
}

pub async fn export(
    common: CommonOpts,
    args: ExportArgs,
    log: LogBuffer,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if !(common.dump_core || common.dump_qan) {
        return Err(DumpError::Config {
            reason: "specify at least one data source (--dump-core, --dump-qan)".into(),
        }
        .into());
    }

    let end = match &args.end_ts {
        Some(raw) => parse_rfc3339(raw, "--end-ts")?,
        None => Utc::now(),
    };
    let start = match &args.start_ts {
        Some(raw) => parse_rfc3339(raw, "--start-ts")?,
        None => end - chrono::Duration::hours(4),
    };
    if start > end {
        return Err(DumpError::Config { reason: "invalid time range: start is after end".into() }
            .into());
    }

    let config = ConnectionConfig::resolve(common.connection)?;
    let http = config.http_client()?;
    let pmm = PmmClient::new(http.clone(), &config);

    let pmm_version = pmm.server_version().await?;
    info!(version = %pmm_version, "Connected to PMM server");

    // Selectors for the metric store: resolved dashboards, then the explicit
    // selector, then per-instance predicates as a fallback.
    let mut selectors = if args.dashboards.is_empty() {
        Vec::new()
    } else {
        pmm.dashboard_selectors(&args.dashboards, &args.instances).await?
    };
    if let Some(ts) = &args.ts_selector {
        selectors.push(ts.clone());
    } else if selectors.is_empty() {
        selectors
            .extend(args.instances.iter().map(|name| format!("{{service_name=\"{name}\"}}")));
    }

    if common.dump_core && common.dump_qan && args.instances.is_empty() {
        let core_filtered = args.ts_selector.is_some() || !args.dashboards.is_empty();
        let qan_filtered = args.where_clause.as_deref().is_some_and(|w| !w.trim().is_empty());
        if core_filtered && !qan_filtered {
            warn!("Filter for core metrics found, but not for QAN; QAN rows for all services will be exported");
        } else if qan_filtered && !core_filtered {
            warn!("Filter for QAN found, but not for core metrics; core metrics for all services will be exported");
        }
    }

    let mut where_clause = args.where_clause.clone().filter(|w| !w.trim().is_empty());
    if where_clause.is_none() && !args.instances.is_empty() {
        where_clause = Some(
            args.instances
                .iter()
                .map(|name| format!("service_name='{name}'"))
                .collect::<Vec<_>>()
                .join(" AND "),
        );
    }

    let data_format =
        if common.vm_native_data { VmDataFormat::Native } else { VmDataFormat::Json };

    let mut sources = Vec::new();
    let mut chunks = Vec::new();

    if common.dump_core {
        let vm = VmSource::new(
            http.clone(),
            VmSourceConfig {
                url: config.victoria_metrics_url.clone(),
                credentials: credentials(&config),
                selectors,
                data_format,
                content_limit: 0,
            },
        )?;
        chunks.extend(vm.plan(start, end, args.chunk_time_range));
        sources.push(Source::VictoriaMetrics(vm));
    }

    if common.dump_qan {
        let ch = ChSource::connect(
            http.clone(),
            ChSourceConfig {
                url: config.click_house_url.clone(),
                database: config.click_house_database(),
                credentials: credentials(&config),
                where_clause,
            },
        )
        .await?;
        chunks.extend(ch.plan(start, end, args.chunk_rows).await?);
        sources.push(Source::ClickHouse(ch));
    }

    let plan = ChunkPlan::new(chunks)?;
    info!(
        chunks = plan.len(),
        start = %start.to_rfc3339(),
        end = %end.to_rfc3339(),
        "Chunk plan ready"
    );

    let services =
        if args.export_services_info { pmm.services().await? } else { Vec::new() };

    let meta = Meta {
        version: tool_version(),
        pmm_server_version: pmm_version,
        max_chunk_size: 0,
        pmm_timezone: pmm.timezone().await,
        arguments: std::env::args().skip(1).collect::<Vec<_>>().join(" "),
        vm_data_format: data_format,
        pmm_server_services: services,
    };

    let (load, load_stop) = if args.ignore_load {
        (LoadChecker::disabled(), None)
    } else {
        let thresholds = parse_threshold_list(&args.max_load, &args.critical_load)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let checker = LoadChecker::start(
            http.clone(),
            config.victoria_metrics_url.clone(),
            credentials(&config),
            thresholds,
            stop_rx,
        );
        (checker, Some(stop_tx))
    };

    let out: Box<dyn Write + Send> = if args.stdout {
        Box::new(std::io::stdout())
    } else {
        let path = common.dump_path.clone().unwrap_or_else(default_dump_path);
        info!(path = %path.display(), "Writing dump");
        Box::new(
            File::create(&path).map_err(|e| DumpError::Io { path: path.clone(), source: e })?,
        )
    };

    let engine = Transferer::new(sources, common.workers)?;
    let result = engine.export(&meta, plan, load, log, out, shutdown).await;
    if let Some(stop) = load_stop {
        let _ = stop.send(true);
    }
    result?;
    Ok(())
}

fn parse_rfc3339(raw: &str, flag: &str) -> Result<DateTime<Utc>, DumpError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DumpError::Config { reason: format!("{flag}: invalid RFC 3339 value: {e}") })
}

fn default_dump_path() -> PathBuf {
    PathBuf::from(format!("pmm-dump-{}.tar.gz", Utc::now().timestamp()))
}

/// Parse `45s`/`5m`/`1h` style durations; a bare number means seconds.
pub fn parse_chunk_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let Some(last) = raw.chars().last() else {
        return Err("duration must not be empty".to_string());
    };
    let (digits, multiplier) = match last {
        's' => (&raw[..raw.len() - 1], 1),
        'm' => (&raw[..raw.len() - 1], 60),
        'h' => (&raw[..raw.len() - 1], 3600),
        c if c.is_ascii_digit() => (raw, 1),
        other => return Err(format!("unsupported duration unit {other:?}")),
    };
    let value: u64 =
        digits.parse().map_err(|_| format!("invalid duration {raw:?}"))?;
    if value == 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(Duration::from_secs(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_duration() {
        assert_eq!(parse_chunk_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_chunk_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_chunk_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_chunk_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_chunk_duration("5d").is_err());
        assert!(parse_chunk_duration("0m").is_err());
        assert!(parse_chunk_duration("").is_err());
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_rfc3339("2024-05-01T08:00:00Z", "--start-ts").unwrap();
        assert_eq!(dt.timestamp(), 1_714_550_400);
        assert!(parse_rfc3339("yesterday", "--start-ts").is_err());
    }
}
