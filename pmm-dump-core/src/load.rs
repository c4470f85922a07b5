//! Server-load sampling and classification.
//!
//! A background task samples three vitals (cpu, ram, db-ram) from the metric
//! store every few seconds and folds them into a single green/yellow/red
//! classification. The transfer engine reads the classification lock-free
//! between chunk dispatches and throttles or aborts accordingly.

use crate::error::{DumpError, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

/// Cadence of the sampler task.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive sample failures before the classification demotes to yellow.
const MAX_SAMPLE_FAILURES: u32 = 3;

/// Server vital a threshold applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdKind {
    Cpu,
    Ram,
    DbRam,
}

impl ThresholdKind {
    pub const ALL: [Self; 3] = [Self::Cpu, Self::Ram, Self::DbRam];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Ram => "ram",
            Self::DbRam => "db-ram",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(Self::Cpu),
            "ram" => Some(Self::Ram),
            "db-ram" => Some(Self::DbRam),
            _ => None,
        }
    }

    /// Instant query producing this vital as a 0-100 percentage.
    fn query(&self) -> &'static str {
        match self {
            Self::Cpu => "100 * (1 - avg(rate(node_cpu_seconds_total{mode=\"idle\"}[10s])))",
            Self::Ram => "100 * (1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)",
            Self::DbRam => {
                "100 * sum(mysql_global_status_innodb_buffer_pool_bytes_data) \
                 / sum(node_memory_MemTotal_bytes)"
            }
        }
    }
}

impl std::fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ceilings for one vital: the *max* tier triggers throttling, the
/// *critical* tier aborts the export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub kind: ThresholdKind,
    pub max_value: f64,
    pub critical_value: f64,
}

/// Parse the textual `name=value,name=value,…` threshold encoding.
///
/// Both tiers are parsed together; a vital missing from one tier gets a
/// ceiling of 100 there (never triggers).
pub fn parse_threshold_list(max: &str, critical: &str) -> Result<Vec<Threshold>> {
    let max_map = parse_tier(max, "--max-load")?;
    let critical_map = parse_tier(critical, "--critical-load")?;

    let thresholds = ThresholdKind::ALL
        .iter()
        .filter(|kind| max_map.contains_key(kind) || critical_map.contains_key(kind))
        .map(|kind| Threshold {
            kind: *kind,
            max_value: max_map.get(kind).copied().unwrap_or(100.0),
            critical_value: critical_map.get(kind).copied().unwrap_or(100.0),
        })
        .collect();
    Ok(thresholds)
}

fn parse_tier(list: &str, flag: &str) -> Result<std::collections::HashMap<ThresholdKind, f64>> {
    let mut map = std::collections::HashMap::new();
    for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').ok_or_else(|| DumpError::Config {
            reason: format!("{flag}: expected name=value, got {pair:?}"),
        })?;
        let kind = ThresholdKind::parse(name.trim()).ok_or_else(|| DumpError::Config {
            reason: format!("{flag}: unknown metric {name:?} (expected cpu, ram or db-ram)"),
        })?;
        let value: f64 = value.trim().parse().map_err(|_| DumpError::Config {
            reason: format!("{flag}: invalid value in {pair:?}"),
        })?;
        if !(0.0..=100.0).contains(&value) {
            return Err(DumpError::Config {
                reason: format!("{flag}: {name} must be within 0-100, got {value}"),
            });
        }
        map.insert(kind, value);
    }
    Ok(map)
}

/// One observation of the three vitals.
#[derive(Debug, Clone, Copy)]
struct LoadSample {
    cpu: f64,
    ram: f64,
    db_ram: f64,
}

impl LoadSample {
    fn value(&self, kind: ThresholdKind) -> f64 {
        match kind {
            ThresholdKind::Cpu => self.cpu,
            ThresholdKind::Ram => self.ram,
            ThresholdKind::DbRam => self.db_ram,
        }
    }
}

/// Discrete load classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoadLevel {
    Green = 0,
    Yellow = 1,
    Red = 2,
}

impl LoadLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Green,
            1 => Self::Yellow,
            _ => Self::Red,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }
}

/// Vital that pushed the classification to red, with its value and ceiling.
type RedDetail = (ThresholdKind, f64, f64);

fn classify(sample: &LoadSample, thresholds: &[Threshold]) -> (LoadLevel, Option<RedDetail>) {
    let mut level = LoadLevel::Green;
    for t in thresholds {
        let value = sample.value(t.kind);
        if value > t.critical_value {
            return (LoadLevel::Red, Some((t.kind, value, t.critical_value)));
        }
        if value > t.max_value {
            level = LoadLevel::Yellow;
        }
    }
    (level, None)
}

/// Periodic sampler exposing the latest classification as an atomic word.
pub struct LoadChecker {
    level: Arc<AtomicU8>,
    red_detail: Arc<Mutex<Option<RedDetail>>>,
    enabled: bool,
}

impl LoadChecker {
    /// Checker that never samples and always reports green (`--ignore-load`).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            level: Arc::new(AtomicU8::new(LoadLevel::Green as u8)),
            red_detail: Arc::new(Mutex::new(None)),
            enabled: false,
        }
    }

    /// Start the sampler task. It runs until `cancel` flips or its sender is
    /// dropped.
    pub fn start(
        client: reqwest::Client,
        victoria_metrics_url: Url,
        credentials: Option<(String, Option<String>)>,
        thresholds: Vec<Threshold>,
        mut cancel: watch::Receiver<bool>,
    ) -> Self {
        if thresholds.is_empty() {
            return Self::disabled();
        }

        let level = Arc::new(AtomicU8::new(LoadLevel::Green as u8));
        let red_detail = Arc::new(Mutex::new(None));

        let task_level = Arc::clone(&level);
        let task_detail = Arc::clone(&red_detail);
        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.changed() => break,
                    _ = interval.tick() => {}
                }
                if *cancel.borrow() {
                    break;
                }

                match sample_vitals(&client, &victoria_metrics_url, credentials.as_ref()).await {
                    Ok(sample) => {
                        failures = 0;
                        let (classified, detail) = classify(&sample, &thresholds);
                        debug!(
                            cpu = sample.cpu,
                            ram = sample.ram,
                            db_ram = sample.db_ram,
                            level = classified.as_str(),
                            "Sampled server load"
                        );
                        if let Ok(mut slot) = task_detail.lock() {
                            *slot = detail;
                        }
                        task_level.store(classified as u8, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "Failed to sample server load");
                        if failures >= MAX_SAMPLE_FAILURES {
                            task_level.store(LoadLevel::Yellow as u8, Ordering::Relaxed);
                        }
                    }
                }
            }
            debug!("Load sampler stopped");
        });

        Self { level, red_detail, enabled: true }
    }

    /// Latest classification. Lock-free.
    #[must_use]
    pub fn level(&self) -> LoadLevel {
        LoadLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// The vital behind the latest red classification, if any.
    #[must_use]
    pub fn red_detail(&self) -> Option<(String, f64, f64)> {
        self.red_detail
            .lock()
            .ok()
            .and_then(|d| *d)
            .map(|(kind, value, ceiling)| (kind.as_str().to_string(), value, ceiling))
    }

    /// Whether the checker actually samples the server.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Query the three vitals with instant queries against the metric store.
async fn sample_vitals(
    client: &reqwest::Client,
    base: &Url,
    credentials: Option<&(String, Option<String>)>,
) -> Result<LoadSample> {
    let mut values = [0.0f64; 3];
    for (slot, kind) in values.iter_mut().zip(ThresholdKind::ALL) {
        *slot = instant_query(client, base, credentials, kind.query()).await?;
    }
    Ok(LoadSample { cpu: values[0], ram: values[1], db_ram: values[2] })
}

async fn instant_query(
    client: &reqwest::Client,
    base: &Url,
    credentials: Option<&(String, Option<String>)>,
    query: &str,
) -> Result<f64> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| DumpError::Config { reason: "metric store URL cannot be a base".into() })?
        .pop_if_empty()
        .extend(["api", "v1", "query"]);
    url.query_pairs_mut().append_pair("query", query);

    let mut request = client.get(url);
    if let Some((user, pass)) = credentials {
        request = request.basic_auth(user, pass.as_deref());
    }

    let response = request
        .send()
        .await
        .map_err(|e| DumpError::from_transport(e, "load sample"))?;
    if !response.status().is_success() {
        return Err(DumpError::from_status(response.status(), "load sample"));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| DumpError::RemoteTransient { reason: format!("load sample: {e}") })?;

    // {"data": {"result": [{"value": [<ts>, "<val>"]}]}}; empty result reads as 0
    let value = body
        .pointer("/data/result/0/value/1")
        .and_then(|v| v.as_str())
        .map(|s| s.parse::<f64>())
        .transpose()
        .map_err(|e| DumpError::RemoteTransient { reason: format!("load sample value: {e}") })?
        .unwrap_or(0.0);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Vec<Threshold> {
        parse_threshold_list("cpu=70,ram=80,db-ram=10", "cpu=90,ram=90,db-ram=30").unwrap()
    }

    #[test]
    fn test_parse_threshold_list() {
        let list = thresholds();
        assert_eq!(list.len(), 3);
        let cpu = list.iter().find(|t| t.kind == ThresholdKind::Cpu).unwrap();
        assert_eq!(cpu.max_value, 70.0);
        assert_eq!(cpu.critical_value, 90.0);
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(parse_threshold_list("disk=10", "cpu=90").is_err());
        assert!(parse_threshold_list("cpu", "cpu=90").is_err());
        assert!(parse_threshold_list("cpu=abc", "cpu=90").is_err());
        assert!(parse_threshold_list("cpu=150", "cpu=90").is_err());
    }

    #[test]
    fn test_missing_tier_defaults_to_100() {
        let list = parse_threshold_list("cpu=70", "").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].critical_value, 100.0);
    }

    #[test]
    fn test_classify_tiers() {
        let t = thresholds();
        let green = LoadSample { cpu: 10.0, ram: 20.0, db_ram: 5.0 };
        assert_eq!(classify(&green, &t).0, LoadLevel::Green);

        let yellow = LoadSample { cpu: 75.0, ram: 20.0, db_ram: 5.0 };
        assert_eq!(classify(&yellow, &t).0, LoadLevel::Yellow);

        let red = LoadSample { cpu: 95.0, ram: 20.0, db_ram: 5.0 };
        let (level, detail) = classify(&red, &t);
        assert_eq!(level, LoadLevel::Red);
        let (kind, value, ceiling) = detail.unwrap();
        assert_eq!(kind, ThresholdKind::Cpu);
        assert_eq!(value, 95.0);
        assert_eq!(ceiling, 90.0);
    }

    #[test]
    fn test_values_at_threshold_do_not_trigger() {
        let t = thresholds();
        let at_max = LoadSample { cpu: 70.0, ram: 80.0, db_ram: 10.0 };
        assert_eq!(classify(&at_max, &t).0, LoadLevel::Green);
    }

    #[test]
    fn test_disabled_checker_is_green_and_inert() {
        let checker = LoadChecker::disabled();
        assert_eq!(checker.level(), LoadLevel::Green);
        assert!(!checker.is_enabled());
        assert!(checker.red_detail().is_none());
    }
}
