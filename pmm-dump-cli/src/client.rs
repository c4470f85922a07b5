//! Thin client for the PMM server API.
//!
//! The transfer engine itself only talks to the two stores; this client
//! covers the surrounding collaborators: the authentication probe, server
//! version and timezone for the metadata record, the services inventory, and
//! dashboard-to-selector resolution.

use pmm_dump_core::{ConnectionConfig, DumpError, Result, ServiceInfo};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

pub struct PmmClient {
    http: reqwest::Client,
    base: Url,
    credentials: Option<(String, Option<String>)>,
}

impl PmmClient {
    pub fn new(http: reqwest::Client, config: &ConnectionConfig) -> Self {
        let credentials =
            config.username.clone().map(|user| (user, config.password.clone()));
        Self { http, base: config.pmm_url.clone(), credentials }
    }

    /// Server version. Doubles as the authentication probe: a 401/403 here
    /// fails the whole run before any data is moved.
    pub async fn server_version(&self) -> Result<String> {
        let body = self.get_json(&["v1", "version"]).await?;
        body.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DumpError::RemotePermanent {
                reason: "PMM version response has no version field".into(),
            })
    }

    /// Organisation timezone, if the server exposes one. Optional metadata;
    /// failures are logged and swallowed.
    pub async fn timezone(&self) -> Option<String> {
        match self.get_json(&["graph", "api", "org", "preferences"]).await {
            Ok(body) => body
                .get("timezone")
                .and_then(Value::as_str)
                .filter(|tz| !tz.is_empty())
                .map(str::to_string),
            Err(e) => {
                warn!(error = %e, "Could not read PMM timezone");
                None
            }
        }
    }

    /// Overview of all monitored services, with node names and agent ids.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self.post_json(&["v1", "inventory", "Services", "List"]).await?;
        let nodes = self.post_json(&["v1", "inventory", "Nodes", "List"]).await?;
        let agents = self.post_json(&["v1", "inventory", "Agents", "List"]).await?;

        let node_names: HashMap<String, String> = flatten_inventory(&nodes)
            .filter_map(|item| {
                Some((
                    item.get("node_id")?.as_str()?.to_string(),
                    item.get("node_name")?.as_str()?.to_string(),
                ))
            })
            .collect();

        let mut agents_by_service: HashMap<String, Vec<String>> = HashMap::new();
        for item in flatten_inventory(&agents) {
            if let (Some(agent_id), Some(service_id)) = (
                item.get("agent_id").and_then(Value::as_str),
                item.get("service_id").and_then(Value::as_str),
            ) {
                agents_by_service
                    .entry(service_id.to_string())
                    .or_default()
                    .push(agent_id.to_string());
            }
        }

        let mut result = Vec::new();
        for item in flatten_inventory(&services) {
            let (Some(service_id), Some(name), Some(node_id)) = (
                item.get("service_id").and_then(Value::as_str),
                item.get("service_name").and_then(Value::as_str),
                item.get("node_id").and_then(Value::as_str),
            ) else {
                continue;
            };
            result.push(ServiceInfo {
                name: name.to_string(),
                node_id: node_id.to_string(),
                node_name: node_names.get(node_id).cloned().unwrap_or_default(),
                agents_ids: agents_by_service.remove(service_id).unwrap_or_default(),
            });
        }
        debug!(services = result.len(), "Fetched services inventory");
        Ok(result)
    }

    /// Resolve dashboard names into time-series selectors.
    ///
    /// Every panel expression of each dashboard is scanned for label-matcher
    /// blocks; when instances are given, a `service_name` matcher is folded
    /// into each block so dashboard and instance filters combine.
    pub async fn dashboard_selectors(
        &self,
        dashboards: &[String],
        instances: &[String],
    ) -> Result<Vec<String>> {
        let mut selectors = Vec::new();
        for name in dashboards {
            let uid = self.dashboard_uid(name).await?;
            let body =
                self.get_json(&["graph", "api", "dashboards", "uid", uid.as_str()]).await?;
            let mut exprs = Vec::new();
            collect_exprs(&body, &mut exprs);

            for expr in exprs {
                for selector in selector_blocks(&expr) {
                    let selector = apply_instance_filter(&selector, instances);
                    if !selectors.contains(&selector) {
                        selectors.push(selector);
                    }
                }
            }
        }
        debug!(selectors = selectors.len(), "Resolved dashboard selectors");
        Ok(selectors)
    }

    async fn dashboard_uid(&self, name: &str) -> Result<String> {
        let mut url = self.endpoint(&["graph", "api", "search"])?;
        url.query_pairs_mut().append_pair("query", name);

        let body = self.request_json(self.http.get(url)).await?;
        body.as_array()
            .and_then(|hits| {
                hits.iter().find(|hit| {
                    hit.get("title")
                        .and_then(Value::as_str)
                        .is_some_and(|title| title.eq_ignore_ascii_case(name))
                })
            })
            .and_then(|hit| hit.get("uid").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| DumpError::Config { reason: format!("dashboard {name:?} not found") })
    }

    async fn get_json(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        self.request_json(self.http.get(url)).await
    }

    async fn post_json(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        self.request_json(self.http.post(url).json(&serde_json::json!({}))).await
    }

    async fn request_json(&self, mut request: reqwest::RequestBuilder) -> Result<Value> {
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, pass.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| DumpError::from_transport(e, "PMM API"))?;
        if !response.status().is_success() {
            return Err(DumpError::from_status(response.status(), "PMM API"));
        }
        response
            .json()
            .await
            .map_err(|e| DumpError::RemotePermanent { reason: format!("PMM API: {e}") })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| DumpError::Config { reason: "PMM URL cannot be a base".into() })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Inventory responses group items into per-type arrays; walk them all.
fn flatten_inventory(body: &Value) -> impl Iterator<Item = &serde_json::Map<String, Value>> {
    body.as_object()
        .into_iter()
        .flat_map(|groups| groups.values())
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(Value::as_object)
}

/// Collect every `expr` string found anywhere in a dashboard document.
fn collect_exprs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(expr) = map.get("expr").and_then(Value::as_str) {
                if !expr.is_empty() {
                    out.push(expr.to_string());
                }
            }
            for child in map.values() {
                collect_exprs(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_exprs(child, out);
            }
        }
        _ => {}
    }
}

/// Extract `{label="value",…}` blocks from a query expression.
fn selector_blocks(expr: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = expr;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else { break };
        let block = &rest[open..=open + close];
        if block.contains('=') && !blocks.iter().any(|b| b == block) {
            blocks.push(block.to_string());
        }
        rest = &rest[open + close + 1..];
    }
    blocks
}

/// Fold a `service_name` matcher for the given instances into a selector.
fn apply_instance_filter(selector: &str, instances: &[String]) -> String {
    if instances.is_empty() {
        return selector.to_string();
    }
    let joined = instances.join("|");
    let inner = selector.trim_start_matches('{').trim_end_matches('}');
    if inner.is_empty() {
        format!("{{service_name=~\"{joined}\"}}")
    } else {
        format!("{{{inner},service_name=~\"{joined}\"}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_blocks() {
        let expr = "rate(node_cpu_seconds_total{mode=\"idle\"}[5m]) / node_load1{}";
        assert_eq!(selector_blocks(expr), vec!["{mode=\"idle\"}".to_string()]);
    }

    #[test]
    fn test_apply_instance_filter() {
        let instances = vec!["mysql1".to_string(), "mysql2".to_string()];
        assert_eq!(
            apply_instance_filter("{mode=\"idle\"}", &instances),
            "{mode=\"idle\",service_name=~\"mysql1|mysql2\"}"
        );
        assert_eq!(apply_instance_filter("{a=\"b\"}", &[]), "{a=\"b\"}");
    }

    #[test]
    fn test_collect_exprs_walks_nested_panels() {
        let doc = serde_json::json!({
            "dashboard": {
                "panels": [
                    {"targets": [{"expr": "up{job=\"mysql\"}"}]},
                    {"panels": [{"targets": [{"expr": "node_load1"}]}]}
                ]
            }
        });
        let mut exprs = Vec::new();
        collect_exprs(&doc, &mut exprs);
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn test_flatten_inventory() {
        let doc = serde_json::json!({
            "mysql": [{"service_id": "s1", "service_name": "db", "node_id": "n1"}],
            "mongodb": [{"service_id": "s2", "service_name": "m", "node_id": "n2"}]
        });
        assert_eq!(flatten_inventory(&doc).count(), 2);
    }
}
