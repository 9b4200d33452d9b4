//! Open-loop client workload for PBFT nodes.
//!
//! A burst sends `count` synthetic client operations to every target. Each
//! request is dispatched on its own task as soon as it is built, so slow or
//! dead nodes never hold back the rest of the burst; outcomes are only
//! gathered afterwards to produce a [`BurstReport`].

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use pbft_harness::{Endpoint, HarnessError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CLIENT_ID: &str = "ahnhwi";
pub const DEFAULT_REQUEST_PATH: &str = "req";
/// Per-target cap on error messages kept in a report.
const MAX_REPORTED_ERRORS: usize = 5;

/// JSON body accepted by a node's request endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub operation: String,
    pub timestamp: u64,
}

/// Requests `"<prefix> - <i>"` with `timestamp == i` for `i` in `0..count`.
pub fn burst_requests(client_id: &str, prefix: &str, count: usize) -> Vec<ClientRequest> {
    (0..count)
        .map(|i| ClientRequest {
            client_id: client_id.to_string(),
            operation: format!("{prefix} - {i}"),
            timestamp: i as u64,
        })
        .collect()
}

/// One entry point into the cluster plus the label its operations carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstTarget {
    pub endpoint: Endpoint,
    pub label_prefix: String,
}

impl fmt::Display for BurstTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.endpoint, self.label_prefix)
    }
}

/// Parses `host:port=prefix`.
impl FromStr for BurstTarget {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('=').ok_or_else(|| {
            HarnessError::invalid(format!("target {s:?} must look like host:port=prefix"))
        })?;
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(HarnessError::invalid(format!("target {s:?} has an empty prefix")));
        }
        Ok(Self {
            endpoint: addr.parse()?,
            label_prefix: prefix.to_string(),
        })
    }
}

/// Pause the dispatch loop for `pause` after every `every` rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub every: usize,
    pub pause: Duration,
}

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub client_id: String,
    pub request_path: String,
    pub request_timeout: Duration,
    pub throttle: Option<Throttle>,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            request_path: DEFAULT_REQUEST_PATH.to_string(),
            request_timeout: Duration::from_secs(10),
            throttle: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetReport {
    pub target: String,
    pub sent: usize,
    pub ok: usize,
    pub failed: usize,
    /// First few failure messages.
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BurstReport {
    pub client_id: String,
    pub count: usize,
    pub elapsed_ms: u64,
    pub targets: Vec<TargetReport>,
}

impl BurstReport {
    pub fn total_failed(&self) -> usize {
        self.targets.iter().map(|t| t.failed).sum()
    }

    pub fn total_sent(&self) -> usize {
        self.targets.iter().map(|t| t.sent).sum()
    }
}

pub struct Injector {
    client: reqwest::Client,
    config: InjectorConfig,
}

impl Injector {
    pub fn new(config: InjectorConfig) -> Result<Self, HarnessError> {
        if config.request_path.is_empty()
            || !config
                .request_path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c))
        {
            return Err(HarnessError::invalid(format!(
                "invalid request path {:?}",
                config.request_path
            )));
        }
        if let Some(throttle) = config.throttle {
            if throttle.every == 0 {
                return Err(HarnessError::invalid("throttle interval must be > 0"));
            }
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HarnessError::RequestFailure(format!("build http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn url(&self, endpoint: &Endpoint) -> String {
        let path = self.config.request_path.trim_start_matches('/');
        format!("http://{endpoint}/{path}")
    }

    /// Single-target convenience for [`Injector::inject`].
    pub async fn inject_burst(
        &self,
        endpoint: &Endpoint,
        label_prefix: &str,
        count: usize,
    ) -> BurstReport {
        let target = BurstTarget {
            endpoint: endpoint.clone(),
            label_prefix: label_prefix.to_string(),
        };
        self.inject(&[target], count).await
    }

    /// Fires `count` rounds; each round sends request `i` to every target.
    pub async fn inject(&self, targets: &[BurstTarget], count: usize) -> BurstReport {
        let started = Instant::now();
        let mut reports = targets
            .iter()
            .map(|t| TargetReport {
                target: t.to_string(),
                ..TargetReport::default()
            })
            .collect::<Vec<_>>();

        let per_target = targets
            .iter()
            .map(|t| burst_requests(&self.config.client_id, &t.label_prefix, count))
            .collect::<Vec<_>>();

        let mut inflight = FuturesUnordered::new();
        for i in 0..count {
            for (slot, target) in targets.iter().enumerate() {
                let body = per_target[slot][i].clone();
                let client = self.client.clone();
                let url = self.url(&target.endpoint);
                reports[slot].sent += 1;
                inflight.push(tokio::spawn(async move {
                    (slot, send_one(&client, &url, &body).await)
                }));
            }
            if let Some(throttle) = self.config.throttle {
                if (i + 1) % throttle.every == 0 && i + 1 < count {
                    tokio::time::sleep(throttle.pause).await;
                }
            }
        }
        tracing::debug!(requests = inflight.len(), "burst dispatched");

        while let Some(joined) = inflight.next().await {
            let (slot, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    tracing::warn!(error = %err, "request task failed");
                    continue;
                }
            };
            let report = &mut reports[slot];
            match result {
                Ok(()) => report.ok += 1,
                Err(err) => {
                    report.failed += 1;
                    if report.errors.len() < MAX_REPORTED_ERRORS {
                        report.errors.push(err.to_string());
                    }
                }
            }
        }

        for report in &reports {
            if report.failed > 0 {
                tracing::warn!(
                    target = %report.target,
                    sent = report.sent,
                    failed = report.failed,
                    "requests failed"
                );
            }
        }

        BurstReport {
            client_id: self.config.client_id.clone(),
            count,
            elapsed_ms: started.elapsed().as_millis() as u64,
            targets: reports,
        }
    }
}

async fn send_one(
    client: &reqwest::Client,
    url: &str,
    body: &ClientRequest,
) -> Result<(), HarnessError> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| HarnessError::RequestFailure(format!("{url}: {e}")))?;
    resp.error_for_status()
        .map_err(|e| HarnessError::RequestFailure(format!("{url}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_forty_has_distinct_labels_and_timestamps() {
        let reqs = burst_requests(DEFAULT_CLIENT_ID, "SendMes1", 40);
        assert_eq!(reqs.len(), 40);
        for (i, req) in reqs.iter().enumerate() {
            assert_eq!(req.operation, format!("SendMes1 - {i}"));
            assert_eq!(req.timestamp, i as u64);
            assert_eq!(req.client_id, "ahnhwi");
        }
        let mut labels = reqs.iter().map(|r| r.operation.clone()).collect::<Vec<_>>();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 40);
    }

    #[test]
    fn request_json_uses_wire_field_names() {
        let req = &burst_requests("ahnhwi", "SendMes2", 4)[3];
        let json = serde_json::to_value(req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"clientID": "ahnhwi", "operation": "SendMes2 - 3", "timestamp": 3})
        );
    }

    #[test]
    fn target_parsing() {
        let target: BurstTarget = "114.55.130.178:1114=SendMes2".parse().unwrap();
        assert_eq!(target.endpoint.port, 1114);
        assert_eq!(target.label_prefix, "SendMes2");
        assert_eq!(target.to_string(), "114.55.130.178:1114=SendMes2");
        assert!("114.55.130.178:1114".parse::<BurstTarget>().is_err());
        assert!("114.55.130.178:1114=".parse::<BurstTarget>().is_err());
        assert!("nohost=SendMes1".parse::<BurstTarget>().is_err());
    }

    #[test]
    fn rejects_bad_injector_config() {
        let config = InjectorConfig {
            request_path: "req?x=1".into(),
            ..InjectorConfig::default()
        };
        assert!(Injector::new(config).is_err());
        let config = InjectorConfig {
            throttle: Some(Throttle {
                every: 0,
                pause: Duration::from_secs(1),
            }),
            ..InjectorConfig::default()
        };
        assert!(Injector::new(config).is_err());
    }

    #[test]
    fn url_joins_endpoint_and_path() {
        let injector = Injector::new(InjectorConfig {
            request_path: "/req".into(),
            ..InjectorConfig::default()
        })
        .unwrap();
        let endpoint: Endpoint = "47.107.59.211:1110".parse().unwrap();
        assert_eq!(injector.url(&endpoint), "http://47.107.59.211:1110/req");
    }

    #[test]
    fn ipv6_targets_produce_valid_urls() {
        let injector = Injector::new(InjectorConfig::default()).unwrap();
        let target: BurstTarget = "[::1]:2222=SendMes1".parse().unwrap();
        assert_eq!(target.endpoint.host, "::1");
        let url = injector.url(&target.endpoint);
        assert_eq!(url, "http://[::1]:2222/req");
        let parsed = reqwest::Url::parse(&url).unwrap();
        assert_eq!(parsed.port(), Some(2222));
        assert_eq!(target.to_string(), "[::1]:2222=SendMes1");
    }
}
