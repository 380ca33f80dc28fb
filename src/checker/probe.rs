// src/checker/probe.rs
// =============================================================================
// Quick health check: is each service answering, and is it blocking us?
//
// Every service gets one fetch of the code "a". We don't care what "a"
// points to, only how the service reacts:
// - a URL or "no such code" means the service works for us
// - ServiceBlocked means we are being throttled or banned
// - anything else is reported as an error
//
// All services are probed at the same time.
// =============================================================================

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::services::{Service, ServiceError};

/// The code every service is probed with.
pub const PROBE_CODE: &str = "a";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Blocked,
    Error,
}

/// How one service answered the probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub service: String,
    #[serde(flatten)]
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }

    /// A service that could not even be set up.
    pub fn unavailable(service: &str, message: String) -> Self {
        Self {
            service: service.to_string(),
            status: ProbeStatus::Error,
            message: Some(message),
        }
    }
}

/// Probes every service concurrently; results come back in completion order.
pub async fn probe_services(
    services: Vec<(String, Box<dyn Service>)>,
    timeout: Duration,
) -> Vec<ProbeResult> {
    let concurrency = services.len().max(1);
    let futures = services
        .into_iter()
        .map(|(name, service)| probe_service(name, service, timeout));

    stream::iter(futures)
        .buffer_unordered(concurrency)
        .collect()
        .await
}

async fn probe_service(name: String, mut service: Box<dyn Service>, timeout: Duration) -> ProbeResult {
    let deadline = Instant::now() + timeout;
    let result = service.fetch(PROBE_CODE, deadline).await;
    categorize(name, result)
}

fn categorize(service: String, result: Result<String, ServiceError>) -> ProbeResult {
    let (status, message) = match result {
        Ok(url) => (ProbeStatus::Ok, Some(format!("{} -> {}", PROBE_CODE, url))),
        Err(ServiceError::NoRedirect) => (ProbeStatus::Ok, Some(format!("{} is unused", PROBE_CODE))),
        Err(ServiceError::ServiceBlocked) => (ProbeStatus::Blocked, None),
        Err(e) => (ProbeStatus::Error, Some(e.to_string())),
    };
    ProbeResult {
        service,
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::testing::{Reply, Script};

    fn scripted(reply: Reply) -> Box<dyn Service> {
        Script::new().reply(PROBE_CODE, [reply]).factory()()
    }

    #[tokio::test]
    async fn test_probe_categories() {
        let services = vec![
            ("found".to_string(), scripted(Reply::Url("http://example.org/"))),
            ("absent".to_string(), scripted(Reply::Absent)),
            ("blocked".to_string(), scripted(Reply::Blocked)),
            ("broken".to_string(), scripted(Reply::Reset)),
        ];
        let mut results = probe_services(services, Duration::from_secs(1)).await;
        results.sort_by(|a, b| a.service.cmp(&b.service));

        let statuses: Vec<(&str, ProbeStatus)> = results
            .iter()
            .map(|r| (r.service.as_str(), r.status.clone()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("absent", ProbeStatus::Ok),
                ("blocked", ProbeStatus::Blocked),
                ("broken", ProbeStatus::Error),
                ("found", ProbeStatus::Ok),
            ]
        );
    }

    #[test]
    fn test_json_shape() {
        let result = categorize("isgd".into(), Err(ServiceError::ServiceBlocked));
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"service":"isgd","status":"blocked"}"#
        );
    }
}
