//! Best-effort usage reporting.
//!
//! Reports are posted from a detached task. Nothing awaits them and every
//! failure ends in a debug log line.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Session metadata attached to a call; the response text is filled in by
/// the executor on completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryContext {
    pub url: String,
    pub username: String,
    pub project: Option<String>,
    pub uuid: String,
    pub source: String,
    pub model: String,
    pub action: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TelemetryReport {
    pub username: String,
    pub project: Option<String>,
    pub uuid: String,
    pub response: String,
    pub source: String,
    pub model: String,
    pub action: String,
}

impl TelemetryContext {
    pub fn report(&self, response: &str) -> TelemetryReport {
        TelemetryReport {
            username: self.username.clone(),
            project: self.project.clone(),
            uuid: self.uuid.clone(),
            response: response.to_string(),
            source: self.source.clone(),
            model: self.model.clone(),
            action: self.action.clone(),
        }
    }
}

/// Fire-and-forget POST of `report`. Returns immediately.
pub fn spawn_report(client: Client, url: String, report: TelemetryReport) {
    tokio::spawn(async move {
        let result = client
            .post(&url)
            .header("Accept", "application/json")
            .timeout(TELEMETRY_TIMEOUT)
            .json(&report)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(uuid = %report.uuid, "telemetry sent");
            }
            Ok(resp) => tracing::debug!(status = %resp.status(), "telemetry rejected"),
            Err(e) => tracing::debug!("telemetry failed: {e}"),
        }
    });
}
