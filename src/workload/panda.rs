//! HTTP/JSON client for a PanDA-style task server.
//!
//! Every call answers `[status_code, payload]`; some deployments wrap it as
//! `{"status_code": .., "payload": ..}`. Payload shapes vary by call and by
//! server version, so everything is parsed leniently.

use super::{ExternalStatus, WorkloadClient};
use crate::config::WorkloadConfig;
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use crate::model::{Processing, ProcessingStatus};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

pub struct PandaClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl PandaClient {
    pub fn new(config: &WorkloadConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let mut request = self.http.post(format!("{}/{method}", self.base_url)).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let reply: Value = request.send().await?.error_for_status()?.json().await?;
        debug!(method, %reply, "workload server reply");

        let (code, payload) = split_reply(reply)
            .ok_or_else(|| Error::Workload(format!("{method}: unexpected reply shape")))?;
        if code != 0 {
            return Err(Error::Workload(format!("{method} returned {code}: {payload}")));
        }
        Ok(payload)
    }
}

fn task_param(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

#[async_trait]
impl WorkloadClient for PandaClient {
    async fn submit(&self, processing: &Processing) -> Result<String> {
        let params = processing
            .processing_metadata
            .get("task_param")
            .cloned()
            .unwrap_or_else(|| processing.processing_metadata.clone());
        let payload = self.call("insertTaskParams", json!({ "taskParams": params })).await?;
        let task_id = parse_task_id(&payload)
            .ok_or_else(|| Error::Workload(format!("no task id in submit reply: {payload}")))?;
        info!(processing_id = processing.processing_id, task_id, "task submitted");
        Ok(task_id.to_string())
    }

    async fn poll(&self, workload_id: &str) -> Result<ExternalStatus> {
        let payload = self
            .call(
                "getJediTaskDetails",
                json!({ "jediTaskID": task_param(workload_id), "fullFlag": true, "withTaskInfo": true }),
            )
            .await?;
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Workload(format!("task {workload_id}: no status in reply")))?;
        Ok(ExternalStatus {
            status: map_task_status(status),
            pending_updates: files_unaccounted(&payload),
        })
    }

    async fn kill(&self, workload_id: &str) -> Result<()> {
        self.call("killTask", json!({ "jediTaskID": task_param(workload_id) }))
            .await
            .map(|_| ())
    }

    async fn retry(&self, workload_id: &str) -> Result<()> {
        self.call(
            "retryTask",
            json!({ "jediTaskID": task_param(workload_id), "newParams": {} }),
        )
        .await
        .map(|_| ())
    }

    async fn finish(&self, workload_id: &str, soft: bool) -> Result<()> {
        self.call(
            "finishTask",
            json!({ "jediTaskID": task_param(workload_id), "soft": soft }),
        )
        .await
        .map(|_| ())
    }
}

/// `[code, payload]` or `{"status_code": code, "payload": payload}`.
fn split_reply(reply: Value) -> Option<(i64, Value)> {
    match reply {
        Value::Array(mut parts) if !parts.is_empty() => {
            let code = parts[0].as_i64()?;
            let payload = if parts.len() > 1 { parts.swap_remove(1) } else { Value::Null };
            Some((code, payload))
        }
        Value::Object(mut map) => {
            let code = map.get("status_code").and_then(Value::as_i64)?;
            Some((code, map.remove("payload").unwrap_or(Value::Null)))
        }
        _ => None,
    }
}

/// Submit replies carry the task id as a number, a numeric string, or
/// somewhere inside a message like `"succeeded. new jediTaskID=123"`,
/// usually behind a success flag: `[true, ...]`.
fn parse_task_id(payload: &Value) -> Option<i64> {
    match payload {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok().or_else(|| {
            s.split_whitespace()
                .find_map(|part| part.split_once("jediTaskID=")?.1.trim_end_matches([',', '.']).parse().ok())
        }),
        Value::Array(parts) => match parts.first() {
            Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => parts.get(1).and_then(parse_task_id),
            _ => parts.iter().find_map(parse_task_id),
        },
        Value::Object(map) => map.get("jediTaskID").and_then(parse_task_id),
        _ => None,
    }
}

/// Task server statuses onto processing statuses. Unknown values are
/// treated as still submitted.
pub fn map_task_status(status: &str) -> ProcessingStatus {
    match status {
        "registered" | "defined" | "assigning" => ProcessingStatus::Submitting,
        "ready" | "pending" | "scouting" | "scouted" | "prepared" | "topreprocess" | "preprocessing" => {
            ProcessingStatus::Submitted
        }
        "running" | "toretry" | "toincexec" | "throttled" => ProcessingStatus::Running,
        "done" => ProcessingStatus::Finished,
        "finished" | "paused" => ProcessingStatus::SubFinished,
        "failed" | "exhausted" => ProcessingStatus::Failed,
        "broken" => ProcessingStatus::Broken,
        "aborted" => ProcessingStatus::Cancelled,
        _ => ProcessingStatus::Submitted,
    }
}

/// Files the task has not yet finished or failed, when the reply says.
fn files_unaccounted(details: &Value) -> bool {
    let count = |key: &str| details.get(key).and_then(Value::as_i64);
    match (count("nFiles"), count("nFilesFinished"), count("nFilesFailed")) {
        (Some(total), Some(finished), Some(failed)) => finished + failed < total,
        _ => false,
    }
}
