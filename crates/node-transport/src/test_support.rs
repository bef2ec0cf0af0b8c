//! Shared fixtures for handler tests.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use command_group::AsyncCommandGroup;
use node_core::{ConfigDocument, Executor, ExecutorError, NodeSettings, SpawnedProcess};
use node_session::{ProcessSupervisor, SupervisorOptions};
use serde_json::Value;
use tokio::process::Command;
use tower::ServiceExt;

use crate::router::AppState;

/// Core that announces itself and then idles.
pub const HEALTHY: &str = r#"echo "Xray 1.8.4 started"; exec sleep 30"#;

/// Runs a shell script in place of the proxy core.
pub struct ScriptExecutor {
    pub script: &'static str,
}

#[async_trait]
impl Executor for ScriptExecutor {
    async fn spawn(&self, _config: &ConfigDocument) -> Result<SpawnedProcess, ExecutorError> {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .group_spawn()?;
        Ok(SpawnedProcess { child })
    }

    async fn version(&self) -> Result<String, ExecutorError> {
        Ok("1.8.4".into())
    }

    fn is_ready_line(&self, line: &str, version: Option<&str>) -> bool {
        version.is_some_and(|v| line.contains(&format!("Xray {v} started")))
    }
}

/// State around a scripted core; inbounds are restricted to `in1`.
pub fn state_with(script: &'static str) -> AppState<ScriptExecutor> {
    let supervisor = ProcessSupervisor::new(
        ScriptExecutor { script },
        SupervisorOptions {
            stop_grace: Duration::from_millis(500),
            ..SupervisorOptions::default()
        },
    );
    let mut settings = NodeSettings::default();
    settings.inbounds.insert("in1".into());
    AppState::new(supervisor, settings)
}

/// POST `body` as JSON and decode the JSON reply (`Null` when empty).
pub async fn call(app: &Router, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}
