#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_chat::config::{AgentConfig, ConfigSource};
use agent_chat::output_log::OutputLog;
use agent_chat::{build_router, AppContext};
use agent_chat_process::{AgentProcess, ProcessManager};
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub context: Arc<AppContext>,
    pub dir: TempDir,
}

impl TestApp {
    /// A server whose agent settings start from `configure`. The process
    /// manager uses a short startup grace period.
    pub fn new(configure: impl FnOnce(&mut AgentConfig, &Path)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = AgentConfig {
            workspace: dir.path().to_path_buf(),
            enable_logging: false,
            ..AgentConfig::default()
        };
        configure(&mut config, dir.path());

        let process: Arc<dyn AgentProcess> = Arc::new(
            ProcessManager::new()
                .with_grace_period(Duration::from_millis(150))
                .with_stop_timeout(Duration::from_secs(1)),
        );
        let source = ConfigSource::new(dir.path().join("settings.toml"), None);
        let context = Arc::new(AppContext::from_parts(
            source,
            config,
            process,
            OutputLog::new(dir.path().join("session.log")),
        ));
        let app = build_router(context.clone());
        Self { app, context, dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Writes a shell agent that echoes every input line back, preceded by a
/// diagnostics line the chat should hide.
pub fn write_echo_agent(dir: &Path) -> PathBuf {
    let path = dir.join("echo_agent.sh");
    std::fs::write(
        &path,
        "while IFS= read -r line; do\n  echo \"[DEBUG] got input\"\n  echo \"echo: $line\"\ndone\n",
    )
    .expect("write agent script");
    path
}

pub async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, bytes)
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let (status, _headers, bytes) = send_request(app, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn history(app: &Router) -> Vec<Value> {
    let (status, body) = send_json(app, Method::GET, "/v1/history", None).await;
    assert_eq!(status, StatusCode::OK, "history status");
    body["messages"].as_array().cloned().unwrap_or_default()
}

/// Polls the history until `done` holds or the timeout passes.
pub async fn wait_for_history(
    app: &Router,
    timeout: Duration,
    done: impl Fn(&[Value]) -> bool,
) -> Vec<Value> {
    let start = Instant::now();
    loop {
        let messages = history(app).await;
        if done(&messages) || start.elapsed() > timeout {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Collects SSE `data` payloads until `stop` holds or the timeout passes.
pub async fn read_sse_until(
    stream: &mut (impl futures::Stream<Item = Result<Bytes, axum::Error>> + Unpin),
    timeout: Duration,
    stop: impl Fn(&[Value]) -> bool,
) -> Vec<Value> {
    let mut buffer = String::new();
    let mut events = Vec::new();
    let start = Instant::now();
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => break,
        };
        let chunk: Bytes = match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            _ => break,
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(idx) = buffer.find("\n\n") {
            let block = buffer[..idx].to_string();
            buffer = buffer[idx + 2..].to_string();
            if let Some(event) = parse_sse_block(&block) {
                events.push(event);
            }
        }
        if stop(&events) {
            break;
        }
    }
    events
}

fn parse_sse_block(block: &str) -> Option<Value> {
    let data: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.trim_start())
        .collect();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data.join("\n")).ok()
}
