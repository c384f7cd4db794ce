//! Server-subscribed event pipes.
//!
//! A pipe is a long-lived stream of event frames the server opens with a
//! listener id (`lid`) and an event kind. The agent produces value frames
//! `{lid, event, data, end:false}` through the shared forward queue and
//! terminates the stream with exactly one `{lid, event, data:null,
//! end:true}` frame, whether it ends by itself (finite stream, error) or
//! because the server sent a close frame.
//!
//! `Pipe::end` is a one-shot gate: the first call cancels the pipe's
//! token, emits the terminal frame and wins; later calls are no-ops, and
//! value frames after the gate are dropped.

use anyhow::{Context, Result};
use bollard::container::LogsOptions;
use bollard::models::EventMessageTypeEnum;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::Container;

/// Event kinds a pipe can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Log,
    Status,
    Password,
    Git,
}

/// A pipe-open frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeOpen {
    pub lid: String,
    pub event: Event,
    #[serde(default)]
    pub filter: serde_json::Value,
}

/// An outbound pipe frame.
#[derive(Debug, Clone, Serialize)]
pub struct Forward {
    pub lid: String,
    pub event: Event,
    pub data: Option<serde_json::Value>,
    pub end: bool,
}

/// Filter common to every pipe kind: the target container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenericFilter {
    #[serde(default)]
    pub container: String,
}

/// Log pipe filter. Timestamps are Unix milliseconds; zero means unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub until: i64,
    #[serde(default)]
    pub limit: i64,
}

/// Git pipe filter carrying the deploy coordinates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitFilter {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default, rename = "resetData")]
    pub reset_data: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: i64,
    pub content: String,
    pub end: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordPayload {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitPayload {
    pub deployed: bool,
}

/// One live subscription. Clones share the same gate and token.
#[derive(Clone)]
pub struct Pipe {
    pub lid: String,
    pub event: Event,
    pub filter: serde_json::Value,
    token: CancellationToken,
    forward: mpsc::Sender<Forward>,
    ended: Arc<AtomicBool>,
}

impl Pipe {
    pub fn new(open: PipeOpen, forward: mpsc::Sender<Forward>) -> Self {
        Self {
            lid: open.lid,
            event: open.event,
            filter: open.filter,
            token: CancellationToken::new(),
            forward,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wraps a payload into a value frame.
    pub fn package(&self, data: serde_json::Value) -> Forward {
        Forward {
            lid: self.lid.clone(),
            event: self.event,
            data: Some(data),
            end: false,
        }
    }

    /// Forwards one value frame; dropped silently once the pipe has ended.
    pub async fn send(&self, data: serde_json::Value) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        self.forward
            .send(self.package(data))
            .await
            .map_err(|_| anyhow::anyhow!("forward channel closed"))
    }

    /// Ends the pipe: cancels producers and emits the terminal frame.
    /// Idempotent; only the first call has any effect.
    pub async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let terminal = Forward {
            lid: self.lid.clone(),
            event: self.event,
            data: None,
            end: true,
        };
        if self.forward.send(terminal).await.is_err() {
            tracing::debug!("forward channel closed before pipe {} terminal frame", self.lid);
        }
    }

    /// Resolves when the pipe is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Maps a Docker event action onto the status vocabulary the control
/// plane understands. Unmapped actions are skipped.
pub fn normalize_event_action(action: &str) -> Option<&'static str> {
    Some(match action {
        "create" => "created",
        "start" => "running",
        "restart" => "restarting",
        "pause" => "paused",
        "unpause" => "running",
        "die" => "exited",
        "destroy" => "removing",
        "kill" => "running",
        "oom" => "dead",
        // The container stays up after an exec ends.
        "exec_die" => "running",
        _ => return None,
    })
}

/// Splits a timestamped log line into Unix milliseconds and content.
fn parse_log_line(line: &str) -> Option<(i64, String)> {
    let (timestamp, content) = line.split_once(' ')?;
    let parsed = chrono::DateTime::parse_from_rfc3339(timestamp).ok()?;
    Some((parsed.timestamp_millis(), content.to_string()))
}

impl Container {
    /// Streams container logs into the pipe.
    ///
    /// With no `until` bound the stream follows live output; `limit` caps
    /// the number of forwarded lines. The caller ends the pipe when this
    /// returns.
    pub async fn pipe_logs(
        &self,
        docker: &Docker,
        since: i64,
        until: i64,
        limit: i64,
        pipe: &Pipe,
    ) -> Result<()> {
        let cid = self.runtime_id(docker).await?;
        let follow = until <= 0;
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: if since > 0 { since / 1000 } else { 0 },
            until: if until > 0 { until / 1000 } else { 0 },
            ..Default::default()
        };
        let mut stream = docker.logs(&cid, Some(options));

        let mut forwarded = 0i64;
        'outer: loop {
            let item = tokio::select! {
                _ = pipe.cancelled() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let output = item.context("reading log stream")?;
            let text = String::from_utf8_lossy(&output.into_bytes()).into_owned();
            for line in text.lines() {
                let Some((timestamp, content)) = parse_log_line(line) else {
                    continue;
                };
                pipe.send(serde_json::to_value(LogLine {
                    timestamp,
                    content,
                    end: false,
                })?)
                .await?;
                forwarded += 1;
                if limit > 0 && forwarded >= limit {
                    tracing::info!("log pipe {} reached its limit", pipe.lid);
                    break 'outer;
                }
            }
        }
        Ok(())
    }

    /// Streams the current status and every subsequent transition into the
    /// pipe until it is cancelled or the event stream closes.
    pub async fn pipe_status(&self, docker: &Docker, pipe: &Pipe) -> Result<()> {
        let cid = self.runtime_id(docker).await?;
        let initial = self.status(docker).await?;
        pipe.send(serde_json::to_value(StatusUpdate { status: initial })?)
            .await?;

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("container".to_string(), vec![cid]);
        let mut events = docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));

        loop {
            let item = tokio::select! {
                _ = pipe.cancelled() => return Ok(()),
                item = events.next() => item,
            };
            let Some(item) = item else { return Ok(()) };
            let event = item.context("reading event stream")?;
            if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
                continue;
            }
            let Some(action) = event.action.as_deref() else {
                continue;
            };
            let Some(status) = normalize_event_action(action) else {
                continue;
            };
            pipe.send(serde_json::to_value(StatusUpdate {
                status: status.to_string(),
            })?)
            .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe(capacity: usize) -> (Pipe, mpsc::Receiver<Forward>) {
        let (tx, rx) = mpsc::channel(capacity);
        let open = PipeOpen {
            lid: "L1".to_string(),
            event: Event::Log,
            filter: serde_json::json!({"container": "x"}),
        };
        (Pipe::new(open, tx), rx)
    }

    // =========================================================================
    // Frames
    // =========================================================================

    #[test]
    fn test_event_wire_names() {
        assert_eq!(serde_json::to_value(Event::Log).unwrap(), "log");
        assert_eq!(serde_json::to_value(Event::Git).unwrap(), "git");
        let event: Event = serde_json::from_str("\"password\"").unwrap();
        assert_eq!(event, Event::Password);
    }

    #[test]
    fn test_package_shape() {
        let (pipe, _rx) = test_pipe(1);
        let frame = pipe.package(serde_json::json!({"content": "hi"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["lid"], "L1");
        assert_eq!(value["event"], "log");
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(value["end"], false);
    }

    #[test]
    fn test_pipe_open_decode() {
        let open: PipeOpen = serde_json::from_str(
            r#"{"lid":"L1","event":"log","filter":{"container":"x","limit":2}}"#,
        )
        .unwrap();
        assert_eq!(open.lid, "L1");
        assert_eq!(open.event, Event::Log);
        let filter: LogFilter = serde_json::from_value(open.filter).unwrap();
        assert_eq!(filter.container, "x");
        assert_eq!(filter.limit, 2);
        assert_eq!(filter.since, 0);
    }

    #[test]
    fn test_git_filter_decode() {
        let filter: GitFilter = serde_json::from_str(
            r#"{"container":"x","uri":"o/r","token":"t","branch":"main","domain":"github.com"}"#,
        )
        .unwrap();
        assert_eq!(filter.uri, "o/r");
        assert_eq!(filter.domain, "github.com");
        assert!(!filter.reset_data);
    }

    // =========================================================================
    // End gate
    // =========================================================================

    #[tokio::test]
    async fn test_end_emits_single_terminal_frame() {
        let (pipe, mut rx) = test_pipe(8);
        pipe.end().await;
        pipe.end().await;
        pipe.end().await;

        let frame = rx.recv().await.unwrap();
        assert!(frame.end);
        assert!(frame.data.is_none());
        assert_eq!(frame.lid, "L1");
        // No second terminal frame.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_end_is_dropped() {
        let (pipe, mut rx) = test_pipe(8);
        pipe.end().await;
        pipe.send(serde_json::json!({"content": "late"})).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert!(frame.end);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_cancels_token() {
        let (pipe, _rx) = test_pipe(8);
        assert!(!pipe.is_ended());
        pipe.end().await;
        assert!(pipe.is_ended());
        // Resolves immediately once cancelled.
        pipe.cancelled().await;
    }

    #[tokio::test]
    async fn test_clones_share_the_gate() {
        let (pipe, mut rx) = test_pipe(8);
        let clone = pipe.clone();
        pipe.end().await;
        clone.end().await;
        assert!(clone.is_ended());

        assert!(rx.recv().await.unwrap().end);
        assert!(rx.try_recv().is_err());
    }

    // =========================================================================
    // Log parsing and status normalization
    // =========================================================================

    #[test]
    fn test_parse_log_line() {
        let (timestamp, content) = parse_log_line("1970-01-01T00:00:01.500Z hello world").unwrap();
        assert_eq!(timestamp, 1500);
        assert_eq!(content, "hello world");
    }

    #[test]
    fn test_parse_log_line_nanosecond_precision() {
        let (timestamp, _) =
            parse_log_line("2024-01-15T10:30:00.123456789Z payload").unwrap();
        let expected = chrono::DateTime::parse_from_rfc3339("2024-01-15T10:30:00.123456789Z")
            .unwrap()
            .timestamp_millis();
        assert_eq!(timestamp, expected);
    }

    #[test]
    fn test_parse_log_line_rejects_malformed() {
        assert!(parse_log_line("no-space-here").is_none());
        assert!(parse_log_line("not-a-timestamp content").is_none());
    }

    #[test]
    fn test_normalize_event_actions() {
        assert_eq!(normalize_event_action("start"), Some("running"));
        assert_eq!(normalize_event_action("die"), Some("exited"));
        assert_eq!(normalize_event_action("unpause"), Some("running"));
        assert_eq!(normalize_event_action("oom"), Some("dead"));
        assert_eq!(normalize_event_action("exec_die"), Some("running"));
        assert_eq!(normalize_event_action("top"), None);
    }
}
