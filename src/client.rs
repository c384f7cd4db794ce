//! Protocol engine.
//!
//! Owns the WebSocket to the control plane and everything running over it:
//!
//! - a **reader** task decoding inbound frames under a 60 s deadline and
//!   routing them by shape (reply / server action / pipe control);
//! - a single **writer** task draining two bounded queues (requests plus
//!   heartbeat pings, and pipe forwards) under a 10 s per-write deadline;
//! - a **heartbeat** task enqueueing a ping every 30 s;
//! - one task per inbound server action and per open pipe, so a slow
//!   handler never blocks the reader.
//!
//! Requests are correlated through a mutex-guarded `rid → reply slot` map
//! with a 5 s deadline; the requester owns both insertion and removal, so
//! a late reply simply finds no slot and is dropped. When any engine task
//! exits the rest are cancelled and `run` returns the connection-closed
//! error; the caller reconnects.

use anyhow::{Context, Result};
use bollard::Docker;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::action::{self, ActionEnvelope};
use crate::config;
use crate::container::Container;
use crate::errors::SupervisorError;
use crate::hardware;
use crate::machine::{Machine, Session};
use crate::pipe::{
    Event, Forward, GenericFilter, GitFilter, GitPayload, LogFilter, PasswordPayload, Pipe,
    PipeOpen,
};
use crate::proto::{self, Incoming, Msg, Reply, Shape};
use crate::user;

/// Deadline for a reply to an outbound request.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Heartbeat ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline, reset by any inbound frame (pongs included).
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Per-write deadline; a miss kills the connection.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Capacity of the request and forward queues.
const QUEUE_CAPACITY: usize = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Outbound traffic on the request queue.
#[derive(Debug, Clone)]
enum Outbound {
    Request(Msg),
    Ping,
}

/// The connected engine. Clones share all state.
#[derive(Clone)]
pub struct Client {
    docker: Docker,
    machine: Arc<Mutex<Machine>>,
    machine_id: Arc<RwLock<Option<String>>>,
    callbacks: Arc<Mutex<HashMap<String, mpsc::Sender<Reply>>>>,
    pipes: Arc<Mutex<HashMap<String, Pipe>>>,
    send_tx: mpsc::Sender<Outbound>,
    forward_tx: mpsc::Sender<Forward>,
    shutdown: CancellationToken,
}

impl Client {
    /// Connects, performs the handshake and serves the connection until it
    /// dies. Always returns an error; the supervisor loop reconnects.
    pub async fn run(docker: Docker) -> Result<()> {
        let machine = Machine::discover(&docker).await?;

        let endpoint = config::endpoint();
        tracing::info!("connecting to {endpoint}");
        let url = format!("{}/?key={}", endpoint, machine.key);
        let (ws, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(pair) => pair,
            Err(e) => {
                // Transient: the caller retries, unlike probe failures
                // which surface as fatal startup errors above.
                tracing::error!("dial failed: {e}");
                return Err(SupervisorError::ConnectionClosed.into());
            }
        };
        let (sink, stream) = ws.split();

        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (forward_tx, forward_rx) = mpsc::channel(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let client = Client {
            docker,
            machine: Arc::new(Mutex::new(machine)),
            machine_id: Arc::new(RwLock::new(None)),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            pipes: Arc::new(Mutex::new(HashMap::new())),
            send_tx: send_tx.clone(),
            forward_tx,
            shutdown: shutdown.clone(),
        };

        let writer_handle = tokio::spawn(writer(sink, send_rx, forward_rx, shutdown.clone()));
        let reader_handle = {
            let client = client.clone();
            tokio::spawn(async move { client.reader(stream).await })
        };
        let heartbeat_handle = tokio::spawn(heartbeat(send_tx, shutdown.clone()));

        let startup = async {
            client.handshake().await?;
            client.process_actions().await
        };
        if let Err(e) = startup.await {
            tracing::error!("startup sequence failed: {e:#}");
            shutdown.cancel();
        }

        // Serve until the reader, the writer or a failed startup cancels.
        shutdown.cancelled().await;

        // Brief drain window before the tasks are reaped.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = writer_handle.await;
        let _ = reader_handle.await;
        let _ = heartbeat_handle.await;
        tracing::info!("connection closed");
        Err(SupervisorError::ConnectionClosed.into())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Sends `machine.<action>` and waits for the correlated reply.
    pub async fn send_and_wait<T: DeserializeOwned>(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let rid = proto::new_rid();
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.callbacks.lock().await.insert(rid.clone(), reply_tx);

        let result = async {
            let msg = Msg {
                action: format!("machine.{action}"),
                params,
                rid: rid.clone(),
            };
            self.send_tx
                .send(Outbound::Request(msg))
                .await
                .map_err(|_| anyhow::Error::from(SupervisorError::ConnectionClosed))?;

            match tokio::time::timeout(RESPONSE_TIMEOUT, reply_rx.recv()).await {
                Err(_) => Err(SupervisorError::ReplyTimeout.into()),
                Ok(None) => Err(SupervisorError::ConnectionClosed.into()),
                Ok(Some(reply)) => {
                    let value = reply.result.unwrap_or(serde_json::Value::Null);
                    serde_json::from_value(value).context("decoding reply result")
                }
            }
        }
        .await;

        // The requester owns the slot: removed on success and timeout
        // alike, so late replies fall on the floor.
        self.callbacks.lock().await.remove(&rid);
        result
    }

    /// Sends on the machine-id path assigned by the handshake.
    pub async fn machine_send_and_wait<T: DeserializeOwned>(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let id = self
            .machine_id
            .read()
            .await
            .clone()
            .context("machine id not assigned")?;
        self.send_and_wait(&format!("{id}.{action}"), params).await
    }

    /// Sends on a container's action path.
    pub async fn container_send_and_wait<T: DeserializeOwned>(
        &self,
        container_id: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.machine_send_and_wait(&format!("container.{container_id}.{action}"), params)
            .await
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn handshake(&self) -> Result<()> {
        let key = self.machine.lock().await.key.clone();
        let session: Session = self
            .send_and_wait("session", serde_json::json!({ "key": key }))
            .await
            .context("session handshake failed")?;
        *self.machine_id.write().await = Some(session.machine.id.clone());
        self.machine.lock().await.id = Some(session.machine.id.clone());
        tracing::info!("connected with session id {}", session.machine.id);

        self.send_hardware().await?;
        self.sync_containers().await?;
        Ok(())
    }

    async fn send_hardware(&self) -> Result<()> {
        let hw = hardware::probe(&self.docker).await?;
        let _: serde_json::Value = self
            .machine_send_and_wait("update", serde_json::json!({ "hardware": hw }))
            .await
            .context("hardware update failed")?;
        tracing::info!("updated hardware");
        Ok(())
    }

    /// Fetches the desired container set, reconciles, acknowledges new
    /// containers and reports commits of branch-backed ones.
    async fn sync_containers(&self) -> Result<()> {
        let desired: Vec<Container> = self
            .machine_send_and_wait("containers", serde_json::json!({}))
            .await?;

        let created = {
            let mut machine = self.machine.lock().await;
            machine
                .update_containers(&self.docker, desired)
                .await
                .context("update containers failed")?
        };

        for container in &created {
            let _: serde_json::Value = self
                .machine_send_and_wait(
                    &format!("containers.{}.postcreate", container.id),
                    serde_json::json!({}),
                )
                .await
                .context("create container ack failed")?;
        }

        let branched: Vec<Container> = {
            let machine = self.machine.lock().await;
            machine
                .containers
                .iter()
                .filter(|c| c.branch.is_some())
                .cloned()
                .collect()
        };
        for container in branched {
            let commit = container
                .commit()
                .await
                .context("get container commit failed")?;
            let _: serde_json::Value = self
                .machine_send_and_wait(
                    &format!("containers.{}.commit", container.id),
                    serde_json::json!({ "commit": commit }),
                )
                .await
                .context("commit container request failed")?;
        }
        Ok(())
    }

    // =========================================================================
    // Queued actions
    // =========================================================================

    /// Fetches and executes the queued action list in server order.
    async fn process_actions(&self) -> Result<()> {
        let raw_actions: Vec<serde_json::Value> = self
            .machine_send_and_wait("actions", serde_json::json!({}))
            .await?;

        for raw in raw_actions {
            let mut envelope: ActionEnvelope = serde_json::from_value(raw.clone())
                .context("failed to decode action header")?;
            // Carry the in-memory first-commit gate onto the decoded copy
            // so an update does not start a container still awaiting its
            // first deploy.
            let expecting = self
                .machine
                .lock()
                .await
                .find_container(&envelope.container.id)
                .map(|c| c.expecting_first_commit)
                .unwrap_or(false);
            envelope.container.expecting_first_commit = expecting;

            let follow_up = match action::process(&envelope, &raw, &self.docker).await {
                Ok(follow_up) => follow_up,
                Err(e) => {
                    tracing::error!("error processing action {}: {e:#}", envelope.id);
                    None
                }
            };

            self.machine
                .lock()
                .await
                .apply_authoritative(&envelope.container);

            if let Some(follow_up) = follow_up {
                let result: Result<serde_json::Value> = self
                    .container_send_and_wait(
                        &envelope.container.id,
                        &follow_up.action,
                        follow_up.params,
                    )
                    .await;
                if let Err(e) = result {
                    tracing::error!("error processing action trigger {}: {e:#}", envelope.id);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    /// Reads frames until the deadline expires or the transport dies.
    async fn reader(self, mut stream: WsStream) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(PONG_WAIT, stream.next()) => next,
            };
            let Ok(next) = next else {
                tracing::error!("read deadline expired");
                break;
            };
            let Some(next) = next else {
                tracing::info!("transport closed");
                break;
            };
            match next {
                Ok(Message::Text(text)) => self.dispatch(&text).await,
                Ok(Message::Pong(_)) => tracing::trace!("received pong"),
                Ok(Message::Close(_)) => {
                    tracing::info!("server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("read error: {e}");
                    break;
                }
            }
        }
        self.shutdown.cancel();
    }

    /// Routes one inbound text frame. Never fatal: decode failures are
    /// logged and skipped.
    async fn dispatch(&self, text: &str) {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::error!("failed to decode incoming frame: {e}");
                return;
            }
        };
        match incoming.shape() {
            Shape::ServerAction => {
                let realm = incoming.realm.unwrap_or_default();
                let action = incoming.action.unwrap_or_default();
                let client = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.handle_server_action(&realm, &action).await {
                        tracing::error!("error handling message {realm}.{action}: {e:#}");
                    }
                });
            }
            Shape::PipeControl => self.handle_pipe_control(&incoming, text).await,
            Shape::Reply => {
                let reply: Reply = match serde_json::from_str(text) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::error!("failed to decode reply: {e}");
                        return;
                    }
                };
                let slot = self.callbacks.lock().await.get(&reply.rid).cloned();
                match slot {
                    Some(slot) => {
                        let _ = slot.try_send(reply);
                    }
                    None => tracing::debug!("dropping reply for unknown rid {}", reply.rid),
                }
            }
            Shape::Unknown => tracing::error!("unroutable inbound frame"),
        }
    }

    async fn handle_server_action(&self, realm: &str, action: &str) -> Result<()> {
        match (realm, action) {
            ("machine", "containers") => self.sync_containers().await,
            ("machine", "actions") => self.process_actions().await,
            _ => Err(SupervisorError::UnknownMessage.into()),
        }
    }

    /// Opens or closes a pipe.
    async fn handle_pipe_control(&self, incoming: &Incoming, text: &str) {
        let lid = incoming.lid.clone().unwrap_or_default();
        if incoming.close == Some(true) {
            let pipe = self.pipes.lock().await.get(&lid).cloned();
            match pipe {
                Some(pipe) => {
                    pipe.end().await;
                    self.pipes.lock().await.remove(&lid);
                }
                None => tracing::error!("error while closing listener: unknown lid {lid}"),
            }
            return;
        }

        let open: PipeOpen = match serde_json::from_str(text) {
            Ok(open) => open,
            Err(e) => {
                tracing::error!("failed to decode listener: {e}");
                return;
            }
        };
        let pipe = Pipe::new(open, self.forward_tx.clone());
        self.pipes
            .lock()
            .await
            .insert(pipe.lid.clone(), pipe.clone());

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.handle_pipe(&pipe).await {
                tracing::error!("error handling listener {}: {e:#}", pipe.lid);
            }
            // Local completion and server close converge here: End is
            // idempotent and removal happens exactly once per entry.
            pipe.end().await;
            client.pipes.lock().await.remove(&pipe.lid);
        });
    }

    /// Runs one pipe to completion.
    async fn handle_pipe(&self, pipe: &Pipe) -> Result<()> {
        tracing::info!("handling listener {} ({:?})", pipe.lid, pipe.event);
        let generic: GenericFilter =
            serde_json::from_value(pipe.filter.clone()).unwrap_or_default();
        let container = self
            .machine
            .lock()
            .await
            .find_container(&generic.container)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("container not found"))?;

        match pipe.event {
            Event::Status => container.pipe_status(&self.docker, pipe).await,
            Event::Log => {
                let filter: LogFilter = serde_json::from_value(pipe.filter.clone())
                    .map_err(|_| anyhow::anyhow!("unknown log filter"))?;
                container
                    .pipe_logs(&self.docker, filter.since, filter.until, filter.limit, pipe)
                    .await
            }
            Event::Password => {
                let password = user::reset_password(&container.id).await?;
                pipe.send(serde_json::to_value(PasswordPayload { password })?)
                    .await
            }
            Event::Git => {
                let filter: GitFilter = serde_json::from_value(pipe.filter.clone())
                    .map_err(|_| anyhow::anyhow!("unknown git filter"))?;
                container
                    .pull(
                        &self.docker,
                        &filter.token,
                        &filter.uri,
                        &filter.branch,
                        &filter.domain,
                    )
                    .await?;
                self.machine.lock().await.clear_first_commit(&container.id);
                pipe.send(serde_json::to_value(GitPayload { deployed: true })?)
                    .await
            }
        }
    }
}

// =============================================================================
// Transport tasks
// =============================================================================

/// Single writer: drains the request queue (including heartbeat pings) and
/// the pipe forward queue serially under the per-write deadline.
async fn writer(
    mut sink: WsSink,
    mut send_rx: mpsc::Receiver<Outbound>,
    mut forward_rx: mpsc::Receiver<Forward>,
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = send_rx.recv() => match msg {
                None => break,
                Some(Outbound::Request(msg)) => write_json(&mut sink, &msg).await,
                Some(Outbound::Ping) => write_frame(&mut sink, Message::Ping(Vec::new())).await,
            },
            forward = forward_rx.recv() => match forward {
                None => break,
                Some(frame) => write_json(&mut sink, &frame).await,
            },
        };
        if let Err(e) = result {
            tracing::error!("write error: {e:#}");
            break;
        }
    }
    let _ = sink.close().await;
    shutdown.cancel();
}

async fn write_json<T: Serialize>(sink: &mut WsSink, value: &T) -> Result<()> {
    let text = serde_json::to_string(value).context("encoding outbound frame")?;
    write_frame(sink, Message::Text(text)).await
}

async fn write_frame(sink: &mut WsSink, message: Message) -> Result<()> {
    tokio::time::timeout(WRITE_WAIT, sink.send(message))
        .await
        .map_err(|_| anyhow::anyhow!("write deadline exceeded"))?
        .context("transport write failed")
}

/// Enqueues a ping every 30 s until the engine shuts down.
async fn heartbeat(send_tx: mpsc::Sender<Outbound>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    // The first tick is immediate; the handshake is traffic enough.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                tracing::debug!("sending ping");
                if send_tx.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
