//! Realtime change stream
//!
//! Keeps a long-lived WebSocket connection to the realtime endpoint and
//! forwards row changes of the `points` table as [`RemoteChange`]s.
//! Reconnects automatically with exponential backoff.

pub mod message;

use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::remote::RemoteChange;
use message::{parse_change, PhoenixMessage, EVENT_CLOSE, EVENT_ERROR};

/// Commands sent to the realtime task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeCommand {
    Shutdown,
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, not trying
    Disconnected,
    /// Opening the socket or joining the channel
    Connecting,
    /// Channel joined, changes are flowing
    Joined,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Realtime base URL, e.g. `ws://localhost:8000/realtime/v1`
    pub url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub schema: String,
    pub table: String,
    pub heartbeat_interval: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            schema: "public".to_string(),
            table: "points".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Full socket URL with the project key and protocol version
    pub fn socket_url(&self) -> String {
        format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            self.url.trim_end_matches('/'),
            self.api_key
        )
    }

    fn topic(&self) -> String {
        format!("realtime:{}", self.table)
    }
}

/// Handle to control the realtime task
pub struct RealtimeHandle {
    command_tx: mpsc::Sender<RealtimeCommand>,
    /// Watch connection status
    pub status_rx: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    /// Stop the task and wait for it to close the socket
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(RealtimeCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Realtime task ended abnormally: {}", e);
        }
    }
}

/// Spawn the realtime task
///
/// Changes are forwarded on `changes_tx`; the task stops when the receiver
/// is dropped or on shutdown.
pub fn spawn_realtime(config: RealtimeConfig, changes_tx: mpsc::Sender<RemoteChange>) -> RealtimeHandle {
    let (command_tx, command_rx) = mpsc::channel(4);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

    let task = tokio::spawn(realtime_loop(config, command_rx, changes_tx, status_tx));

    RealtimeHandle {
        command_tx,
        status_rx,
        task,
    }
}

/// Reconnection delay, doubling up to a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn delay(&self) -> Duration {
        self.current
    }

    fn grow(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why a connection ended without error
enum Exit {
    Closed,
    Shutdown,
}

/// Main loop with reconnection
async fn realtime_loop(
    config: RealtimeConfig,
    mut command_rx: mpsc::Receiver<RealtimeCommand>,
    changes_tx: mpsc::Sender<RemoteChange>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut backoff = Backoff::new(config.initial_reconnect_delay, config.max_reconnect_delay);

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        let exit = connect_and_listen(&config, &mut command_rx, &changes_tx, &status_tx, &mut backoff);
        match exit.await {
            Ok(Exit::Shutdown) => break,
            Ok(Exit::Closed) => info!("Realtime connection closed"),
            Err(e) => warn!("Realtime connection error: {}", e),
        }

        let _ = status_tx.send(ConnectionStatus::Disconnected);
        debug!("Reconnecting to realtime in {:?}", backoff.delay());

        tokio::select! {
            _ = tokio::time::sleep(backoff.delay()) => backoff.grow(),
            cmd = command_rx.recv() => {
                match cmd {
                    Some(RealtimeCommand::Shutdown) | None => break,
                }
            }
        }
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
}

/// Connect, join the channel, and forward changes until disconnection
///
/// The backoff restarts from its initial delay once the channel is joined.
async fn connect_and_listen(
    config: &RealtimeConfig,
    command_rx: &mut mpsc::Receiver<RealtimeCommand>,
    changes_tx: &mpsc::Sender<RemoteChange>,
    status_tx: &watch::Sender<ConnectionStatus>,
    backoff: &mut Backoff,
) -> Result<Exit> {
    let (ws_stream, _) = connect_async(config.socket_url()).await?;
    let (mut write, mut read) = ws_stream.split();

    let topic = config.topic();
    let token = config.access_token.as_deref().unwrap_or(&config.api_key);
    let mut next_ref: u64 = 1;

    let join_ref = next_ref;
    next_ref += 1;
    let join = PhoenixMessage::join(&topic, &config.schema, &config.table, token, join_ref);
    write.send(Message::Text(join.encode()?)).await?;

    // Wait for the join reply
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = PhoenixMessage::decode(&text) else {
                            continue;
                        };
                        if frame.is_ok_reply(join_ref) {
                            break;
                        }
                        if frame.is_error_reply(join_ref) {
                            anyhow::bail!("Realtime join refused: {}", frame.payload);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("Realtime server closed connection during join");
                    }
                    Some(Err(e)) => anyhow::bail!("Realtime connection error: {}", e),
                    _ => {}
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                anyhow::bail!("Timeout joining {}. Check that the realtime server is running.", topic);
            }
        }
    }

    info!("Joined realtime channel {}", topic);
    let _ = status_tx.send(ConnectionStatus::Joined);
    backoff.reset();

    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(RealtimeCommand::Shutdown) | None => {
                        write.close().await.ok();
                        return Ok(Exit::Shutdown);
                    }
                }
            }

            _ = heartbeat.tick() => {
                let beat = PhoenixMessage::heartbeat(next_ref);
                next_ref += 1;
                write.send(Message::Text(beat.encode()?)).await?;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match PhoenixMessage::decode(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Ignoring undecodable realtime frame: {}", e);
                                continue;
                            }
                        };
                        if frame.topic == topic && (frame.event == EVENT_ERROR || frame.event == EVENT_CLOSE) {
                            anyhow::bail!("Realtime channel {} closed by server ({})", topic, frame.event);
                        }
                        match parse_change(&frame, &config.table) {
                            Ok(Some(change)) => {
                                debug!("Realtime change for {}", change.id());
                                if changes_tx.send(change).await.is_err() {
                                    write.close().await.ok();
                                    return Ok(Exit::Shutdown);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Skipping realtime change: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}
