//! Persistent hub connection: handshake, keep-alive, invocation completions
//! and automatic reconnection.
//!
//! The connection runs in one spawned task. Invocations are queued on an
//! mpsc channel that is only drained while connected, so anything issued
//! during `Connecting` or `Reconnecting` goes out once the handshake
//! completes.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{
    handshake_request, parse_handshake_response, split_records, HubFrame,
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
};

const OUTBOUND_QUEUE: usize = 256;
const INBOUND_BUFFER: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const FALLBACK_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        Self {
            delays,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (zero based). The last configured
    /// delay repeats; `None` once the attempt cap is reached.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(
            self.delays
                .get(attempt as usize)
                .or_else(|| self.delays.last())
                .copied()
                .unwrap_or(FALLBACK_RECONNECT_DELAY),
        )
    }
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub url: Url,
    pub session_cookie: Option<String>,
    pub connect_timeout: Duration,
    pub invocation_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl HubOptions {
    pub fn from_settings(url: Url, settings: &ClientSettings) -> Self {
        Self {
            url,
            session_cookie: settings.session_cookie.clone(),
            connect_timeout: settings.connect_timeout,
            invocation_timeout: settings.send_timeout,
            keep_alive_interval: settings.keep_alive_interval,
            server_timeout: settings.server_timeout,
            reconnect: ReconnectPolicy::new(
                settings.reconnect_delays.clone(),
                settings.max_reconnect_attempts,
            ),
        }
    }
}

/// A server-to-client invocation, before any target-specific decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundInvocation {
    pub target: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug)]
enum InvocationFailure {
    Hub(String),
    Lost,
}

type Reply = oneshot::Sender<Result<Value, InvocationFailure>>;

struct Outbound {
    target: String,
    arguments: Vec<Value>,
    reply: Option<Reply>,
}

/// Cloneable sending half of a [`HubConnection`].
#[derive(Clone)]
pub struct HubInvoker {
    outbound: mpsc::Sender<Outbound>,
    invocation_timeout: Duration,
}

impl HubInvoker {
    /// Invokes `target` and waits for its completion record.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> ClientResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                target: target.to_string(),
                arguments,
                reply: Some(tx),
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;

        match timeout(self.invocation_timeout, rx).await {
            Err(_) => Err(ClientError::InvocationTimeout {
                target: target.to_string(),
                timeout: self.invocation_timeout,
            }),
            Ok(Err(_)) | Ok(Ok(Err(InvocationFailure::Lost))) => Err(ClientError::ConnectionLost {
                target: target.to_string(),
            }),
            Ok(Ok(Err(InvocationFailure::Hub(message)))) => Err(ClientError::Invocation {
                target: target.to_string(),
                message,
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Queues a non-blocking invocation; no completion is requested.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> ClientResult<()> {
        self.outbound
            .send(Outbound {
                target: target.to_string(),
                arguments,
                reply: None,
            })
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

pub struct HubConnection {
    url: Url,
    state: Arc<watch::Sender<ConnectionState>>,
    invoker: HubInvoker,
    inbound: broadcast::Sender<InboundInvocation>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HubConnection {
    /// Spawns the connection task. `state` is shared with the owner so the
    /// signal outlives individual connections.
    pub fn start(options: HubOptions, state: Arc<watch::Sender<ConnectionState>>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, _) = broadcast::channel(INBOUND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        state.send_replace(ConnectionState::Connecting);
        let url = options.url.clone();
        let invoker = HubInvoker {
            outbound: outbound_tx,
            invocation_timeout: options.invocation_timeout,
        };
        let task = tokio::spawn(run_connection(
            options,
            Arc::clone(&state),
            outbound_rx,
            inbound_tx.clone(),
            shutdown_rx,
        ));

        Self {
            url,
            state,
            invoker,
            inbound: inbound_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// True once the task has ended without [`Self::close`], after a server
    /// close or exhausted reconnect attempts.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished() || self.state() == ConnectionState::Disconnected
    }

    pub fn invoker(&self) -> HubInvoker {
        self.invoker.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundInvocation> {
        self.inbound.subscribe()
    }

    /// Stops the connection, including one that is still mid-handshake or
    /// waiting out a reconnect delay.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!(url = %self.url, "hub: connection task did not stop in time; aborting");
            task.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

enum SessionEnd {
    Shutdown,
    ClosedByServer {
        error: Option<String>,
        allow_reconnect: bool,
    },
    Lost(String),
}

async fn run_connection(
    options: HubOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: broadcast::Sender<InboundInvocation>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        let waiting_state = if ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        state.send_replace(waiting_state);

        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = timeout(options.connect_timeout, establish(&options)) => result,
        };

        match connected {
            Ok(Ok((socket, leftover))) => {
                attempt = 0;
                ever_connected = true;
                state.send_replace(ConnectionState::Connected);
                info!(url = %options.url, "hub: connected");

                match drive(
                    socket,
                    leftover,
                    &options,
                    &mut outbound,
                    &inbound,
                    &mut shutdown,
                )
                .await
                {
                    SessionEnd::Shutdown => break,
                    SessionEnd::ClosedByServer {
                        error,
                        allow_reconnect: false,
                    } => {
                        warn!(url = %options.url, error = ?error, "hub: server closed the connection");
                        break;
                    }
                    SessionEnd::ClosedByServer { error, .. } => {
                        warn!(url = %options.url, error = ?error, "hub: server closed the connection; reconnecting");
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(url = %options.url, %reason, "hub: connection lost; reconnecting");
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(url = %options.url, attempt, error = %err, "hub: connect failed");
            }
            Err(_) => {
                let err = ClientError::ConnectTimeout {
                    url: options.url.to_string(),
                    timeout: options.connect_timeout,
                };
                warn!(attempt, error = %err, "hub: connect failed");
            }
        }

        let Some(delay) = options.reconnect.next_delay(attempt) else {
            warn!(url = %options.url, attempt, "hub: reconnect attempts exhausted");
            break;
        };
        attempt += 1;
        state.send_replace(if ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
        debug!(url = %options.url, ?delay, attempt, "hub: waiting before reconnect");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(delay) => {}
        }
    }

    outbound.close();
    while let Ok(command) = outbound.try_recv() {
        if let Some(reply) = command.reply {
            let _ = reply.send(Err(InvocationFailure::Lost));
        }
    }
    state.send_replace(ConnectionState::Disconnected);
    info!(url = %options.url, "hub: disconnected");
}

/// Opens the websocket and completes the protocol handshake. Records that
/// arrive in the same frame as the handshake reply are handed back.
async fn establish(options: &HubOptions) -> ClientResult<(HubSocket, Vec<String>)> {
    let mut request = options.url.as_str().into_client_request()?;
    if let Some(cookie) = &options.session_cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|err| anyhow::anyhow!("session cookie is not a valid header value: {err}"))?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (mut socket, _) = connect_async(request).await?;
    socket.send(Message::Text(handshake_request())).await?;

    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = split_records(&text);
                let Some(reply) = records.next() else {
                    continue;
                };
                parse_handshake_response(reply)?;
                let leftover = records.map(str::to_string).collect();
                return Ok((socket, leftover));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(anyhow::anyhow!("hub closed the socket during handshake").into());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

async fn drive(
    socket: HubSocket,
    leftover: Vec<String>,
    options: &HubOptions,
    outbound: &mut mpsc::Receiver<Outbound>,
    inbound: &broadcast::Sender<InboundInvocation>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut writer, mut reader) = socket.split();
    let mut pending: HashMap<String, Reply> = HashMap::new();
    let mut next_invocation_id: u64 = 0;
    let mut last_received = Instant::now();
    let mut keep_alive = interval_at(
        Instant::now() + options.keep_alive_interval,
        options.keep_alive_interval,
    );
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut early_end = None;
    for record in &leftover {
        if let Some(end) = handle_record(record, inbound, &mut pending) {
            early_end = Some(end);
            break;
        }
    }

    let end = match early_end {
        Some(end) => end,
        None => loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                frame = reader.next() => {
                    last_received = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let ended = split_records(&text)
                                .find_map(|record| handle_record(record, inbound, &mut pending));
                            if let Some(end) = ended {
                                break end;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break SessionEnd::Lost("socket closed".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break SessionEnd::Lost(err.to_string()),
                    }
                }
                command = outbound.recv() => {
                    let Some(command) = command else {
                        let _ = writer.send(Message::Close(None)).await;
                        break SessionEnd::Shutdown;
                    };
                    if command.reply.as_ref().is_some_and(|reply| reply.is_closed()) {
                        debug!(method = %command.target, "hub: dropping invocation abandoned by caller");
                        continue;
                    }
                    let invocation_id = command.reply.as_ref().map(|_| {
                        next_invocation_id += 1;
                        next_invocation_id.to_string()
                    });
                    let frame = HubFrame::invocation(
                        invocation_id.clone(),
                        command.target.clone(),
                        command.arguments,
                    );
                    if let Err(err) = writer.send(Message::Text(frame.encode())).await {
                        if let Some(reply) = command.reply {
                            let _ = reply.send(Err(InvocationFailure::Lost));
                        }
                        break SessionEnd::Lost(err.to_string());
                    }
                    if let (Some(id), Some(reply)) = (invocation_id, command.reply) {
                        pending.insert(id, reply);
                    }
                }
                _ = keep_alive.tick() => {
                    if last_received.elapsed() >= options.server_timeout {
                        break SessionEnd::Lost(format!(
                            "no frame from server within {:?}",
                            options.server_timeout
                        ));
                    }
                    if let Err(err) = writer.send(Message::Text(HubFrame::Ping.encode())).await {
                        break SessionEnd::Lost(err.to_string());
                    }
                }
            }
        },
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(InvocationFailure::Lost));
    }
    end
}

fn handle_record(
    record: &str,
    inbound: &broadcast::Sender<InboundInvocation>,
    pending: &mut HashMap<String, Reply>,
) -> Option<SessionEnd> {
    let frame = match HubFrame::decode(record) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "hub: dropping malformed record");
            return None;
        }
    };

    match frame {
        HubFrame::Invocation {
            invocation_id,
            target,
            arguments,
        } => {
            if invocation_id.is_some() {
                debug!(method = %target, "hub: server expects a result; client handlers return none");
            }
            // No subscriber simply means nobody is listening yet.
            let _ = inbound.send(InboundInvocation { target, arguments });
        }
        HubFrame::Completion {
            invocation_id,
            result,
            error,
        } => match pending.remove(&invocation_id) {
            Some(reply) => {
                let outcome = match error {
                    Some(error) => Err(InvocationFailure::Hub(error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(outcome);
            }
            None => debug!(%invocation_id, "hub: completion for unknown invocation"),
        },
        HubFrame::Ping => {}
        HubFrame::Close {
            error,
            allow_reconnect,
        } => {
            return Some(SessionEnd::ClosedByServer {
                error,
                allow_reconnect,
            })
        }
        HubFrame::Unsupported(kind) => debug!(kind, "hub: ignoring unsupported record type"),
    }
    None
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
