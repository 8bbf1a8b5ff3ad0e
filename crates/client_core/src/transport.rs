use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use shared::{
    domain::{Message, MessageId, UserId},
    protocol::{send_message_arguments, HubEvent, SEND_MESSAGE},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    hub::{ConnectionState, HubConnection, HubOptions, InboundInvocation},
};

const MESSAGE_BUFFER: usize = 256;

/// The counterpart the chat session is currently scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub counterpart: UserId,
    pub generation: u64,
}

impl SessionHandle {
    /// Only messages from the open counterpart belong in the active thread.
    pub fn accepts(&self, message: &Message) -> bool {
        message.sender_id == self.counterpart
    }
}

struct ActiveHub {
    hub: HubConnection,
    pump: JoinHandle<()>,
}

/// Chat-channel session on top of one multiplexed hub connection.
///
/// `open` retargets the session to a new counterpart without a new
/// handshake; every inbound `ReceiveMessage` carries its sender, so one
/// connection serves all threads.
pub struct ChatTransport {
    local_user: UserId,
    options: HubOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Mutex<Option<ActiveHub>>,
    session: Mutex<Option<SessionHandle>>,
    generation: AtomicU64,
    messages: broadcast::Sender<Message>,
}

impl ChatTransport {
    pub fn new(local_user: UserId, options: HubOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            local_user,
            options,
            state: Arc::new(state),
            active: Mutex::new(None),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            messages,
        }
    }

    /// Starts the hub connection if it is not running, replacing one that
    /// stopped on its own. Returns immediately; progress is visible through
    /// [`Self::connection_state`].
    pub async fn connect(&self) {
        let mut active = self.active.lock().await;
        self.restart_if_stopped(&mut active).await;
        if active.is_none() {
            *active = Some(self.start_hub());
        }
    }

    /// Drops a hub whose task has ended and starts a fresh one in its place.
    async fn restart_if_stopped(&self, active: &mut Option<ActiveHub>) {
        if !active.as_ref().is_some_and(|running| running.hub.is_stopped()) {
            return;
        }
        if let Some(stopped) = active.take() {
            warn!(url = %stopped.hub.url(), "transport: chat session had stopped; restarting");
            stopped.pump.abort();
            stopped.hub.close().await;
            *active = Some(self.start_hub());
        }
    }

    fn start_hub(&self) -> ActiveHub {
        let hub = HubConnection::start(self.options.clone(), Arc::clone(&self.state));
        let pump = tokio::spawn(pump_messages(
            hub.subscribe(),
            self.local_user.clone(),
            self.messages.clone(),
        ));
        info!(url = %hub.url(), "transport: chat session started");
        ActiveHub { hub, pump }
    }

    /// Scopes the session to `counterpart`, replacing any previous scope.
    pub async fn open(&self, counterpart: UserId) -> SessionHandle {
        self.connect().await;
        let handle = SessionHandle {
            counterpart,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let previous = self.session.lock().await.replace(handle.clone());
        match previous {
            Some(previous) if previous.counterpart != handle.counterpart => info!(
                from = %previous.counterpart,
                to = %handle.counterpart,
                "transport: session retargeted"
            ),
            Some(_) => debug!(counterpart = %handle.counterpart, "transport: session reopened"),
            None => info!(counterpart = %handle.counterpart, "transport: session opened"),
        }
        handle
    }

    pub async fn current_session(&self) -> Option<SessionHandle> {
        self.session.lock().await.clone()
    }

    /// Sends `body` to `receiver_id` and waits for the hub's completion,
    /// returning the server id when the hub reports one. Sends issued before
    /// the connection is up are queued, not dropped.
    pub async fn send(&self, receiver_id: &UserId, body: &str) -> ClientResult<Option<MessageId>> {
        let invoker = {
            let mut active = self.active.lock().await;
            self.restart_if_stopped(&mut active).await;
            active
                .as_ref()
                .map(|active| active.hub.invoker())
                .ok_or(ClientError::NotConnected)?
        };
        invoker
            .invoke(SEND_MESSAGE, send_message_arguments(receiver_id, body))
            .await
            .map(|result| completion_message_id(&result))
    }

    /// Subscribes to every inbound chat message, whatever the open thread.
    pub fn on_message(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Tears the session down, cancelling a handshake still in progress.
    pub async fn close(&self) {
        self.session.lock().await.take();
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.pump.abort();
            active.hub.close().await;
            info!("transport: chat session closed");
        }
    }
}

/// Hubs answer `SendMessage` with nothing, a bare id, or the stored record.
fn completion_message_id(result: &Value) -> Option<MessageId> {
    match result {
        Value::String(id) if !id.is_empty() => Some(MessageId::from(id.as_str())),
        Value::Number(id) => Some(MessageId::new(id.to_string())),
        Value::Object(record) => record
            .get("messageId")
            .or_else(|| record.get("id"))
            .and_then(completion_message_id),
        _ => None,
    }
}

async fn pump_messages(
    inbound: broadcast::Receiver<InboundInvocation>,
    local_user: UserId,
    messages: broadcast::Sender<Message>,
) {
    let mut inbound = BroadcastStream::new(inbound);
    while let Some(next) = inbound.next().await {
        let invocation = match next {
            Ok(invocation) => invocation,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "transport: inbound chat events lagged");
                continue;
            }
        };

        match HubEvent::from_invocation(&invocation.target, &invocation.arguments) {
            Ok(HubEvent::MessageReceived { sender_id, body }) => {
                let message = Message::received(sender_id, local_user.clone(), body, Utc::now());
                let _ = messages.send(message);
            }
            Ok(HubEvent::NotificationReceived(_)) => {
                debug!("transport: notification on chat channel ignored");
            }
            Ok(HubEvent::Unknown { target }) => {
                debug!(method = %target, "transport: unhandled hub method");
            }
            Err(err) => warn!(error = %err, "transport: malformed chat event"),
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
