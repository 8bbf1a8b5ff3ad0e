use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use futures::StreamExt;
use shared::domain::{
    Conversation, DeliveryStatus, InterestRequest, LocalIdentity, Message, UserId,
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod interest;
pub mod notifications;
pub mod thread;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

use api::{HttpMarketplaceApi, InterestView, MarketplaceApi};
use config::ClientSettings;
use directory::ConversationDirectory;
use error::{ClientError, ClientResult};
use hub::{ConnectionState, HubOptions};
use interest::InterestRequestBoard;
use notifications::{Alert, NotificationListener};
use thread::{InboundOutcome, MessageThread};
use transport::ChatTransport;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    /// A message entered the open thread, local or inbound.
    MessageAppended(Message),
    DeliveryUpdated {
        correlation_id: Uuid,
        status: DeliveryStatus,
    },
    ThreadLoaded {
        counterpart: UserId,
        messages: Vec<Message>,
    },
    ConversationsUpdated(Vec<Conversation>),
    ConversationTouched(Conversation),
    InterestRequestsUpdated(Vec<InterestRequest>),
    Notification(Alert),
    AlertExpired(Uuid),
    /// A failed user action, worded for display.
    Alert {
        message: String,
    },
    Error(String),
}

struct ChatState {
    directory: ConversationDirectory,
    thread: MessageThread,
}

/// The messaging surface for one signed-in user.
///
/// Directory and thread mutations all go through one lock and are applied
/// in event order. Network calls are made with the lock released.
pub struct MessagingClient {
    identity: LocalIdentity,
    settings: ClientSettings,
    api: Arc<dyn MarketplaceApi>,
    transport: ChatTransport,
    notifications: NotificationListener,
    interest: InterestRequestBoard,
    state: Mutex<ChatState>,
    /// Flipped under the state lock so selection and unmount serialize.
    mounted: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    /// Talks to the configured REST backend over HTTP.
    pub fn new(identity: LocalIdentity, settings: ClientSettings) -> ClientResult<Arc<Self>> {
        let api = Arc::new(HttpMarketplaceApi::new(&settings)?);
        Self::new_with_dependencies(identity, settings, api, InterestView::AsTarget)
    }

    pub fn new_with_dependencies(
        identity: LocalIdentity,
        settings: ClientSettings,
        api: Arc<dyn MarketplaceApi>,
        interest_view: InterestView,
    ) -> ClientResult<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let chat_options = HubOptions::from_settings(settings.chat_hub_url()?, &settings);
        let notification_options =
            HubOptions::from_settings(settings.notification_hub_url()?, &settings);

        Ok(Arc::new(Self {
            transport: ChatTransport::new(identity.user_id.clone(), chat_options),
            notifications: NotificationListener::new(
                notification_options,
                settings.alert_ttl,
                events.clone(),
            ),
            interest: InterestRequestBoard::new(
                identity.clone(),
                Arc::clone(&api),
                interest_view,
                events.clone(),
            ),
            identity,
            settings,
            api,
            state: Mutex::new(ChatState {
                directory: ConversationDirectory::new(),
                thread: MessageThread::new(),
            }),
            mounted: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            events,
        }))
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.connection_state()
    }

    pub fn interest_requests(&self) -> &InterestRequestBoard {
        &self.interest
    }

    pub fn notifications(&self) -> &NotificationListener {
        &self.notifications
    }

    /// Starts both hub sessions, loads the directory and interest list, and
    /// keeps the directory refreshed until [`Self::unmount`].
    pub async fn mount(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("client: already mounted");
            return;
        }

        // Subscribe before connecting so no early push is missed.
        let inbound = self.transport.on_message();
        let notifications = self.notifications.subscribe();
        let connection = self.transport.connection_state();
        self.transport.connect().await;
        self.notifications.start().await;

        tasks.push(self.spawn_inbound_pump(inbound));
        tasks.push(self.spawn_notification_router(notifications));
        tasks.push(self.spawn_connection_watch(connection));
        self.mounted.store(true, Ordering::SeqCst);

        if let Err(err) = self.refresh_directory().await {
            debug!(error = %err, "client: initial directory load failed");
        }
        if let Err(err) = self.interest.refresh().await {
            debug!(error = %err, "client: initial interest list load failed");
        }
        if self.settings.directory_refresh.is_zero() {
            debug!("client: periodic directory refresh disabled");
        } else {
            tasks.push(self.spawn_directory_refresh());
        }
        info!(user = %self.identity.user_id, "client: mounted");
    }

    pub async fn unmount(&self) {
        {
            let mut state = self.state.lock().await;
            self.mounted.store(false, Ordering::SeqCst);
            state.thread.clear();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }
        self.transport.close().await;
        self.notifications.stop().await;
        info!(user = %self.identity.user_id, "client: unmounted");
    }

    pub async fn refresh_directory(&self) -> ClientResult<Vec<Conversation>> {
        let fetched = match self.api.list_conversations().await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "client: conversation list refresh failed");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let conversations = {
            let mut state = self.state.lock().await;
            state.directory.replace(fetched);
            state.directory.list().to_vec()
        };
        debug!(count = conversations.len(), "client: conversation list refreshed");
        let _ = self
            .events
            .send(ClientEvent::ConversationsUpdated(conversations.clone()));
        Ok(conversations)
    }

    /// Conversations whose display name contains `query`, ignoring case.
    pub async fn conversations(&self, query: &str) -> Vec<Conversation> {
        self.state.lock().await.directory.filter(query)
    }

    pub async fn conversation(&self, counterpart: &UserId) -> Option<Conversation> {
        self.state.lock().await.directory.get(counterpart).cloned()
    }

    pub async fn open_counterpart(&self) -> Option<UserId> {
        self.state.lock().await.thread.counterpart().cloned()
    }

    pub async fn thread(&self) -> Vec<Message> {
        self.state.lock().await.thread.current().to_vec()
    }

    /// Opens the thread with `counterpart` and loads its history. Returns
    /// `false` when another selection superseded this one before the
    /// history arrived; the late result is discarded. Refused with
    /// [`ClientError::NotConnected`] outside `mount`/`unmount`.
    pub async fn select_counterpart(&self, counterpart: UserId) -> ClientResult<bool> {
        let ticket = {
            let mut state = self.state.lock().await;
            if !self.mounted.load(Ordering::SeqCst) {
                return Err(ClientError::NotConnected);
            }
            let ticket = state.thread.begin_load(counterpart.clone());
            // Held so concurrent selections retarget the session in order.
            self.transport.open(counterpart.clone()).await;
            ticket
        };

        let history = self.api.fetch_history(&counterpart).await;

        let mut state = self.state.lock().await;
        match history {
            Ok(records) => {
                let messages = records
                    .into_iter()
                    .map(|record| record.into_message(&self.identity.user_id))
                    .collect();
                if !state.thread.complete_load(ticket, messages) {
                    debug!(counterpart = %counterpart, "client: discarding superseded history");
                    return Ok(false);
                }
                let messages = state.thread.current().to_vec();
                drop(state);
                debug!(counterpart = %counterpart, count = messages.len(), "client: history loaded");
                let _ = self.events.send(ClientEvent::ThreadLoaded {
                    counterpart,
                    messages,
                });
                Ok(true)
            }
            Err(err) => {
                let current = state.thread.fail_load(ticket);
                drop(state);
                warn!(counterpart = %counterpart, error = %err, "client: history load failed");
                if current {
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Appends `body` to the open thread right away, then sends it. The
    /// returned message carries the final delivery status.
    pub async fn send_message(&self, body: &str) -> ClientResult<Message> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let (message, touched) = {
            let mut state = self.state.lock().await;
            let counterpart = state
                .thread
                .counterpart()
                .cloned()
                .ok_or(ClientError::NoOpenConversation)?;
            if state
                .directory
                .get(&counterpart)
                .is_some_and(|conversation| conversation.is_blocked)
            {
                return Err(ClientError::ConversationBlocked(counterpart));
            }

            let message = Message::local(
                self.identity.user_id.clone(),
                counterpart.clone(),
                body,
                Utc::now(),
            );
            state.thread.push_local(message.clone());
            let touched = state
                .directory
                .apply_local_update(&counterpart, body, message.sent_at)
                .then(|| state.directory.get(&counterpart).cloned())
                .flatten();
            (message, touched)
        };
        let _ = self.events.send(ClientEvent::MessageAppended(message.clone()));
        if let Some(conversation) = touched {
            let _ = self.events.send(ClientEvent::ConversationTouched(conversation));
        }

        let outcome = self.transport.send(&message.receiver_id, &message.body).await;
        let status = match &outcome {
            Ok(_) => DeliveryStatus::Delivered,
            Err(err) => {
                warn!(receiver = %message.receiver_id, error = %err, "client: send failed");
                DeliveryStatus::Failed
            }
        };

        if let Some(correlation_id) = message.correlation_id {
            {
                let mut state = self.state.lock().await;
                match &outcome {
                    Ok(message_id) => state.thread.confirm_local(correlation_id, message_id.clone()),
                    Err(_) => state.thread.mark_delivery(correlation_id, status),
                };
            }
            let _ = self.events.send(ClientEvent::DeliveryUpdated {
                correlation_id,
                status,
            });
        }

        outcome.map(|message_id| Message {
            message_id,
            delivery: status,
            ..message
        })
    }

    /// Records an inbound message: the directory always, the thread only
    /// when it comes from the open counterpart.
    async fn apply_inbound(&self, message: Message) {
        if message.sender_id == self.identity.user_id {
            debug!("client: ignoring echo of own message");
            return;
        }

        let (touched, outcome) = {
            let mut state = self.state.lock().await;
            let touched = state
                .directory
                .apply_local_update(&message.sender_id, &message.body, message.sent_at)
                .then(|| state.directory.get(&message.sender_id).cloned())
                .flatten();
            let outcome = state.thread.accept_inbound(message.clone());
            (touched, outcome)
        };

        if let Some(conversation) = touched {
            let _ = self.events.send(ClientEvent::ConversationTouched(conversation));
        }
        match outcome {
            InboundOutcome::Appended | InboundOutcome::Buffered => {
                let _ = self.events.send(ClientEvent::MessageAppended(message));
            }
            InboundOutcome::Duplicate => {
                debug!(sender = %message.sender_id, "client: duplicate message ignored");
            }
            InboundOutcome::NotOpen => {
                debug!(sender = %message.sender_id, "client: message for another thread");
            }
        }
    }

    fn spawn_inbound_pump(self: &Arc<Self>, inbound: broadcast::Receiver<Message>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut inbound = BroadcastStream::new(inbound);
            while let Some(next) = inbound.next().await {
                match next {
                    Ok(message) => client.apply_inbound(message).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: inbound messages lagged");
                    }
                }
            }
        })
    }

    fn spawn_notification_router(
        self: &Arc<Self>,
        notifications: broadcast::Receiver<shared::domain::Notification>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut notifications = BroadcastStream::new(notifications);
            while let Some(next) = notifications.next().await {
                match next {
                    Ok(notification) => {
                        client.interest.on_notification(&notification).await;
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: notifications lagged");
                    }
                }
            }
        })
    }

    fn spawn_connection_watch(
        self: &Arc<Self>,
        mut connection: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let state = *connection.borrow_and_update();
                debug!(?state, "client: chat connection state changed");
                let _ = events.send(ClientEvent::ConnectionStateChanged(state));
            }
        })
    }

    fn spawn_directory_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let period = self.settings.directory_refresh;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are already reported as events.
                let _ = client.refresh_directory().await;
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
