//! Notification hub session and the short-lived alerts it raises.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::{domain::Notification, protocol::HubEvent};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    hub::{ConnectionState, HubConnection, HubOptions, InboundInvocation},
    ClientEvent,
};

const NOTIFICATION_BUFFER: usize = 64;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: Uuid,
    pub notification: Notification,
    pub raised_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Alerts currently on screen. Dismissal is local only; the server never
/// hears about it.
#[derive(Debug)]
pub struct AlertBoard {
    ttl: chrono::Duration,
    alerts: Vec<Alert>,
}

impl AlertBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            alerts: Vec::new(),
        }
    }

    pub fn raise(&mut self, notification: Notification, now: DateTime<Utc>) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            notification,
            raised_at: now,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.alerts.push(alert.clone());
        alert
    }

    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|alert| alert.id != id);
        self.alerts.len() != before
    }

    /// Drops every alert whose deadline has passed and returns their ids.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        self.alerts.retain(|alert| {
            if alert.expires_at <= now {
                expired.push(alert.id);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn active(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn unread_count(&self) -> usize {
        self.alerts
            .iter()
            .filter(|alert| !alert.notification.is_read)
            .count()
    }
}

struct Running {
    hub: HubConnection,
    pump: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Independent hub session on the notification path.
pub struct NotificationListener {
    options: HubOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    alerts: Arc<Mutex<AlertBoard>>,
    sweep_interval: Duration,
    notifications: broadcast::Sender<Notification>,
    events: broadcast::Sender<ClientEvent>,
    running: Mutex<Option<Running>>,
}

impl NotificationListener {
    pub fn new(
        options: HubOptions,
        alert_ttl: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            options,
            state: Arc::new(state),
            alerts: Arc::new(Mutex::new(AlertBoard::new(alert_ttl))),
            sweep_interval: (alert_ttl / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL),
            notifications,
            events,
            running: Mutex::new(None),
        }
    }

    /// Starts the listener, or restarts it when its hub stopped on its own.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        match running.as_ref() {
            Some(current) if !current.hub.is_stopped() => return,
            Some(current) => {
                warn!(url = %current.hub.url(), "notifications: listener had stopped; restarting");
            }
            None => {}
        }
        if let Some(stopped) = running.take() {
            stopped.pump.abort();
            stopped.sweeper.abort();
            stopped.hub.close().await;
        }

        let hub = HubConnection::start(self.options.clone(), Arc::clone(&self.state));
        let pump = tokio::spawn(pump_notifications(
            hub.subscribe(),
            Arc::clone(&self.alerts),
            self.notifications.clone(),
            self.events.clone(),
        ));
        let sweeper = tokio::spawn(sweep_alerts(
            Arc::clone(&self.alerts),
            self.sweep_interval,
            self.events.clone(),
        ));
        info!(url = %hub.url(), "notifications: listener started");
        *running = Some(Running {
            hub,
            pump,
            sweeper,
        });
    }

    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.pump.abort();
            running.sweeper.abort();
            running.hub.close().await;
            info!("notifications: listener stopped");
        }
    }

    /// Every decoded notification, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn dismiss(&self, id: Uuid) -> bool {
        self.alerts.lock().await.dismiss(id)
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.active().to_vec()
    }

    pub async fn latest_unread_count(&self) -> usize {
        self.alerts.lock().await.unread_count()
    }
}

async fn pump_notifications(
    inbound: broadcast::Receiver<InboundInvocation>,
    alerts: Arc<Mutex<AlertBoard>>,
    notifications: broadcast::Sender<Notification>,
    events: broadcast::Sender<ClientEvent>,
) {
    let mut inbound = BroadcastStream::new(inbound);
    while let Some(next) = inbound.next().await {
        let invocation = match next {
            Ok(invocation) => invocation,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "notifications: inbound events lagged");
                continue;
            }
        };

        match HubEvent::from_invocation(&invocation.target, &invocation.arguments) {
            Ok(HubEvent::NotificationReceived(notification)) => {
                let alert = alerts
                    .lock()
                    .await
                    .raise(notification.clone(), Utc::now());
                debug!(
                    alert = %alert.id,
                    sender = %notification.sender_id,
                    kind = %notification.notification_type,
                    "notifications: alert raised"
                );
                let _ = notifications.send(notification);
                let _ = events.send(ClientEvent::Notification(alert));
            }
            Ok(HubEvent::MessageReceived { .. }) => {
                debug!("notifications: chat message on notification channel ignored");
            }
            Ok(HubEvent::Unknown { target }) => {
                debug!(method = %target, "notifications: unhandled hub method");
            }
            Err(err) => warn!(error = %err, "notifications: malformed notification"),
        }
    }
}

async fn sweep_alerts(
    alerts: Arc<Mutex<AlertBoard>>,
    period: Duration,
    events: broadcast::Sender<ClientEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = alerts.lock().await.prune_expired(Utc::now());
        for id in expired {
            let _ = events.send(ClientEvent::AlertExpired(id));
        }
    }
}

#[cfg(test)]
#[path = "tests/notification_tests.rs"]
mod tests;
