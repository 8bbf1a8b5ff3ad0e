//! Test doubles shared by the client_core test modules: a websocket hub
//! speaking the JSON hub protocol and an in-memory marketplace backend.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::COOKIE, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use shared::{
    domain::{
        Conversation, ConversationId, InterestDecision, InterestRequest, InterestRequestId,
        InterestStatus, JobPostId, MessageId, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{split_records, HubFrame, MessageRecord},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot, watch, Mutex},
    time::{sleep, Instant},
};

use crate::{
    api::{InterestDraft, InterestView, MarketplaceApi},
    config::ClientSettings,
    error::{ClientError, ClientResult},
    hub::ConnectionState,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionMode {
    Ok,
    Error,
    Silent,
}

struct HubShared {
    completion: Mutex<CompletionMode>,
    handshake_delay: Mutex<Duration>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    cookies: Mutex<Vec<Option<String>>>,
    connections: AtomicUsize,
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

/// A hub that completes `SendMessage` invocations and pushes whatever the
/// test hands it to every connected socket.
#[derive(Clone)]
pub(crate) struct TestHub {
    pub base_url: String,
    shared: Arc<HubShared>,
}

impl TestHub {
    pub(crate) async fn spawn() -> TestHub {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind hub");
        let addr = listener.local_addr().expect("hub addr");
        let (push, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let shared = Arc::new(HubShared {
            completion: Mutex::new(CompletionMode::Ok),
            handshake_delay: Mutex::new(Duration::ZERO),
            invocations: Mutex::new(Vec::new()),
            cookies: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            push,
            kick,
        });
        let app = Router::new()
            .route("/chatHub", get(upgrade))
            .route("/notificationHub", get(upgrade))
            .with_state(Arc::clone(&shared));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestHub {
            base_url: format!("http://{addr}"),
            shared,
        }
    }

    pub(crate) fn url(&self, path: &str) -> url::Url {
        crate::config::hub_url(&self.base_url, path).expect("hub url")
    }

    pub(crate) async fn set_completion(&self, mode: CompletionMode) {
        *self.shared.completion.lock().await = mode;
    }

    pub(crate) async fn set_handshake_delay(&self, delay: Duration) {
        *self.shared.handshake_delay.lock().await = delay;
    }

    pub(crate) fn push_invocation(&self, target: &str, arguments: Vec<Value>) {
        self.push_raw(HubFrame::invocation(None, target, arguments).encode());
    }

    pub(crate) fn push_raw(&self, payload: String) {
        let _ = self.shared.push.send(payload);
    }

    /// Drops every open socket without a close record.
    pub(crate) fn kick(&self) {
        let _ = self.shared.kick.send(());
    }

    pub(crate) fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub(crate) async fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.shared.invocations.lock().await.clone()
    }

    pub(crate) async fn cookies(&self) -> Vec<Option<String>> {
        self.shared.cookies.lock().await.clone()
    }
}

async fn upgrade(
    State(shared): State<Arc<HubShared>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookie = headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    shared.cookies.lock().await.push(cookie);
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(mut socket: WebSocket, shared: Arc<HubShared>) {
    let mut push = shared.push.subscribe();
    let mut kick = shared.kick.subscribe();

    match socket.recv().await {
        Some(Ok(WsMessage::Text(_))) => {}
        _ => return,
    }
    let delay = *shared.handshake_delay.lock().await;
    sleep(delay).await;
    if socket
        .send(WsMessage::Text(format!("{{}}{}", shared::protocol::RECORD_SEPARATOR)))
        .await
        .is_err()
    {
        return;
    }
    shared.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                for record in split_records(&text) {
                    let Ok(HubFrame::Invocation { invocation_id, target, arguments }) =
                        HubFrame::decode(record)
                    else {
                        continue;
                    };
                    shared.invocations.lock().await.push((target, arguments));
                    let Some(invocation_id) = invocation_id else {
                        continue;
                    };
                    let completion = match *shared.completion.lock().await {
                        CompletionMode::Ok => HubFrame::Completion {
                            invocation_id,
                            result: None,
                            error: None,
                        },
                        CompletionMode::Error => HubFrame::Completion {
                            invocation_id,
                            result: None,
                            error: Some("receiver unavailable".to_string()),
                        },
                        CompletionMode::Silent => continue,
                    };
                    if socket.send(WsMessage::Text(completion.encode())).await.is_err() {
                        return;
                    }
                }
            }
            pushed = push.recv() => {
                let Ok(payload) = pushed else { continue };
                if socket.send(WsMessage::Text(payload)).await.is_err() {
                    return;
                }
            }
            _ = kick.recv() => return,
        }
    }
}

/// In-memory backend. History fetches can be held open per counterpart to
/// stage out-of-order responses.
#[derive(Default)]
pub(crate) struct FakeApi {
    pub conversations: Mutex<Vec<Conversation>>,
    pub histories: Mutex<HashMap<UserId, Vec<MessageRecord>>>,
    pub history_gates: Mutex<HashMap<UserId, oneshot::Receiver<()>>>,
    pub requests: Mutex<Vec<InterestRequest>>,
    pub decisions: Mutex<Vec<(InterestRequestId, InterestDecision)>>,
    pub decide_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub decide_failure: Mutex<Option<u16>>,
    pub fail_listing: Mutex<bool>,
    /// Holds the next interest list call open until released.
    pub list_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub fail_interest_listing: Mutex<bool>,
    pub list_calls: AtomicUsize,
}

impl FakeApi {
    pub(crate) async fn hold_history(&self, counterpart: &UserId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .await
            .insert(counterpart.clone(), rx);
        tx
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketplaceApi for FakeApi {
    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        if *self.fail_listing.lock().await {
            return Err(ClientError::Api {
                method: "GET",
                path: "/conversations".into(),
                status: 503,
                body: None,
            });
        }
        Ok(self.conversations.lock().await.clone())
    }

    async fn fetch_history(&self, counterpart: &UserId) -> ClientResult<Vec<MessageRecord>> {
        let gate = self.history_gates.lock().await.remove(counterpart);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .histories
            .lock()
            .await
            .get(counterpart)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_interest_requests(
        &self,
        _view: InterestView,
    ) -> ClientResult<Vec<InterestRequest>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.list_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if *self.fail_interest_listing.lock().await {
            return Err(ClientError::Api {
                method: "GET",
                path: "/interest-requests".into(),
                status: 503,
                body: None,
            });
        }
        Ok(self.requests.lock().await.clone())
    }

    async fn create_interest_request(
        &self,
        draft: &InterestDraft,
    ) -> ClientResult<InterestRequest> {
        let mut requests = self.requests.lock().await;
        let created = InterestRequest {
            id: InterestRequestId::new(format!("r-{}", requests.len() + 1)),
            job_post_id: draft.job_post_id.clone(),
            requester_id: UserId::from("me"),
            requester_name: draft.requester_name.clone(),
            requester_image_url: draft.requester_image_url.clone(),
            target_id: draft.target_id.clone(),
            target_name: draft.target_name.clone(),
            status: InterestStatus::Pending,
            created_at: at(0),
            updated_at: at(0),
        };
        requests.push(created.clone());
        Ok(created)
    }

    async fn decide_interest_request(
        &self,
        request: &InterestRequest,
        decision: InterestDecision,
    ) -> ClientResult<()> {
        let gate = self.decide_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.decisions
            .lock()
            .await
            .push((request.id.clone(), decision));
        let path = format!("/interest-requests/{}/{}", request.id, decision.as_path_segment());

        if let Some(status) = *self.decide_failure.lock().await {
            return Err(ClientError::Api {
                method: "POST",
                path,
                status,
                body: Some(ApiError::new(ErrorCode::Internal, "backend unavailable")),
            });
        }

        let mut requests = self.requests.lock().await;
        let Some(stored) = requests.iter_mut().find(|row| row.id == request.id) else {
            return Err(ClientError::Api {
                method: "POST",
                path,
                status: 404,
                body: Some(ApiError::new(ErrorCode::NotFound, "no such request")),
            });
        };
        match stored.status.apply(decision) {
            Ok(next) => {
                stored.status = next;
                Ok(())
            }
            Err(_) => Err(ClientError::Api {
                method: "POST",
                path,
                status: 409,
                body: Some(ApiError::new(ErrorCode::Conflict, "request already decided")),
            }),
        }
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn conversation(counterpart: &str, display_name: &str, updated: i64) -> Conversation {
    Conversation {
        id: ConversationId::new(format!("c-{counterpart}")),
        counterpart_user_id: UserId::from(counterpart),
        display_name: display_name.to_string(),
        phone: String::new(),
        avatar_url: None,
        last_message: String::new(),
        last_updated_at: at(updated),
        is_blocked: false,
        blocked_by: None,
    }
}

pub(crate) fn record(id: &str, sender: &str, receiver: &str, body: &str, sent: i64) -> MessageRecord {
    MessageRecord {
        message_id: MessageId::from(id),
        sender_id: UserId::from(sender),
        receiver_id: UserId::from(receiver),
        body: body.to_string(),
        sent_at: at(sent),
    }
}

pub(crate) fn interest_request(id: &str, status: InterestStatus) -> InterestRequest {
    InterestRequest {
        id: InterestRequestId::from(id),
        job_post_id: JobPostId::from("job-1"),
        requester_id: UserId::from("u-req"),
        requester_name: "Rita".to_string(),
        requester_image_url: None,
        target_id: UserId::from("me"),
        target_name: "Me".to_string(),
        status,
        created_at: at(0),
        updated_at: at(0),
    }
}

/// Settings pointing both hubs at `hub`, with timings shrunk for tests.
pub(crate) fn test_settings(hub: &TestHub) -> ClientSettings {
    ClientSettings {
        rest_base_url: format!("{}/api", hub.base_url),
        hub_base_url: hub.base_url.clone(),
        directory_refresh: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        keep_alive_interval: Duration::from_secs(5),
        server_timeout: Duration::from_secs(10),
        reconnect_delays: vec![Duration::from_millis(20), Duration::from_millis(50)],
        max_reconnect_attempts: None,
        alert_ttl: Duration::from_secs(5),
        ..ClientSettings::default()
    }
}

pub(crate) async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) async fn wait_for_state(
    state: &mut watch::Receiver<ConnectionState>,
    wanted: ConnectionState,
) {
    tokio::time::timeout(WAIT_LIMIT, state.wait_for(|current| *current == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .expect("state channel closed");
}
