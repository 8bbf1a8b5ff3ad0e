use std::sync::Arc;

use shared::domain::InterestStatus;
use tokio::sync::oneshot;

use super::*;
use crate::test_support::{interest_request, wait_until, FakeApi};

fn board(api: Arc<FakeApi>) -> (InterestRequestBoard, broadcast::Receiver<ClientEvent>) {
    let (events, receiver) = broadcast::channel(64);
    let board = InterestRequestBoard::new(
        LocalIdentity::new("me", "Me"),
        api,
        InterestView::AsTarget,
        events,
    );
    (board, receiver)
}

fn drain_alerts(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<String> {
    let mut alerts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Alert { message } = event {
            alerts.push(message);
        }
    }
    alerts
}

async fn status_of(board: &InterestRequestBoard, id: &str) -> InterestStatus {
    board
        .list()
        .await
        .into_iter()
        .find(|row| row.id.as_str() == id)
        .map(|row| row.status)
        .expect("row listed")
}

#[tokio::test]
async fn reject_then_accept_never_flips_the_status() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    let (board, mut events) = board(api.clone());
    board.refresh().await.expect("initial list");

    board
        .reject(&InterestRequestId::from("r-1"))
        .await
        .expect("reject");
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Rejected);

    let err = board
        .accept(&InterestRequestId::from("r-1"))
        .await
        .expect_err("already rejected");
    assert!(matches!(
        err,
        ClientError::AlreadyTerminal {
            status: InterestStatus::Rejected,
            ..
        }
    ));
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Rejected);
    // The terminal row was refused locally; only the reject reached the server.
    assert_eq!(api.decisions.lock().await.len(), 1);
    assert_eq!(
        drain_alerts(&mut events),
        vec!["This request was already rejected.".to_string()]
    );
}

#[tokio::test]
async fn success_refetches_instead_of_transitioning_locally() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    let (board, _events) = board(api.clone());
    board.refresh().await.expect("initial list");
    let calls_before = api.list_calls();

    board
        .accept(&InterestRequestId::from("r-1"))
        .await
        .expect("accept");
    assert_eq!(api.list_calls(), calls_before + 1);
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Accepted);
}

#[tokio::test]
async fn server_conflict_maps_to_already_terminal() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    let (board, _events) = board(api.clone());
    board.refresh().await.expect("initial list");

    // Someone else decided it after our list was fetched.
    api.requests.lock().await[0].status = InterestStatus::Accepted;
    let err = board
        .reject(&InterestRequestId::from("r-1"))
        .await
        .expect_err("conflict");
    assert!(matches!(
        err,
        ClientError::AlreadyTerminal {
            status: InterestStatus::Accepted,
            ..
        }
    ));
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Accepted);
}

#[tokio::test]
async fn other_failures_raise_an_alert_and_keep_the_row() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    *api.decide_failure.lock().await = Some(500);
    let (board, mut events) = board(api.clone());
    board.refresh().await.expect("initial list");

    let err = board
        .accept(&InterestRequestId::from("r-1"))
        .await
        .expect_err("backend down");
    assert!(matches!(err, ClientError::Api { status: 500, .. }));
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Pending);
    assert!(!board.is_in_flight(&InterestRequestId::from("r-1")).await);
    assert_eq!(
        drain_alerts(&mut events),
        vec!["backend unavailable".to_string()]
    );
    assert_eq!(api.decisions.lock().await.len(), 1);
}

#[tokio::test]
async fn second_action_while_in_flight_is_refused() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    let (release, gate) = oneshot::channel();
    *api.decide_gate.lock().await = Some(gate);
    let (board, _events) = board(api.clone());
    let board = Arc::new(board);
    board.refresh().await.expect("initial list");
    let (release_list, list_gate) = oneshot::channel();
    *api.list_gate.lock().await = Some(list_gate);

    let first = {
        let board = Arc::clone(&board);
        tokio::spawn(async move { board.accept(&InterestRequestId::from("r-1")).await })
    };
    wait_until("accept in flight", || async {
        board.is_in_flight(&InterestRequestId::from("r-1")).await
    })
    .await;

    let err = board
        .reject(&InterestRequestId::from("r-1"))
        .await
        .expect_err("in flight");
    assert!(matches!(err, ClientError::ActionInFlight(_)));

    // The decision lands; the refetch is still outstanding.
    let calls = api.list_calls();
    let _ = release.send(());
    wait_until("refetch issued", || async { api.list_calls() > calls }).await;
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Pending);
    assert!(board.is_in_flight(&InterestRequestId::from("r-1")).await);
    let err = board
        .accept(&InterestRequestId::from("r-1"))
        .await
        .expect_err("still in flight");
    assert!(matches!(err, ClientError::ActionInFlight(_)));
    assert_eq!(api.decisions.lock().await.len(), 1);

    let _ = release_list.send(());
    first.await.expect("join").expect("accept");
    assert_eq!(status_of(&board, "r-1").await, InterestStatus::Accepted);
    assert!(!board.is_in_flight(&InterestRequestId::from("r-1")).await);
}

#[tokio::test]
async fn conflict_with_a_failed_refetch_keeps_the_server_error() {
    let api = Arc::new(FakeApi::default());
    api.requests
        .lock()
        .await
        .push(interest_request("r-1", InterestStatus::Pending));
    let (board, mut events) = board(api.clone());
    board.refresh().await.expect("initial list");

    api.requests.lock().await[0].status = InterestStatus::Accepted;
    *api.fail_interest_listing.lock().await = true;
    let err = board
        .reject(&InterestRequestId::from("r-1"))
        .await
        .expect_err("conflict");
    assert!(matches!(err, ClientError::Api { status: 409, .. }));
    assert!(!board.is_in_flight(&InterestRequestId::from("r-1")).await);
    assert_eq!(
        drain_alerts(&mut events),
        vec!["request already decided".to_string()]
    );
}

#[tokio::test]
async fn unknown_request_is_refused() {
    let api = Arc::new(FakeApi::default());
    let (board, _events) = board(api.clone());
    board.refresh().await.expect("empty list");

    let err = board
        .accept(&InterestRequestId::from("r-404"))
        .await
        .expect_err("not listed");
    assert!(matches!(err, ClientError::UnknownRequest(_)));
    assert!(api.decisions.lock().await.is_empty());
}

#[tokio::test]
async fn express_interest_uses_the_local_identity() {
    let api = Arc::new(FakeApi::default());
    let (board, _events) = board(api.clone());

    let created = board
        .express_interest(JobPostId::from("job-3"), UserId::from("u-1"), "Alice")
        .await
        .expect("created");
    assert_eq!(created.status, InterestStatus::Pending);
    assert_eq!(created.requester_name, "Me");
    assert_eq!(created.target_name, "Alice");
    assert_eq!(board.list().await.len(), 1);
}

#[tokio::test]
async fn interest_notifications_trigger_a_refetch() {
    let api = Arc::new(FakeApi::default());
    let (board, _events) = board(api.clone());
    let notification = |kind: &str| Notification {
        sender_id: UserId::from("u-1"),
        sender_name: "Alice".to_string(),
        sender_image_url: None,
        job_post_id: Some(JobPostId::from("job-1")),
        message: "update".to_string(),
        notification_type: kind.to_string(),
        is_read: false,
    };

    assert!(board.on_notification(&notification("InterestAccepted")).await);
    assert_eq!(api.list_calls(), 1);
    assert!(!board.on_notification(&notification("NewMessage")).await);
    assert_eq!(api.list_calls(), 1);
}
