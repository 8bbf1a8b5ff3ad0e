use std::{collections::HashSet, sync::Arc};

use shared::domain::{
    InterestDecision, InterestRequest, InterestRequestId, JobPostId, LocalIdentity, Notification,
    UserId,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::{InterestDraft, InterestView, MarketplaceApi},
    error::{ClientError, ClientResult},
    ClientEvent,
};

#[derive(Default)]
struct BoardState {
    requests: Vec<InterestRequest>,
    loaded: bool,
    in_flight: HashSet<InterestRequestId>,
}

/// Cached interest-request list for one view, with the accept/reject
/// workflow on top.
///
/// Mutations never transition a row locally: a successful post invalidates
/// the cache and the list is fetched again.
pub struct InterestRequestBoard {
    identity: LocalIdentity,
    api: Arc<dyn MarketplaceApi>,
    view: InterestView,
    inner: Mutex<BoardState>,
    events: broadcast::Sender<ClientEvent>,
}

impl InterestRequestBoard {
    pub fn new(
        identity: LocalIdentity,
        api: Arc<dyn MarketplaceApi>,
        view: InterestView,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity,
            api,
            view,
            inner: Mutex::new(BoardState::default()),
            events,
        }
    }

    pub fn view(&self) -> InterestView {
        self.view
    }

    pub async fn list(&self) -> Vec<InterestRequest> {
        self.inner.lock().await.requests.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.lock().await.loaded
    }

    pub async fn is_in_flight(&self, id: &InterestRequestId) -> bool {
        self.inner.lock().await.in_flight.contains(id)
    }

    pub async fn refresh(&self) -> ClientResult<Vec<InterestRequest>> {
        let fetched = match self.api.list_interest_requests(self.view).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(view = ?self.view, error = %err, "interest: list refresh failed");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.requests = fetched.clone();
            inner.loaded = true;
        }
        debug!(view = ?self.view, count = fetched.len(), "interest: list refreshed");
        let _ = self
            .events
            .send(ClientEvent::InterestRequestsUpdated(fetched.clone()));
        Ok(fetched)
    }

    pub async fn accept(&self, id: &InterestRequestId) -> ClientResult<()> {
        self.decide(id, InterestDecision::Accept).await
    }

    pub async fn reject(&self, id: &InterestRequestId) -> ClientResult<()> {
        self.decide(id, InterestDecision::Reject).await
    }

    async fn decide(&self, id: &InterestRequestId, decision: InterestDecision) -> ClientResult<()> {
        let request = match self.claim(id, decision).await {
            Ok(request) => request,
            Err(err) => {
                self.raise_alert(&err);
                return Err(err);
            }
        };

        let outcome = self.api.decide_interest_request(&request, decision).await;
        let settled = self.settle(&request, decision, outcome).await;
        // Held until the refetch resolves.
        self.inner.lock().await.in_flight.remove(id);
        settled
    }

    /// Refetches after a decision and maps a conflict to the row's final
    /// status when the refetch can tell it.
    async fn settle(
        &self,
        request: &InterestRequest,
        decision: InterestDecision,
        outcome: ClientResult<()>,
    ) -> ClientResult<()> {
        let id = &request.id;
        match outcome {
            Ok(()) => {
                info!(request = %id, ?decision, "interest: decision recorded");
                if let Err(err) = self.refresh().await {
                    debug!(request = %id, error = %err, "interest: refetch after decision failed");
                }
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                let settled_status = match self.refresh().await {
                    Ok(rows) => rows
                        .iter()
                        .find(|row| &row.id == id)
                        .map(|row| row.status)
                        .filter(|status| status.is_terminal()),
                    Err(refetch) => {
                        debug!(request = %id, error = %refetch, "interest: refetch after conflict failed");
                        None
                    }
                };
                let err = match settled_status {
                    Some(status) => ClientError::AlreadyTerminal {
                        id: id.clone(),
                        status,
                    },
                    None => err,
                };
                warn!(request = %id, ?decision, error = %err, "interest: server reports request already decided");
                self.raise_alert(&err);
                Err(err)
            }
            Err(err) => {
                warn!(request = %id, ?decision, error = %err, "interest: decision failed");
                self.raise_alert(&err);
                Err(err)
            }
        }
    }

    /// Checks the cached row and marks it in flight.
    async fn claim(
        &self,
        id: &InterestRequestId,
        decision: InterestDecision,
    ) -> ClientResult<InterestRequest> {
        let mut inner = self.inner.lock().await;
        let request = inner
            .requests
            .iter()
            .find(|row| &row.id == id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownRequest(id.clone()))?;
        if let Err(err) = request.status.apply(decision) {
            return Err(ClientError::AlreadyTerminal {
                id: id.clone(),
                status: err.current,
            });
        }
        if !inner.in_flight.insert(id.clone()) {
            return Err(ClientError::ActionInFlight(id.clone()));
        }
        Ok(request)
    }

    /// Creates a Pending request from the local user towards `target_id`.
    pub async fn express_interest(
        &self,
        job_post_id: JobPostId,
        target_id: UserId,
        target_name: impl Into<String>,
    ) -> ClientResult<InterestRequest> {
        let draft = InterestDraft {
            job_post_id,
            target_id,
            target_name: target_name.into(),
            requester_name: self.identity.display_name.clone(),
            requester_image_url: self.identity.image_url.clone(),
        };

        let created = match self.api.create_interest_request(&draft).await {
            Ok(created) => created,
            Err(err) => {
                warn!(job_post = %draft.job_post_id, error = %err, "interest: create failed");
                self.raise_alert(&err);
                return Err(err);
            }
        };
        info!(request = %created.id, job_post = %created.job_post_id, "interest: request created");
        if let Err(err) = self.refresh().await {
            debug!(error = %err, "interest: refetch after create failed");
        }
        Ok(created)
    }

    /// Refetches the list when a pushed notification concerns interest
    /// requests. Returns whether a refresh was attempted.
    pub async fn on_notification(&self, notification: &Notification) -> bool {
        if !notification.kind().concerns_interest_requests() {
            return false;
        }
        if let Err(err) = self.refresh().await {
            debug!(error = %err, "interest: refetch after notification failed");
        }
        true
    }

    fn raise_alert(&self, err: &ClientError) {
        let _ = self.events.send(ClientEvent::Alert {
            message: err.alert_text(),
        });
    }
}

#[cfg(test)]
#[path = "tests/interest_tests.rs"]
mod tests;
