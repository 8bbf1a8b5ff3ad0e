use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, COOKIE},
    multipart::Form,
    Client, Response,
};
use serde::Serialize;
use shared::{
    domain::{Conversation, InterestDecision, InterestRequest, JobPostId, UserId},
    error::ApiError,
    protocol::MessageRecord,
};
use tracing::debug;

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
};

/// Which side of the interest-request relationship a list is shown from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestView {
    AsRequester,
    AsTarget,
}

impl InterestView {
    fn role(self) -> &'static str {
        match self {
            Self::AsRequester => "requester",
            Self::AsTarget => "target",
        }
    }
}

/// Fields the backend wants when a new interest request is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestDraft {
    pub job_post_id: JobPostId,
    pub target_id: UserId,
    pub target_name: String,
    pub requester_name: String,
    pub requester_image_url: Option<String>,
}

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>>;
    async fn fetch_history(&self, counterpart: &UserId) -> ClientResult<Vec<MessageRecord>>;
    async fn list_interest_requests(&self, view: InterestView)
        -> ClientResult<Vec<InterestRequest>>;
    async fn create_interest_request(&self, draft: &InterestDraft)
        -> ClientResult<InterestRequest>;
    async fn decide_interest_request(
        &self,
        request: &InterestRequest,
        decision: InterestDecision,
    ) -> ClientResult<()>;
}

#[derive(Serialize)]
struct HistoryQuery<'a> {
    counterpart: &'a str,
}

#[derive(Serialize)]
struct RoleQuery {
    role: &'static str,
}

pub struct HttpMarketplaceApi {
    http: Client,
    settings: ClientSettings,
}

impl HttpMarketplaceApi {
    pub fn new(settings: &ClientSettings) -> ClientResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &settings.session_cookie {
            let value = HeaderValue::from_str(cookie).map_err(|err| {
                anyhow::anyhow!("session cookie is not a valid header value: {err}")
            })?;
            headers.insert(COOKIE, value);
        }
        let http = Client::builder().default_headers(headers).build()?;
        Ok(Self {
            http,
            settings: settings.clone(),
        })
    }
}

async fn check_status(
    response: Response,
    method: &'static str,
    path: &str,
) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let raw = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ApiError>(&raw).ok();
    debug!(method, path, status = status.as_u16(), "api: request rejected");
    Err(ClientError::Api {
        method,
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceApi {
    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        let path = "/conversations";
        let response = self.http.get(self.settings.rest_url(path)).send().await?;
        Ok(check_status(response, "GET", path).await?.json().await?)
    }

    async fn fetch_history(&self, counterpart: &UserId) -> ClientResult<Vec<MessageRecord>> {
        let path = "/messages/history";
        let response = self
            .http
            .get(self.settings.rest_url(path))
            .query(&HistoryQuery {
                counterpart: counterpart.as_str(),
            })
            .send()
            .await?;
        Ok(check_status(response, "GET", path).await?.json().await?)
    }

    async fn list_interest_requests(
        &self,
        view: InterestView,
    ) -> ClientResult<Vec<InterestRequest>> {
        let path = "/interest-requests";
        let response = self
            .http
            .get(self.settings.rest_url(path))
            .query(&RoleQuery { role: view.role() })
            .send()
            .await?;
        Ok(check_status(response, "GET", path).await?.json().await?)
    }

    async fn create_interest_request(
        &self,
        draft: &InterestDraft,
    ) -> ClientResult<InterestRequest> {
        let path = "/interest-requests";
        let mut form = Form::new()
            .text("jobPostId", draft.job_post_id.0.clone())
            .text("targetId", draft.target_id.0.clone())
            .text("targetName", draft.target_name.clone())
            .text("requesterName", draft.requester_name.clone());
        if let Some(image_url) = &draft.requester_image_url {
            form = form.text("requesterImageUrl", image_url.clone());
        }
        let response = self
            .http
            .post(self.settings.rest_url(path))
            .multipart(form)
            .send()
            .await?;
        Ok(check_status(response, "POST", path).await?.json().await?)
    }

    async fn decide_interest_request(
        &self,
        request: &InterestRequest,
        decision: InterestDecision,
    ) -> ClientResult<()> {
        let path = format!(
            "/interest-requests/{}/{}",
            request.id,
            decision.as_path_segment()
        );
        let mut form = Form::new()
            .text("requestId", request.id.0.clone())
            .text("requesterId", request.requester_id.0.clone())
            .text("requesterName", request.requester_name.clone())
            .text("targetId", request.target_id.0.clone())
            .text("targetName", request.target_name.clone());
        if let Some(image_url) = &request.requester_image_url {
            form = form.text("requesterImageUrl", image_url.clone());
        }
        let response = self
            .http
            .post(self.settings.rest_url(&path))
            .multipart(form)
            .send()
            .await?;
        check_status(response, "POST", &path).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
