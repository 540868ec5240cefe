//! HTTP implementation of [`ChatApi`] over `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use marketchat_proto::ids::ConversationId;
use marketchat_proto::rest::{
    ConversationMessageDto, ConversationSummaryDto, ErrorBody, MessageDto, Role,
    SendMessageRequest,
};

use super::{ApiError, ChatApi};
use crate::transport::CredentialSource;

/// REST client for the marketplace chat endpoints.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: url::Url,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpApi {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] if `base_url` is not a usable base URL or
    /// the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ApiError::Config(format!("invalid api url {base_url:?}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::Config(format!("invalid api url {base_url:?}")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: parsed,
            credentials,
        })
    }

    /// The base URL extended by `segments`, each percent-encoded.
    fn url(&self, segments: &[&str]) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ApiError> {
        let credential = self.credentials.credential().ok_or(ApiError::NoCredential)?;
        Ok(builder.bearer_auth(credential.token.expose()))
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self.authorized(builder)?.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.text().map(str::to_string))
            .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()));
        tracing::warn!(status = status.as_u16(), message = ?message, "request rejected");
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        self.execute(builder)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)
    }
}

impl ChatApi for HttpApi {
    async fn list_conversations(&self, role: Role) -> Result<Vec<ConversationSummaryDto>, ApiError> {
        let request = self
            .client
            .get(self.url(&["conversations"]))
            .query(&[("role", role.as_str())]);
        self.json(request).await
    }

    async fn search_conversations(
        &self,
        role: Role,
        query: &str,
    ) -> Result<Vec<ConversationSummaryDto>, ApiError> {
        let request = self
            .client
            .get(self.url(&["conversations", "search"]))
            .query(&[("role", role.as_str()), ("q", query)]);
        self.json(request).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageDto>, ApiError> {
        let request = self
            .client
            .get(self.url(&["conversations", conversation_id.as_str(), "messages"]));
        self.json(request).await
    }

    async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<ConversationMessageDto, ApiError> {
        let builder = self.client.post(self.url(&["messages"])).json(request);
        self.json(builder).await
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<(), ApiError> {
        let request = self
            .client
            .patch(self.url(&["conversations", conversation_id.as_str(), "read"]));
        self.execute(request).await.map(|_| ())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}
