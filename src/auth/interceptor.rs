// Request/response hooks around every dispatched call

use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;

use super::coordinator::RefreshCoordinator;
use super::store::TokenStore;
use super::types::TokenKind;
use crate::error::{describe_error, ClientError, Result};
use crate::events::{EventSink, NoticeLevel};

/// Injects the bearer token and turns 401s into a refresh-and-replay
pub struct AuthInterceptor {
    store: Arc<dyn TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    events: EventSink,
}

impl AuthInterceptor {
    pub fn new(
        store: Arc<dyn TokenStore>,
        coordinator: Arc<RefreshCoordinator>,
        events: EventSink,
    ) -> Self {
        Self {
            store,
            coordinator,
            events,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Request hook: attach the stored access token, if any
    ///
    /// A store read failure sends the request unauthenticated rather than
    /// failing it.
    pub fn on_request(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.store.get(TokenKind::Access) {
            Ok(Some(token)) => builder.bearer_auth(token),
            Ok(None) => builder,
            Err(e) => {
                tracing::warn!("Could not read access token: {}", e);
                builder
            }
        }
    }

    /// Response hook for a first-time 401: the token to replay with
    pub async fn on_unauthorized(&self) -> Result<String> {
        tracing::warn!("Received 401, refreshing token before replaying request");
        self.coordinator.refresh().await
    }

    /// Response hook for everything that is not replayed
    ///
    /// Successful responses pass through. Failures get a readable message
    /// and, when `notify` is set and the status is not 401, a notification.
    pub async fn on_response(&self, response: Response, notify: bool) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().clone();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).ok();
        let fallback = format!("Request failed with status code {}", status.as_u16());
        let message = describe_error(body.as_ref(), Some(&fallback));

        tracing::error!(
            status = status.as_u16(),
            url = %url,
            response_body = %text,
            "HTTP request failed with error response"
        );

        if notify && status != StatusCode::UNAUTHORIZED {
            self.events
                .notify(NoticeLevel::Error, format!("API Error: {}", message));
        }

        Err(ClientError::Api {
            status: status.as_u16(),
            message,
            body,
        })
    }

    /// Response hook for a request that never got a response
    pub fn on_transport_error(&self, error: reqwest::Error, notify: bool) -> ClientError {
        let error = ClientError::from(error);
        tracing::warn!(error = %error, "HTTP request error");

        if notify {
            let message = describe_error(None, Some(&error.to_string()));
            self.events
                .notify(NoticeLevel::Error, format!("API Error: {}", message));
        }
        error
    }
}
