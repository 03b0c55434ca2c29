// Token refresh logic

use anyhow::Context;
use reqwest::{Client, Url};
use serde_json::Value;
use std::sync::Arc;

use super::store::TokenStore;
use super::types::{Patch, RefreshRequest, RefreshResponse, SessionUpdate, TokenKind};
use crate::error::{ClientError, Result, SESSION_EXPIRED_MESSAGE};
use crate::events::{EventSink, NoticeLevel};

/// Path of the refresh endpoint, relative to the base URL
pub const REFRESH_PATH: &str = "crm-api/auth/token/refresh/";

/// Short, loggable form of a credential
pub(crate) fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(20)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

enum Exchange {
    Refreshed(String),
    /// The stored session no longer belongs to the refresh token we sent
    Superseded,
}

/// Performs the refresh call and applies its outcome to the token store
///
/// Talks to the backend through a bare client so a rejected refresh can
/// never re-enter the interceptors.
pub struct TokenRefresher {
    client: Client,
    refresh_url: Url,
    store: Arc<dyn TokenStore>,
    events: EventSink,
}

impl TokenRefresher {
    pub fn new(
        client: Client,
        base_url: &Url,
        store: Arc<dyn TokenStore>,
        events: EventSink,
    ) -> anyhow::Result<Self> {
        let refresh_url = base_url
            .join(REFRESH_PATH)
            .context("Failed to build refresh URL")?;

        Ok(Self {
            client,
            refresh_url,
            store,
            events,
        })
    }

    /// Exchange the stored refresh token for a new access token
    ///
    /// On any failure every stored credential is dropped and the login
    /// redirect is signalled before the error is returned. If the session
    /// was logged out or replaced while the call was in flight, the new
    /// token is discarded and the store is left as it is.
    pub async fn refresh(&self) -> Result<String> {
        match self.exchange().await {
            Ok(Exchange::Refreshed(token)) => Ok(token),
            Ok(Exchange::Superseded) => {
                // Whoever replaced the session owns it now; leave it alone
                tracing::warn!("Session changed during token refresh, discarding new token");
                Err(ClientError::SessionExpired(
                    SESSION_EXPIRED_MESSAGE.to_string(),
                ))
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.expire_session(&e);
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<Exchange> {
        let refresh_token = self
            .store
            .get(TokenKind::Refresh)?
            .ok_or_else(|| ClientError::SessionExpired(SESSION_EXPIRED_MESSAGE.to_string()))?;

        tracing::debug!(
            url = %self.refresh_url,
            refresh = %token_prefix(&refresh_token),
            "Refreshing access token..."
        );

        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh: &refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: Option<Value> = response.json().await.ok();
            let detail = body
                .as_ref()
                .and_then(|b| b.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string);
            tracing::warn!(status = status.as_u16(), body = ?body, "Refresh rejected");
            return Err(ClientError::SessionExpired(
                detail.unwrap_or_else(|| SESSION_EXPIRED_MESSAGE.to_string()),
            ));
        }

        let data: RefreshResponse = response.json().await?;
        if data.access.is_empty() {
            return Err(ClientError::SessionExpired(
                SESSION_EXPIRED_MESSAGE.to_string(),
            ));
        }

        let rotated = data.refresh.is_some();
        let update = SessionUpdate {
            access_token: Patch::Set(data.access.clone()),
            refresh_token: Patch::from_option(data.refresh),
            user: Patch::Keep,
        };
        // Only persist over the session this refresh was started for. A
        // logout or a new login while the call was in flight wins.
        let written = self.store.update_session(&mut |current| {
            (current.refresh_token.as_deref() == Some(refresh_token.as_str()))
                .then(|| update.clone().apply(current))
        })?;
        if written.is_none() {
            return Ok(Exchange::Superseded);
        }

        tracing::info!(
            rotated_refresh = rotated,
            "Access token refreshed ({}...)",
            token_prefix(&data.access)
        );
        self.events.tokens_refreshed();
        Ok(Exchange::Refreshed(data.access))
    }

    fn expire_session(&self, error: &ClientError) {
        if let Err(e) = self.store.clear_all() {
            tracing::warn!("Failed to clear token store after refresh failure: {}", e);
        }

        let message = match error {
            ClientError::SessionExpired(message) => message.clone(),
            other => other.user_message(),
        };
        self.events.notify(NoticeLevel::Error, message);
        self.events.login_required();
    }
}
