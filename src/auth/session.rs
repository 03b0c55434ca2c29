// Application-facing session state
//
// Hydrated from the token store at construction. A stored access token is
// trusted without asking the backend, so a stale or tampered token only
// shows up when the first real request comes back 401.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::claims::AccessClaims;
use super::refresh::token_prefix;
use super::store::TokenStore;
use super::types::{Patch, SessionUpdate, StoredSession, TokenKind, User};
use crate::error::Result;
use crate::events::{EventSink, NoticeLevel, SessionEvent};
use crate::http_client::CrmHttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Uninitialized,
    Loading,
    Authenticated,
    Unauthenticated,
}

/// Observable session snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Session {
    pub status: SessionStatus,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
    pub is_loading: bool,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    fn from_stored(stored: StoredSession) -> Self {
        let status = if stored.access_token.is_some() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Unauthenticated
        };
        Self {
            status,
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            user: stored.user,
            is_loading: false,
        }
    }
}

/// Result of a login attempt; failures are values, not errors
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Success { user: User },
    Failure { error: String },
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoginOutcome::Success { .. })
    }
}

pub struct AuthSession {
    http: Arc<CrmHttpClient>,
    state: watch::Sender<Session>,
}

impl AuthSession {
    /// Build the session and hydrate it from the token store
    pub fn new(http: Arc<CrmHttpClient>) -> Self {
        let (state, _) = watch::channel(Session::default());
        let session = Self { http, state };
        session.state.send_modify(|s| s.is_loading = true);
        session.reload();
        session
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    fn store(&self) -> &Arc<dyn TokenStore> {
        self.http.store()
    }

    fn events(&self) -> &EventSink {
        self.http.events()
    }

    /// Re-read the token store into the observable state
    pub fn reload(&self) {
        let stored = match self.store().read_session() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Could not read stored session: {}", e);
                StoredSession::default()
            }
        };

        let next = Session::from_stored(stored);
        if next.is_authenticated() {
            tracing::debug!("Session restored from stored access token");
        }
        self.state.send_replace(next);
    }

    /// Apply a partial update to storage and state as one unit
    pub fn apply(&self, update: SessionUpdate) -> Result<()> {
        let written = self
            .store()
            .update_session(&mut |previous| Some(update.clone().apply(previous)))?;
        if let Some(next) = written {
            self.state.send_replace(Session::from_stored(next));
        }
        Ok(())
    }

    /// Exchange credentials for a token pair
    ///
    /// A failure leaves the token store as it was and shows an
    /// unauthenticated snapshot without credentials. `reload()` afterwards
    /// reflects whatever the store still holds.
    pub async fn login(&self, username: &str, password: &str) -> LoginOutcome {
        self.state.send_modify(|s| {
            s.status = SessionStatus::Loading;
            s.is_loading = true;
        });

        let outcome = match self.http.auth().login(username, password).await {
            Ok(data) => {
                let user = data
                    .user
                    .or_else(|| AccessClaims::decode(&data.access).and_then(|c| c.user()))
                    .unwrap_or_else(|| User::from_username(username));

                if let Some(exp) = AccessClaims::decode(&data.access).and_then(|c| c.expires_at())
                {
                    tracing::debug!("Access token expires at {}", exp.to_rfc3339());
                }

                let update = SessionUpdate {
                    access_token: Patch::Set(data.access.clone()),
                    refresh_token: Patch::Set(data.refresh),
                    user: Patch::Set(user.clone()),
                };
                match self.apply(update) {
                    Ok(()) => {
                        tracing::info!(
                            "Logged in as {} (token: {}...)",
                            user.username,
                            token_prefix(&data.access)
                        );
                        self.events().notify(NoticeLevel::Success, "Login successful!");
                        LoginOutcome::Success { user }
                    }
                    Err(e) => LoginOutcome::Failure {
                        error: e.user_message(),
                    },
                }
            }
            Err(e) => LoginOutcome::Failure {
                error: e.user_message(),
            },
        };

        if let LoginOutcome::Failure { error } = &outcome {
            tracing::warn!("Login failed for {}: {}", username, error);
            self.state.send_modify(|s| {
                s.status = SessionStatus::Unauthenticated;
                s.access_token = None;
                s.refresh_token = None;
                s.user = None;
                s.is_loading = false;
            });
        }
        outcome
    }

    /// Drop the session locally, then optionally tell the backend
    pub async fn logout(&self, notify_backend: bool) {
        let refresh_token = self.store().get(TokenKind::Refresh).unwrap_or_else(|e| {
            tracing::warn!("Could not read refresh token during logout: {}", e);
            None
        });

        if let Err(e) = self.store().clear_all() {
            tracing::warn!("Failed to clear token store: {}", e);
        }
        self.state.send_replace(Session::from_stored(StoredSession::default()));
        tracing::info!("Logged out locally");

        let Some(refresh_token) = refresh_token.filter(|_| notify_backend) else {
            return;
        };
        match self.http.auth().blacklist(&refresh_token).await {
            Ok(()) => self
                .events()
                .notify(NoticeLevel::Info, "You have been logged out."),
            Err(e) => tracing::warn!("Failed to blacklist token on server: {}", e),
        }
    }

    /// Ask the backend whether the stored access token is still valid
    ///
    /// Never called implicitly.
    pub async fn verify(&self) -> Result<bool> {
        let Some(token) = self.store().get(TokenKind::Access)? else {
            return Ok(false);
        };
        self.http.auth().verify(&token).await
    }

    /// Follow session events and reload state when the client changes the
    /// stored tokens behind the session's back
    pub fn spawn_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let mut events = self.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::TokensRefreshed | SessionEvent::LoginRequired)
                    | Err(broadcast::error::RecvError::Lagged(_)) => match session.upgrade() {
                        Some(session) => session.reload(),
                        None => break,
                    },
                    Ok(SessionEvent::Notice { .. }) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;
    use reqwest::Url;

    fn session_with(stored: StoredSession) -> (AuthSession, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::with_session(&stored).unwrap());
        let http = CrmHttpClient::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            store.clone(),
            EventSink::new(),
            1,
            1,
        )
        .unwrap();
        (AuthSession::new(Arc::new(http)), store)
    }

    #[test]
    fn test_hydrates_optimistically_from_stored_token() {
        // No round trip: a stored token is enough to count as authenticated
        let (session, _) = session_with(StoredSession {
            access_token: Some("possibly-stale".into()),
            refresh_token: Some("R1".into()),
            user: Some(User::from_username("alice")),
        });
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Authenticated);
        assert!(snapshot.is_authenticated());
        assert!(!snapshot.is_loading);
        assert_eq!(session.user().unwrap().username, "alice");
    }

    #[test]
    fn test_hydrates_unauthenticated_without_token() {
        let (session, _) = session_with(StoredSession::default());
        assert_eq!(session.snapshot().status, SessionStatus::Unauthenticated);
        assert!(!session.snapshot().is_loading);
    }

    #[test]
    fn test_apply_preserves_omitted_fields() {
        let (session, store) = session_with(StoredSession {
            access_token: Some("A1".into()),
            refresh_token: Some("R1".into()),
            user: Some(User::from_username("alice")),
        });

        session
            .apply(SessionUpdate {
                access_token: Patch::Set("A2".into()),
                ..Default::default()
            })
            .unwrap();

        let stored = store.read_session().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("A2"));
        assert_eq!(stored.refresh_token.as_deref(), Some("R1"));
        assert_eq!(stored.user.unwrap().username, "alice");
        assert_eq!(session.snapshot().access_token.as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_local_logout_clears_everything() {
        let (session, store) = session_with(StoredSession {
            access_token: Some("A1".into()),
            refresh_token: Some("R1".into()),
            user: Some(User::from_username("alice")),
        });
        let mut rx = session.subscribe();

        session.logout(false).await;

        assert!(!session.is_authenticated());
        for kind in TokenKind::ALL {
            assert_eq!(store.get(kind).unwrap(), None);
        }
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().is_authenticated());
    }

    #[tokio::test]
    async fn test_failed_login_shows_no_credentials_but_keeps_store() {
        let (session, store) = session_with(StoredSession {
            access_token: Some("A1".into()),
            refresh_token: Some("R1".into()),
            user: Some(User::from_username("alice")),
        });

        // Nothing listens on the discard port
        let outcome = session.login("alice", "pw1").await;
        assert!(!outcome.is_success());

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
        assert_eq!(snapshot.access_token, None);
        assert_eq!(snapshot.refresh_token, None);
        assert_eq!(snapshot.user, None);
        assert!(!snapshot.is_loading);
        assert_eq!(store.get(TokenKind::Access).unwrap().as_deref(), Some("A1"));

        session.reload();
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_login_outcome_helpers() {
        assert!(LoginOutcome::Success {
            user: User::from_username("alice")
        }
        .is_success());
        assert!(!LoginOutcome::Failure {
            error: "No active account found with the given credentials".into()
        }
        .is_success());
    }
}
