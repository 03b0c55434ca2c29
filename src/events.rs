// Session events
//
// Non-blocking notifications and the login-redirect signal. Emitting never
// waits on a listener; with nobody subscribed the event is only logged.

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Something worth showing to the user
    Notice { level: NoticeLevel, message: String },
    /// A silent refresh replaced the stored access token
    TokensRefreshed,
    /// Stored credentials were dropped; the user has to log in again
    LoginRequired,
}

/// Fan-out sender shared by the client components
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Error => tracing::warn!(notice = %message, "Error notice"),
            _ => tracing::info!(notice = %message, "Notice"),
        }
        self.emit(SessionEvent::Notice { level, message });
    }

    pub fn tokens_refreshed(&self) {
        self.emit(SessionEvent::TokensRefreshed);
    }

    pub fn login_required(&self) {
        tracing::info!("Login required, routing to login");
        self.emit(SessionEvent::LoginRequired);
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}
