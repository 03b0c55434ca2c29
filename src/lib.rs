// CRM client - Library root

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;

pub use auth::{AuthSession, LoginOutcome, MemoryTokenStore, SqliteTokenStore, TokenStore};
pub use error::{ClientError, Result};
pub use events::{EventSink, NoticeLevel, SessionEvent};
pub use http_client::{ApiRequest, CrmHttpClient, MultipartBody};
