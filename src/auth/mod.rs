// Authentication module
// Token storage, the interceptor pair, single-flight refresh and the session

mod claims;
mod coordinator;
mod interceptor;
mod refresh;
mod session;
mod store;
mod types;

pub use claims::AccessClaims;
pub use coordinator::RefreshCoordinator;
pub use interceptor::AuthInterceptor;
pub use refresh::{TokenRefresher, REFRESH_PATH};
pub use session::{AuthSession, LoginOutcome, Session, SessionStatus};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
pub use types::{
    LoginRequest, LoginResponse, Patch, RefreshRequest, RefreshResponse, SessionUpdate,
    StoredSession, TokenKind, User, VerifyRequest,
};

pub(crate) use refresh::token_prefix;
