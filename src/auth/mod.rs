pub mod callback_server;
pub mod navigator;
pub mod pkce;
pub mod provider;
pub mod session;
pub mod token;

pub use callback_server::CallbackServer;
pub use navigator::{BrowserNavigator, Navigator};
pub use pkce::{generate_challenge, PkceGenerator, PkcePair};
pub use provider::{IdentityProvider, OAuthClient};
pub use session::{
    CallbackOutcome, LoginOutcome, SessionManager, SessionManagerBuilder, SessionObserver,
    SessionState, DEFAULT_LOGIN_TIMEOUT_SECS,
};
pub use token::{Claims, Clock, Credential, SystemClock, DEFAULT_EXPIRY_THRESHOLD_SECS};
