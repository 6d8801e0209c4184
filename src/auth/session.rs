//! Session state machine: login, code exchange, expiry and logout
//!
//! ```text
//! Unauthenticated --login()--------> Authenticating
//! Authenticating  --callback(code)-> Authenticated(credential) | Unauthenticated
//! Authenticated   --expiry---------> Expired
//! Expired         --login()--------> Authenticating
//! Authenticating  --timeout--------> Unauthenticated
//! any             --logout()-------> Unauthenticated
//! ```
//!
//! The state lives behind a mutex that is never held across an await. Each
//! login bumps an attempt counter; an exchange that resolves after the attempt
//! was superseded (logout, new login) is discarded. An attempt with no
//! exchange running is abandoned once it is older than the login timeout,
//! including one left in the store by an earlier process.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::navigator::Navigator;
use super::pkce::PkceGenerator;
use super::provider::IdentityProvider;
use super::token::{Clock, Credential, SystemClock, DEFAULT_EXPIRY_THRESHOLD_SECS};
use crate::error::AuthError;
use crate::store::Store;

/// Store key holding the access token
pub const CREDENTIAL_KEY: &str = "auth.access_token";
/// Store key holding the PKCE verifier across the redirect round trip
pub const VERIFIER_KEY: &str = "auth.pkce_verifier";
/// Store key holding the OAuth `state` parameter
pub const OAUTH_STATE_KEY: &str = "auth.oauth_state";
/// Store key holding when the pending attempt started (epoch seconds)
pub const LOGIN_STARTED_KEY: &str = "auth.login_started_at";

/// Pending sign-in attempts older than this are abandoned
pub const DEFAULT_LOGIN_TIMEOUT_SECS: i64 = 600;

/// Authentication state of the client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated(Credential),
    Expired,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn credential(&self) -> Option<&Credential> {
        match self {
            SessionState::Authenticated(credential) => Some(credential),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Expired => "expired",
        }
    }
}

/// Result of `login()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// A new attempt started and the user agent was redirected
    Redirected,
    /// An attempt is already pending; nothing was generated
    AlreadyInProgress,
    AlreadyAuthenticated,
}

/// Result of delivering an authorization code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Authenticated,
    /// No attempt was pending, one is already exchanging, or it was superseded
    Ignored,
}

/// Called with the new state after every state change
pub type SessionObserver = Box<dyn Fn(&SessionState) + Send + Sync>;

struct Inner {
    state: SessionState,
    attempt: u64,
    exchange_in_flight: bool,
    /// Start of the pending attempt, set only while `Authenticating`
    pending_since: Option<i64>,
    /// States not yet delivered to observers, oldest first
    events: Vec<SessionState>,
}

/// Owns the session state; everything else reads snapshots
pub struct SessionManager {
    store: Store,
    provider: Arc<dyn IdentityProvider>,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    pkce: PkceGenerator,
    threshold_secs: i64,
    login_timeout_secs: i64,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<SessionObserver>>,
}

pub struct SessionManagerBuilder {
    store: Store,
    provider: Arc<dyn IdentityProvider>,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    threshold_secs: i64,
    login_timeout_secs: i64,
}

impl SessionManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn expiry_threshold_secs(mut self, threshold_secs: i64) -> Self {
        self.threshold_secs = threshold_secs;
        self
    }

    pub fn login_timeout_secs(mut self, login_timeout_secs: i64) -> Self {
        self.login_timeout_secs = login_timeout_secs;
        self
    }

    /// Build the manager and rehydrate state from the store
    pub fn build(self) -> Result<SessionManager, AuthError> {
        let manager = SessionManager {
            store: self.store,
            provider: self.provider,
            navigator: self.navigator,
            clock: self.clock,
            pkce: PkceGenerator::new()?,
            threshold_secs: self.threshold_secs,
            login_timeout_secs: self.login_timeout_secs,
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                attempt: 0,
                exchange_in_flight: false,
                pending_since: None,
                events: Vec::new(),
            }),
            observers: Mutex::new(Vec::new()),
        };
        manager.restore();
        Ok(manager)
    }
}

impl SessionManager {
    pub fn builder(
        store: Store,
        provider: Arc<dyn IdentityProvider>,
        navigator: Arc<dyn Navigator>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            store,
            provider,
            navigator,
            clock: Arc::new(SystemClock),
            threshold_secs: DEFAULT_EXPIRY_THRESHOLD_SECS,
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SessionState {
        self.lock_inner().state.clone()
    }

    pub fn expiry_threshold_secs(&self) -> i64 {
        self.threshold_secs
    }

    /// Register an observer for state changes.
    /// Observers must not call `subscribe` themselves.
    pub fn subscribe(&self, observer: SessionObserver) {
        self.lock_observers().push(observer);
    }

    /// The current credential, if it is still valid.
    /// Every use goes through the expiry check.
    pub fn credential(&self) -> Option<Credential> {
        self.check_expiry().credential().cloned()
    }

    /// Rehydrate from the store. Runs once at construction.
    pub fn restore(&self) {
        let token: Option<String> = self.store.get(CREDENTIAL_KEY, None);
        let now = self.clock.now_epoch_seconds();

        let mut pending_since = None;
        let next = match token {
            Some(token) => match Credential::from_token(token) {
                Ok(credential) if !credential.is_expired_at(self.threshold_secs, now) => {
                    SessionState::Authenticated(credential)
                }
                Ok(_) => {
                    info!("Stored credential has expired");
                    self.remove_key(CREDENTIAL_KEY);
                    SessionState::Expired
                }
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable stored credential");
                    self.remove_key(CREDENTIAL_KEY);
                    SessionState::Unauthenticated
                }
            },
            None if self.store.get::<Option<String>>(VERIFIER_KEY, None).is_some() => {
                // The redirect round trip restarted the process mid-login
                match self.store.get::<Option<i64>>(LOGIN_STARTED_KEY, None) {
                    Some(started) if !self.login_timed_out(started, now) => {
                        pending_since = Some(started);
                        SessionState::Authenticating
                    }
                    started => {
                        info!(started = ?started, "Discarding stale sign-in attempt");
                        self.clear_pending();
                        SessionState::Unauthenticated
                    }
                }
            }
            None => SessionState::Unauthenticated,
        };

        {
            let mut inner = self.lock_inner();
            if matches!(next, SessionState::Authenticating) {
                inner.attempt += 1;
            }
            Self::transition(&mut inner, next);
            inner.pending_since = pending_since;
        }
        self.dispatch();
        debug!(state = self.state().name(), "Session restored");
    }

    /// Start an authorization attempt: generate PKCE material, persist the
    /// verifier, and redirect to the provider.
    pub fn login(&self) -> Result<LoginOutcome, AuthError> {
        self.check_expiry();

        let (url, attempt) = {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Authenticating => {
                    debug!("Login already in progress");
                    return Ok(LoginOutcome::AlreadyInProgress);
                }
                SessionState::Authenticated(_) => {
                    debug!("Already authenticated");
                    return Ok(LoginOutcome::AlreadyAuthenticated);
                }
                SessionState::Unauthenticated | SessionState::Expired => {}
            }

            let pair = self.pkce.generate_pair()?;
            let oauth_state = self.pkce.generate_state()?;
            let started = self.clock.now_epoch_seconds();
            let persisted = self
                .store
                .set(VERIFIER_KEY, &pair.verifier)
                .and_then(|()| self.store.set(OAUTH_STATE_KEY, &oauth_state))
                .and_then(|()| self.store.set(LOGIN_STARTED_KEY, &started));
            if let Err(e) = persisted {
                self.clear_pending();
                return Err(e.into());
            }

            inner.attempt += 1;
            inner.exchange_in_flight = false;
            Self::transition(&mut inner, SessionState::Authenticating);
            inner.pending_since = Some(started);

            let url = self.provider.authorization_url(&pair.challenge, &oauth_state);
            (url, inner.attempt)
        };
        self.dispatch();

        info!(attempt, "Redirecting to identity provider");
        if let Err(e) = self.navigator.redirect(&url) {
            warn!(error = %e, "Redirect failed");
            self.abandon_attempt(attempt);
            return Err(e);
        }
        Ok(LoginOutcome::Redirected)
    }

    /// Exchange an authorization code for a credential.
    ///
    /// Only acts while `Authenticating`; otherwise a no-op. Any failure returns
    /// the session to `Unauthenticated` with nothing persisted.
    pub async fn handle_callback(&self, code: &str) -> Result<CallbackOutcome, AuthError> {
        let attempt = {
            let mut inner = self.lock_inner();
            if !matches!(inner.state, SessionState::Authenticating) {
                debug!(state = inner.state.name(), "Ignoring callback, no login pending");
                return Ok(CallbackOutcome::Ignored);
            }
            if inner.exchange_in_flight {
                debug!("Ignoring duplicate callback, exchange already in flight");
                return Ok(CallbackOutcome::Ignored);
            }
            inner.exchange_in_flight = true;
            inner.attempt
        };

        // The verifier is single-use whatever the outcome
        let verifier: Option<String> = self.store.get(VERIFIER_KEY, None);
        self.clear_pending();

        let Some(verifier) = verifier else {
            return Err(self.fail_attempt(attempt, "no PKCE verifier for this attempt".to_string()));
        };

        let exchanged = self.provider.exchange_code(code, &verifier).await;

        let now = self.clock.now_epoch_seconds();
        let result = exchanged.and_then(|token| {
            let credential = Credential::from_token(token)?;
            if credential.is_expired_at(self.threshold_secs, now) {
                return Err(AuthError::ExchangeFailed(
                    "identity provider issued an already-expired token".to_string(),
                ));
            }
            Ok(credential)
        });

        let credential = {
            let mut inner = self.lock_inner();
            if inner.attempt != attempt || !matches!(inner.state, SessionState::Authenticating) {
                info!(attempt, "Discarding exchange result for a superseded login");
                return Ok(CallbackOutcome::Ignored);
            }

            match result {
                Ok(credential) => {
                    if let Err(e) = self.store.set(CREDENTIAL_KEY, credential.access_token()) {
                        warn!(error = %e, "Failed to persist credential, session will not survive restart");
                    }
                    inner.exchange_in_flight = false;
                    Self::transition(&mut inner, SessionState::Authenticated(credential.clone()));
                    credential
                }
                Err(e) => {
                    drop(inner);
                    return Err(self.fail_attempt(attempt, e.to_string()));
                }
            }
        };
        self.dispatch();

        info!(
            subject = credential.claims().subject().unwrap_or("-"),
            expires_at = credential.expires_at(),
            "Authenticated"
        );
        Ok(CallbackOutcome::Authenticated)
    }

    /// Handle the provider's redirect back to us: checks `state`, surfaces
    /// provider errors, then exchanges the code.
    pub async fn handle_redirect(&self, redirect: &Url) -> Result<CallbackOutcome, AuthError> {
        let attempt = {
            let inner = self.lock_inner();
            if !matches!(inner.state, SessionState::Authenticating) || inner.exchange_in_flight {
                debug!(state = inner.state.name(), "Ignoring redirect, no login pending");
                return Ok(CallbackOutcome::Ignored);
            }
            inner.attempt
        };

        let mut code = None;
        let mut returned_state = None;
        let mut error = None;
        let mut error_description = None;
        for (key, value) in redirect.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => returned_state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            let reason = match error_description {
                Some(desc) => format!("{}: {}", error, desc),
                None => error,
            };
            return Err(self.fail_attempt(attempt, reason));
        }

        let expected_state: Option<String> = self.store.get(OAUTH_STATE_KEY, None);
        if expected_state.is_none() || returned_state != expected_state {
            return Err(self.fail_attempt(attempt, "state parameter mismatch".to_string()));
        }

        match code {
            Some(code) => self.handle_callback(&code).await,
            None => Err(self.fail_attempt(attempt, "redirect carried no code".to_string())),
        }
    }

    /// Demote an expired credential to `Expired` and abandon a sign-in attempt
    /// that outlived the login timeout. Returns the resulting state.
    pub fn check_expiry(&self) -> SessionState {
        let now = self.clock.now_epoch_seconds();
        let state = {
            let mut inner = self.lock_inner();
            let expired = matches!(
                &inner.state,
                SessionState::Authenticated(credential)
                    if credential.is_expired_at(self.threshold_secs, now)
            );
            let timed_out = matches!(inner.state, SessionState::Authenticating)
                && !inner.exchange_in_flight
                && inner
                    .pending_since
                    .map_or(true, |started| self.login_timed_out(started, now));

            if expired {
                info!("Credential expired");
                self.remove_key(CREDENTIAL_KEY);
                Self::transition(&mut inner, SessionState::Expired);
            } else if timed_out {
                info!(attempt = inner.attempt, "Sign-in attempt timed out");
                self.clear_pending();
                inner.attempt += 1;
                Self::transition(&mut inner, SessionState::Unauthenticated);
            }
            inner.state.clone()
        };
        self.dispatch();
        state
    }

    /// Clear the credential and any pending attempt
    pub fn logout(&self) {
        {
            let mut inner = self.lock_inner();
            self.remove_key(CREDENTIAL_KEY);
            self.clear_pending();
            inner.attempt += 1;
            inner.exchange_in_flight = false;
            Self::transition(&mut inner, SessionState::Unauthenticated);
        }
        self.dispatch();
        info!("Logged out");
    }

    /// Poll `check_expiry` every `period` until the manager is dropped
    pub fn spawn_expiry_watch(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_expiry();
            }
        })
    }

    fn abandon_attempt(&self, attempt: u64) {
        {
            let mut inner = self.lock_inner();
            if inner.attempt != attempt || !matches!(inner.state, SessionState::Authenticating) {
                return;
            }
            inner.exchange_in_flight = false;
            Self::transition(&mut inner, SessionState::Unauthenticated);
        }
        self.clear_pending();
        self.dispatch();
    }

    fn fail_attempt(&self, attempt: u64, reason: String) -> AuthError {
        warn!(attempt, reason = %reason, "Login attempt failed");
        self.abandon_attempt(attempt);
        AuthError::ExchangeFailed(reason)
    }

    fn clear_pending(&self) {
        self.remove_key(VERIFIER_KEY);
        self.remove_key(OAUTH_STATE_KEY);
        self.remove_key(LOGIN_STARTED_KEY);
    }

    fn login_timed_out(&self, started: i64, now: i64) -> bool {
        now.saturating_sub(started) >= self.login_timeout_secs
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key, error = %e, "Failed to remove stored value");
        }
    }

    /// Set the state, queueing an event when the variant changes
    fn transition(inner: &mut Inner, next: SessionState) {
        if mem::discriminant(&inner.state) == mem::discriminant(&next) {
            inner.state = next;
            return;
        }
        debug!(from = inner.state.name(), to = next.name(), "Session transition");
        if !matches!(next, SessionState::Authenticating) {
            inner.pending_since = None;
        }
        inner.state = next;
        inner.events.push(inner.state.clone());
    }

    /// Deliver queued events in order. A dispatch already running (possibly
    /// further up this stack) picks up anything queued meanwhile.
    fn dispatch(&self) {
        loop {
            let observers = match self.observers.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let batch = mem::take(&mut self.lock_inner().events);
                if batch.is_empty() {
                    break;
                }
                for state in &batch {
                    for observer in observers.iter() {
                        observer(state);
                    }
                }
            }
            drop(observers);
            if self.lock_inner().events.is_empty() {
                return;
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<SessionObserver>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
