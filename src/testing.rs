//! Fakes shared by the unit tests

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use url::Url;

use crate::auth::navigator::Navigator;
use crate::auth::provider::IdentityProvider;
use crate::auth::token::Clock;
use crate::error::{AuthError, ChannelError};
use crate::realtime::transport::{ChannelEvent, Transport};

/// Unsigned compact token carrying `claims`
pub fn make_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity provider answering every exchange with a fixed result
pub struct FakeProvider {
    response: Mutex<Result<String, String>>,
    exchanges: Mutex<Vec<(String, String)>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeProvider {
    pub fn issuing(token: String) -> Self {
        Self {
            response: Mutex::new(Ok(token)),
            exchanges: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn issue(&self, token: String) {
        *self.response.lock().unwrap() = Ok(token);
    }

    pub fn fail_with(&self, error: &str) {
        *self.response.lock().unwrap() = Err(error.to_string());
    }

    /// Hold every exchange until the returned notify fires
    pub fn gate(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    /// `(code, verifier)` pairs received so far
    pub fn exchanges(&self) -> Vec<(String, String)> {
        self.exchanges.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn authorization_url(&self, challenge: &str, state: &str) -> Url {
        let mut url = Url::parse("https://id.test/authorize").unwrap();
        url.query_pairs_mut()
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<String, AuthError> {
        self.exchanges
            .lock()
            .unwrap()
            .push((code.to_string(), verifier.to_string()));

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(AuthError::Provider)
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    urls: Mutex<Vec<Url>>,
    fail_next: AtomicBool,
}

impl RecordingNavigator {
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &Url) -> Result<(), AuthError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AuthError::Provider("navigation refused".to_string()));
        }
        self.urls.lock().unwrap().push(url.clone());
        Ok(())
    }
}

/// Transport that only counts lifecycle calls
pub struct RecordingTransport {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    connected: AtomicBool,
    endpoints: Mutex<Vec<Url>>,
    sent: Mutex<Vec<String>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            endpoints: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl RecordingTransport {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, endpoint: &Url) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Connected);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Disconnected { reason: None });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn send(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}
