use serde_json::json;
use std::sync::Arc;

use crate::auth::session::{CallbackOutcome, SessionManager, SessionState, CREDENTIAL_KEY};
use crate::realtime::transport::Transport;
use crate::realtime::{derive_endpoint, RealtimeChannel};
use crate::store::Store;
use crate::testing::{make_token, FakeProvider, ManualClock, RecordingNavigator, RecordingTransport};

const NOW: i64 = 1_700_000_000;
const HOUR: i64 = 3600;

struct App {
    store: Store,
    provider: Arc<FakeProvider>,
    navigator: Arc<RecordingNavigator>,
    clock: Arc<ManualClock>,
    transport: Arc<RecordingTransport>,
    session: SessionManager,
    channel: Arc<RealtimeChannel>,
}

fn app_with_store(store: Store) -> App {
    let provider = Arc::new(FakeProvider::issuing(make_token(
        json!({"sub": "user-1", "exp": NOW + HOUR}),
    )));
    let navigator = Arc::new(RecordingNavigator::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(RecordingTransport::default());

    let session = SessionManager::builder(store.clone(), provider.clone(), navigator.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    let channel = Arc::new(RealtimeChannel::new(
        derive_endpoint("https://host/api", None),
        transport.clone(),
    ));
    channel.attach(&session);

    App {
        store,
        provider,
        navigator,
        clock,
        transport,
        session,
        channel,
    }
}

fn app() -> App {
    app_with_store(Store::in_memory())
}

async fn sign_in(app: &App) {
    app.session.login().unwrap();
    let outcome = app.session.handle_callback("auth-code").await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Authenticated);
}

#[tokio::test]
async fn login_callback_connects_exactly_once() {
    let app = app();
    assert_eq!(app.transport.connects(), 0);

    app.session.login().unwrap();
    assert_eq!(app.navigator.urls().len(), 1);
    assert_eq!(app.transport.connects(), 0);

    app.session.handle_callback("auth-code").await.unwrap();
    assert!(app.session.state().is_authenticated());
    assert!(app.channel.is_open());
    assert_eq!(app.transport.connects(), 1);
    assert_eq!(app.transport.endpoints()[0].as_str(), "wss://host/events");
}

#[tokio::test]
async fn expiry_disconnects_once_and_stays_down() {
    let app = app();
    sign_in(&app).await;

    // Past exp - threshold with no activity
    app.clock.set(NOW + HOUR - 60);
    assert_eq!(app.session.check_expiry(), SessionState::Expired);
    assert!(!app.channel.is_open());
    assert_eq!(app.transport.disconnects(), 1);

    app.clock.advance(HOUR);
    app.session.check_expiry();
    assert!(app.session.credential().is_none());
    assert_eq!(app.transport.disconnects(), 1);
    assert_eq!(app.transport.connects(), 1);

    // A fresh login reconnects once the new credential arrives
    app.provider
        .issue(make_token(json!({"exp": NOW + 3 * HOUR})));
    app.session.login().unwrap();
    assert_eq!(app.transport.connects(), 1);
    app.session.handle_callback("second-code").await.unwrap();
    assert_eq!(app.transport.connects(), 2);
}

#[tokio::test]
async fn logout_disconnects() {
    let app = app();
    sign_in(&app).await;

    app.session.logout();
    assert_eq!(app.transport.disconnects(), 1);
    assert!(!app.transport.is_connected());

    app.session.logout();
    assert_eq!(app.transport.disconnects(), 1);
}

#[tokio::test]
async fn failed_exchange_never_connects() {
    let app = app();
    app.provider.fail_with("invalid_grant");

    app.session.login().unwrap();
    assert!(app.session.handle_callback("auth-code").await.is_err());
    assert_eq!(app.session.state(), SessionState::Unauthenticated);
    assert_eq!(app.transport.connects(), 0);
    assert_eq!(app.transport.disconnects(), 0);
}

#[test]
fn restored_session_connects_on_attach() {
    let store = Store::in_memory();
    store
        .set(CREDENTIAL_KEY, &make_token(json!({"exp": NOW + HOUR})))
        .unwrap();

    let app = app_with_store(store);
    assert!(app.session.state().is_authenticated());
    assert_eq!(app.transport.connects(), 1);
}

#[test]
fn restored_expired_session_stays_dormant() {
    let store = Store::in_memory();
    store
        .set(CREDENTIAL_KEY, &make_token(json!({"exp": NOW - 1})))
        .unwrap();

    let app = app_with_store(store);
    assert_eq!(app.session.state(), SessionState::Expired);
    assert_eq!(app.transport.connects(), 0);
    assert_eq!(app.store.get::<Option<String>>(CREDENTIAL_KEY, None), None);
}

#[tokio::test]
async fn dropped_channel_stops_following_session() {
    let app = app();
    let transport = app.transport.clone();
    let session = app.session;
    drop(app.channel);

    session.login().unwrap();
    session.handle_callback("auth-code").await.unwrap();
    assert_eq!(transport.connects(), 0);
}
