//! The single realtime channel, opened and closed with the session

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};
use url::Url;

use super::transport::{ChannelEvent, Transport};
use crate::auth::session::SessionManager;
use crate::error::ChannelError;

/// Keeps exactly one connection open while the session is authenticated
pub struct RealtimeChannel {
    endpoint: Url,
    transport: Arc<dyn Transport>,
    /// Desired state; `true` once `connect` has been issued
    open: Mutex<bool>,
}

impl RealtimeChannel {
    /// A dormant channel; nothing connects until `set_desired(true)`
    pub fn new(endpoint: Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            open: Mutex::new(false),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Whether the channel is meant to be connected
    pub fn is_open(&self) -> bool {
        *self.lock_open()
    }

    /// Drive the connection toward `connected`. Repeated calls with the same
    /// value do nothing.
    pub fn set_desired(&self, connected: bool) {
        let mut open = self.lock_open();
        if *open == connected {
            debug!(connected, "Realtime channel already in desired state");
            return;
        }

        if connected {
            info!(endpoint = %self.endpoint, "Opening realtime channel");
            self.transport.connect(&self.endpoint);
        } else {
            info!(endpoint = %self.endpoint, "Closing realtime channel");
            self.transport.disconnect();
        }
        *open = connected;
    }

    /// Follow `session`: connected exactly while it is authenticated
    pub fn attach(self: &Arc<Self>, session: &SessionManager) {
        let channel = Arc::downgrade(self);
        session.subscribe(Box::new(move |state| {
            if let Some(channel) = channel.upgrade() {
                channel.set_desired(state.is_authenticated());
            }
        }));
        self.set_desired(session.check_expiry().is_authenticated());
    }

    /// Application-facing view of the channel
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            endpoint: self.endpoint.clone(),
            transport: self.transport.clone(),
        }
    }

    fn lock_open(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.set_desired(false);
    }
}

/// Read and send access to the channel without control over its lifecycle
#[derive(Clone)]
pub struct ChannelHandle {
    endpoint: Url,
    transport: Arc<dyn Transport>,
}

impl ChannelHandle {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.transport.subscribe()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.transport.send(text.into())
    }
}
