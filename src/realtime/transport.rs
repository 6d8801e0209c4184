//! Socket ownership: the `Transport` seam and its websocket implementation

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ChannelError;

const EVENT_CAPACITY: usize = 100;

/// Something observed on the realtime channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    /// `reason` is `None` for a requested disconnect
    Disconnected { reason: Option<String> },
    Text(String),
    Binary(Vec<u8>),
}

/// Owns the actual connection.
///
/// `connect` and `disconnect` are fire-and-forget; the manager guarantees they
/// alternate.
pub trait Transport: Send + Sync {
    fn connect(&self, endpoint: &Url);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
    fn send(&self, text: String) -> Result<(), ChannelError>;
}

/// Reconnect delays after an unexpected drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

struct Connection {
    /// Owned by this connection's task alone
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Websocket transport over tokio-tungstenite with automatic reconnection
pub struct WebSocketTransport {
    policy: ReconnectPolicy,
    events: broadcast::Sender<ChannelEvent>,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketTransport {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            policy,
            events,
            connection: Mutex::new(None),
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, endpoint: &Url) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Cannot open realtime channel outside a tokio runtime");
                return;
            }
        };

        let mut slot = self.lock_connection();
        if let Some(previous) = slot.take() {
            debug!("Replacing existing realtime connection");
            let _ = previous.shutdown.send(());
        }

        let connected = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(run_connection(
            endpoint.clone(),
            self.policy,
            self.events.clone(),
            connected.clone(),
            outbound_rx,
            shutdown_rx,
        ));

        *slot = Some(Connection {
            connected,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        });
    }

    fn disconnect(&self) {
        let Some(connection) = self.lock_connection().take() else {
            return;
        };
        connection.connected.store(false, Ordering::SeqCst);
        if connection.shutdown.send(()).is_err() {
            // Task already gone
            connection.task.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.lock_connection()
            .as_ref()
            .is_some_and(|connection| connection.connected.load(Ordering::SeqCst))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn send(&self, text: String) -> Result<(), ChannelError> {
        let slot = self.lock_connection();
        let connection = slot
            .as_ref()
            .filter(|connection| connection.connected.load(Ordering::SeqCst))
            .ok_or(ChannelError::NotConnected)?;
        connection
            .outbound
            .send(text)
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Exit {
    Shutdown,
    Dropped(String),
}

async fn run_connection(
    endpoint: Url,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut failures: u32 = 0;

    loop {
        info!(endpoint = %endpoint, "Connecting realtime channel");
        let attempt = tokio::select! {
            _ = &mut shutdown => return,
            result = connect_async(endpoint.as_str()) => result,
        };

        match attempt {
            Ok((stream, _)) => {
                failures = 0;
                connected.store(true, Ordering::SeqCst);
                info!(endpoint = %endpoint, "Realtime channel connected");
                let _ = events.send(ChannelEvent::Connected);

                let exit = pump(stream, &events, &mut outbound, &mut shutdown).await;
                connected.store(false, Ordering::SeqCst);

                match exit {
                    Exit::Shutdown => {
                        info!("Realtime channel closed");
                        let _ = events.send(ChannelEvent::Disconnected { reason: None });
                        return;
                    }
                    Exit::Dropped(reason) => {
                        warn!(reason = %reason, "Realtime channel dropped");
                        let _ = events.send(ChannelEvent::Disconnected {
                            reason: Some(reason),
                        });
                    }
                }
            }
            Err(e) => warn!(endpoint = %endpoint, error = %e, "Realtime connection failed"),
        }

        failures = failures.saturating_add(1);
        let delay = policy.delay(failures);
        info!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling realtime reconnect"
        );
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: &broadcast::Sender<ChannelEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Exit {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = write.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    return Exit::Dropped(e.to_string());
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ChannelEvent::Text(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(ChannelEvent::Binary(data.to_vec()));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return Exit::Dropped(e.to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Exit::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Dropped(e.to_string()),
                None => return Exit::Dropped("stream ended".to_string()),
            }
        }
    }
}
