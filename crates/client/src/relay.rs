//! Single relay connection.
//!
//! One WebSocket per relay. A connection owns two background tasks: a write
//! task draining an outbound channel into the socket, and a read task
//! parsing incoming frames and forwarding them to the pool's dispatcher.
//! Within one relay's stream, frames are forwarded in the order the relay
//! sent them; no ordering is promised across relays.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Something that happened on one relay, forwarded to the pool dispatcher.
#[derive(Debug)]
pub struct RelayEvent {
    pub relay: String,
    pub event: RelayEventKind,
}

#[derive(Debug)]
pub enum RelayEventKind {
    /// The socket is up
    Opened,
    /// The socket is gone (closed, errored, or never established)
    Closed,
    /// A parsed protocol frame
    Message(RelayMessage),
}

/// Reconnect pacing: exponential with a ceiling. Bounded, never forever
/// shrinking the gap; reset on successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The next delay to wait before reconnecting; grows 1.5x per attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let bumped = Duration::from_millis((self.current.as_millis() as f64 * 1.5) as u64);
        self.current = bumped.min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// A connection to one relay.
pub struct RelayConnection {
    url: Url,
    connect_timeout: Duration,
    status: Arc<RwLock<RelayStatus>>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    read_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayConnection {
    /// Create a connection (does not connect yet). Parsed frames and
    /// lifecycle changes are forwarded on `events`.
    pub fn new(url: &str, events: mpsc::UnboundedSender<RelayEvent>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "relay url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            connect_timeout: Duration::from_secs(10),
            status: Arc::new(RwLock::new(RelayStatus::Disconnected)),
            outbound: Arc::new(RwLock::new(None)),
            read_task: Arc::new(Mutex::new(None)),
            events,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub async fn status(&self) -> RelayStatus {
        *self.status.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == RelayStatus::Connected
    }

    /// Establish the socket and start the read/write tasks. On any later
    /// socket failure the read task emits [`RelayEventKind::Closed`]; the
    /// pool decides whether to reconnect.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if *status != RelayStatus::Disconnected {
                return Ok(());
            }
            *status = RelayStatus::Connecting;
        }

        debug!("connecting to relay {}", self.url);

        let stream = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                *self.status.write().await = RelayStatus::Disconnected;
                let _ = self.events.send(RelayEvent {
                    relay: self.url.to_string(),
                    event: RelayEventKind::Closed,
                });
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.status.write().await = RelayStatus::Disconnected;
                let _ = self.events.send(RelayEvent {
                    relay: self.url.to_string(),
                    event: RelayEventKind::Closed,
                });
                return Err(ClientError::Timeout(format!(
                    "connect to {} timed out after {:?}",
                    self.url, self.connect_timeout
                )));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // Write task: drain outbound messages into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Read task: parse frames, answer pings, forward to the dispatcher.
        let relay = self.url.to_string();
        let status = Arc::clone(&self.status);
        let events = self.events.clone();
        let pong_tx = out_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(text.as_str()) {
                        Ok(msg) => {
                            if events
                                .send(RelayEvent {
                                    relay: relay.clone(),
                                    event: RelayEventKind::Message(msg),
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => debug!("unparseable frame from {relay}: {e}"),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => {
                        info!("relay {relay} closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("websocket error from {relay}: {e}");
                        break;
                    }
                }
            }
            *status.write().await = RelayStatus::Disconnected;
            let _ = events.send(RelayEvent {
                relay,
                event: RelayEventKind::Closed,
            });
        });

        *self.outbound.write().await = Some(out_tx);
        *self.read_task.lock().await = Some(handle);
        *self.status.write().await = RelayStatus::Connected;

        info!("connected to relay {}", self.url);
        let _ = self.events.send(RelayEvent {
            relay: self.url.to_string(),
            event: RelayEventKind::Opened,
        });
        Ok(())
    }

    /// Send a protocol message. Fails fast when the relay is not connected;
    /// the caller decides whether that is fatal.
    pub async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = msg.to_json()?;
        let guard = self.outbound.read().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| ClientError::RelayUnreachable(self.url.to_string()))?;
        debug!("sending to {}: {}", self.url, json);
        sender
            .send(Message::Text(json.into()))
            .map_err(|_| ClientError::RelayUnreachable(self.url.to_string()))
    }

    /// Tear the socket down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        *self.outbound.write().await = None;
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        *self.status.write().await = RelayStatus::Disconnected;
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2250));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            RelayConnection::new("https://relay.example.com", tx),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn send_without_connection_is_unreachable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = RelayConnection::new("wss://relay.example.com", tx).unwrap();
        let msg = ClientMessage::Close {
            subscription_id: "sub".to_string(),
        };
        assert!(matches!(
            conn.send(&msg).await,
            Err(ClientError::RelayUnreachable(_))
        ));
    }
}
