use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::config::{Config, ReconnectConfig};
use crate::error::TransportError;
use crate::messages::{ClientEvent, ServerEvent};
use crate::reconnect::Backoff;
use crate::transport::{Subscribers, Subscription, SubscriptionId, Transport, TransportEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Ended {
    Lost(String),
    Shutdown,
}

/// WebSocket transport that reconnects on its own and buffers emits while down.
pub struct SocketTransport {
    outgoing: mpsc::UnboundedSender<String>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    connecting: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl SocketTransport {
    /// Starts connecting in the background and returns immediately.
    pub fn connect(config: &Config) -> Arc<Self> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let transport = Arc::new(SocketTransport {
            outgoing,
            subscribers: Subscribers::new(),
            connected: Arc::new(AtomicBool::new(false)),
            connecting: Arc::new(AtomicBool::new(true)),
            shutdown,
        });

        let worker = Worker {
            url: config.socket_url.clone(),
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect.clone(),
            subscribers: transport.subscribers.clone(),
            connected: Arc::clone(&transport.connected),
            connecting: Arc::clone(&transport.connecting),
        };
        tokio::spawn(worker.run(outgoing_rx, shutdown_rx));

        transport
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Closes the socket and stops reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Closed);
        }
        let frame = event.encode()?;
        debug!("Queueing {} ({} bytes)", event.name(), frame.len());
        self.outgoing.send(frame).map_err(|_| TransportError::Closed)
    }

    /// A subscriber that arrives while the socket is down learns so at once.
    async fn subscribe(&self) -> Subscription {
        let connected = Arc::clone(&self.connected);
        let connecting = Arc::clone(&self.connecting);
        self.subscribers
            .add_with(move || {
                let down =
                    !connected.load(Ordering::SeqCst) && !connecting.load(Ordering::SeqCst);
                down.then(|| TransportEvent::Disconnected {
                    reason: "not connected".to_string(),
                })
            })
            .await
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Worker {
    url: String,
    connect_timeout: Duration,
    reconnect: ReconnectConfig,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    connecting: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        self,
        outgoing: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut outbox = Outbox::new(outgoing);
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.connecting.store(true, Ordering::SeqCst);

            match self.open().await {
                Ok(socket) => {
                    backoff.reset();
                    self.connecting.store(false, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Connected to {}", self.url);
                    self.subscribers.dispatch(&TransportEvent::Connected).await;

                    let ended = self.pump(socket, &mut outbox, &mut shutdown).await;

                    self.connected.store(false, Ordering::SeqCst);
                    let reason = match ended {
                        Ended::Lost(reason) => reason,
                        Ended::Shutdown => "client shutdown".to_string(),
                    };
                    info!("Disconnected from {}: {}", self.url, reason);
                    self.subscribers
                        .dispatch(&TransportEvent::Disconnected { reason })
                        .await;
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", self.url, e);
                    self.subscribers
                        .dispatch(&TransportEvent::Disconnected {
                            reason: e.to_string(),
                        })
                        .await;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        "Reconnect attempt {} in {} ms",
                        backoff.attempts(),
                        delay.as_millis()
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    error!(
                        "Giving up on {} after {} reconnect attempts",
                        self.url,
                        backoff.attempts()
                    );
                    break;
                }
            }
        }

        self.connecting.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn open(&self) -> Result<Socket, TransportError> {
        match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(TransportError::WebSocket(e)),
            Err(_) => Err(TransportError::ConnectTimeout(self.connect_timeout.as_millis())),
        }
    }

    async fn pump(
        &self,
        socket: Socket,
        outbox: &mut Outbox,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Ended {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                biased;

                frame = outbox.next() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::text(frame.clone())).await {
                            outbox.requeue(frame);
                            return Ended::Lost(format!("send failed: {e}"));
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return Ended::Shutdown;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            debug!("Received {}", event.name());
                            self.subscribers.dispatch(&TransportEvent::Server(event)).await;
                        }
                        Err(e) => warn!("Dropping invalid frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) => {
                        return Ended::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                    None => return Ended::Lost("stream ended".to_string()),
                },
                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    return Ended::Shutdown;
                }
            }
        }
    }
}

/// Outgoing frames in emit order. A frame whose write failed goes out first
/// on the next connection.
struct Outbox {
    queue: mpsc::UnboundedReceiver<String>,
    unsent: Option<String>,
}

impl Outbox {
    fn new(queue: mpsc::UnboundedReceiver<String>) -> Self {
        Outbox {
            queue,
            unsent: None,
        }
    }

    async fn next(&mut self) -> Option<String> {
        match self.unsent.take() {
            Some(frame) => Some(frame),
            None => self.queue.recv().await,
        }
    }

    fn requeue(&mut self, frame: String) {
        self.unsent = Some(frame);
    }
}

/// Hands out one shared connection, reusing it while it is alive.
pub struct SocketService {
    config: Config,
    current: Mutex<Option<Arc<SocketTransport>>>,
}

impl SocketService {
    pub fn new(config: Config) -> Self {
        SocketService {
            config,
            current: Mutex::new(None),
        }
    }

    /// Returns the live or in-flight connection, or starts a fresh one.
    pub async fn connect(&self) -> Arc<SocketTransport> {
        let mut current = self.current.lock().await;
        if let Some(transport) = current.as_ref() {
            if transport.is_connected() || transport.is_connecting() {
                return Arc::clone(transport);
            }
            transport.shutdown();
        }

        info!("Opening connection to {}", self.config.socket_url);
        let transport = SocketTransport::connect(&self.config);
        *current = Some(Arc::clone(&transport));
        transport
    }

    pub async fn disconnect(&self) {
        if let Some(transport) = self.current.lock().await.take() {
            info!("Closing connection to {}", self.config.socket_url);
            transport.shutdown();
        }
    }

    pub async fn get(&self) -> Option<Arc<SocketTransport>> {
        self.current.lock().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A port nothing listens on.
    async fn closed_port_config(reconnect: ReconnectConfig) -> Config {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Config {
            socket_url: format!("ws://{addr}"),
            reconnect,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn outbox_resends_a_requeued_frame_first() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::new(rx);
        for frame in ["a", "b", "c"] {
            tx.send(frame.to_string()).unwrap();
        }

        let first = outbox.next().await.unwrap();
        outbox.requeue(first);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(outbox.next().await.unwrap());
        }
        assert_eq!(order, vec!["a", "b", "c"]);

        drop(tx);
        assert_eq!(outbox.next().await, None);
    }

    #[tokio::test]
    async fn service_reuses_an_in_flight_connection() {
        let service = SocketService::new(closed_port_config(ReconnectConfig::default()).await);

        let first = service.connect().await;
        let second = service.connect().await;

        assert!(first.is_connecting());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&service.get().await.unwrap(), &first));
        service.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_forgets_the_transport() {
        let service = SocketService::new(closed_port_config(ReconnectConfig::default()).await);
        let first = service.connect().await;

        service.disconnect().await;

        assert!(first.is_shut_down());
        assert!(service.get().await.is_none());
        assert!(!service.is_connected().await);

        let fresh = service.connect().await;
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(!fresh.is_shut_down());
        service.disconnect().await;
    }

    #[tokio::test]
    async fn service_starts_over_after_giving_up() {
        let service = SocketService::new(
            closed_port_config(ReconnectConfig {
                enabled: false,
                ..ReconnectConfig::default()
            })
            .await,
        );
        let first = service.connect().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while first.is_connecting() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let fresh = service.connect().await;
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(first.is_shut_down());
        service.disconnect().await;
    }
}
