//! Event feed client: one reconnecting push-channel connection, decoded into
//! an ordered stream of [`FeedEvent`]s.

pub mod memory;
pub mod mqtt;
pub mod topics;
pub mod transport;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::types::{DemoEvent, LogLevel, LogTags, Migration, Node, NodeMetrics};

pub use memory::{memory_transport, MemoryBroker, MemoryConnector, MemoryPeer};
pub use mqtt::MqttConnector;
pub use topics::{Topic, TopicMap};
pub use transport::{FeedConnector, FeedSession, Frame};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Disconnected { reason: String },
    /// The channel itself misbehaved (as opposed to a single bad message).
    ProtocolError(String),
    Malformed { topic: String, reason: String },
    Topology(Vec<Node>),
    NodeMetrics { node_id: String, metrics: NodeMetrics },
    MigrationCreated(Migration),
    MigrationUpdated(Migration),
    MigrationProgress { migration_id: String, progress: u8, message: String },
    Log { message: String, level: LogLevel, tags: LogTags },
    Demo(DemoEvent),
}

/// Outbound message queued by [`FeedHandle::publish`].
struct Outbound {
    address: String,
    payload: Vec<u8>,
}

const OUTBOUND_CAPACITY: usize = 64;

enum SessionEnd {
    Shutdown,
    ConsumerGone,
    Lost(String),
}

pub struct FeedClient<C: FeedConnector> {
    connector: C,
    driver: SessionDriver,
}

/// Everything a live session needs besides the session itself.
struct SessionDriver {
    config: FeedConfig,
    topics: TopicMap,
    events: mpsc::Sender<FeedEvent>,
}

impl<C: FeedConnector> FeedClient<C> {
    pub fn new(connector: C, config: FeedConfig, events: mpsc::Sender<FeedEvent>) -> Self {
        let topics = TopicMap::new(&config.topic_prefix, config.subscribe_node_metrics);
        Self {
            connector,
            driver: SessionDriver {
                config,
                topics,
                events,
            },
        }
    }

    /// Start the connection loop in the background and return immediately.
    pub fn connect(self) -> FeedHandle {
        let shutdown = CancellationToken::new();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(self.run(shutdown.clone(), connected_tx, outbound_rx));

        FeedHandle {
            shutdown,
            outbound: outbound_tx,
            connected: connected_rx,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        shutdown: CancellationToken,
        connected: watch::Sender<bool>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        let config = self.driver.config.clone();
        info!(
            "Starting feed client (reconnect every {:?})",
            config.reconnect_delay()
        );
        let mut attempt: u64 = 0;
        // Last refusal reported to the consumer; repeats are only logged.
        let mut reported_refusal: Option<String> = None;

        loop {
            attempt += 1;
            debug!("Opening feed connection (attempt {})", attempt);

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = tokio::time::timeout(config.connect_timeout(), self.connector.open()) => res,
            };

            match opened {
                Ok(Ok(session)) => match self
                    .driver
                    .run_session(session, &shutdown, &connected, &mut outbound)
                    .await
                {
                    SessionEnd::Shutdown => break,
                    SessionEnd::ConsumerGone => {
                        warn!("Feed event consumer dropped; stopping feed client");
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!("Feed connection lost: {}", reason);
                        attempt = 0;
                        reported_refusal = None;
                    }
                },
                Ok(Err(FeedError::Protocol(message))) => {
                    warn!("Feed connection attempt {} refused: {}", attempt, message);
                    if reported_refusal.as_deref() != Some(message.as_str()) {
                        if self
                            .driver
                            .events
                            .send(FeedEvent::ProtocolError(message.clone()))
                            .await
                            .is_err()
                        {
                            warn!("Feed event consumer dropped; stopping feed client");
                            break;
                        }
                        reported_refusal = Some(message);
                    }
                }
                Ok(Err(e)) => warn!("Feed connection attempt {} failed: {}", attempt, e),
                Err(_) => warn!(
                    "Feed connection attempt {} timed out after {:?}",
                    attempt,
                    config.connect_timeout()
                ),
            }

            // Nothing is buffered across a disconnected window.
            while let Ok(msg) = outbound.try_recv() {
                debug!("Feed disconnected, dropping message for {}", msg.address);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.reconnect_delay()) => {}
            }
        }

        connected.send_replace(false);
        info!("Feed client stopped");
    }
}

impl SessionDriver {
    async fn run_session<S: FeedSession>(
        &self,
        mut session: S,
        shutdown: &CancellationToken,
        connected: &watch::Sender<bool>,
        outbound: &mut mpsc::Receiver<Outbound>,
    ) -> SessionEnd {
        let filters = self.topics.filters();
        for filter in &filters {
            if let Err(e) = session.subscribe(filter).await {
                session.close().await;
                return SessionEnd::Lost(format!("subscribe to {} failed: {}", filter, e));
            }
        }

        connected.send_replace(true);
        info!("Feed connected, subscribed to {} topics", filters.len());
        if self.events.send(FeedEvent::Connected).await.is_err() {
            session.close().await;
            return SessionEnd::ConsumerGone;
        }

        self.register(&mut session).await;

        let dead_after = self.config.dead_connection_after();
        let mut last_frame = Instant::now();

        let end = loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                Some(msg) = outbound.recv() => {
                    if let Err(e) = session.publish(&msg.address, msg.payload).await {
                        break SessionEnd::Lost(format!("publish to {} failed: {}", msg.address, e));
                    }
                    continue;
                }
                read = async {
                    let deadline = dead_after
                        .and_then(|limit| last_frame.checked_add(limit).map(|at| (limit, at)));
                    match deadline {
                        Some((limit, at)) => tokio::time::timeout_at(at, session.next_frame())
                            .await
                            .unwrap_or(Err(FeedError::HeartbeatTimeout(limit))),
                        None => session.next_frame().await,
                    }
                } => read,
            };

            match read {
                Ok(Frame::Heartbeat) => {
                    last_frame = Instant::now();
                    trace!("Feed heartbeat");
                }
                Ok(Frame::Message { topic, payload }) => {
                    last_frame = Instant::now();
                    let event = match self.topics.decode(&topic, &payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Dropping feed message: {}", e);
                            FeedEvent::Malformed {
                                topic,
                                reason: e.to_string(),
                            }
                        }
                    };
                    if self.events.send(event).await.is_err() {
                        break SessionEnd::ConsumerGone;
                    }
                }
                Err(FeedError::Protocol(message)) => {
                    error!("Feed protocol error: {}", message);
                    if self
                        .events
                        .send(FeedEvent::ProtocolError(message.clone()))
                        .await
                        .is_err()
                    {
                        break SessionEnd::ConsumerGone;
                    }
                    break SessionEnd::Lost(format!("protocol error: {}", message));
                }
                Err(e) => break SessionEnd::Lost(e.to_string()),
            }
        };

        session.close().await;
        connected.send_replace(false);

        let delivered = match &end {
            SessionEnd::ConsumerGone => true,
            // Shutdown must not wait on a full channel.
            SessionEnd::Shutdown => self
                .events
                .try_send(FeedEvent::Disconnected {
                    reason: "disconnected by client".to_string(),
                })
                .is_ok(),
            SessionEnd::Lost(reason) => self
                .events
                .send(FeedEvent::Disconnected {
                    reason: reason.clone(),
                })
                .await
                .is_ok(),
        };
        if !delivered {
            debug!("Disconnect notification not delivered");
        }
        end
    }

    /// Announce the console to the backend. Failure is logged, not fatal.
    async fn register<S: FeedSession>(&self, session: &mut S) {
        let payload = match serde_json::to_vec(&self.config.identity) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode console registration: {}", e);
                return;
            }
        };
        match session.publish(&self.config.register_address, payload).await {
            Ok(()) => debug!(
                "Registered console as {} at {}",
                self.config.identity.id, self.config.register_address
            ),
            Err(e) => warn!("Failed to send console registration: {}", e),
        }
    }
}

/// Control surface of a running feed client.
pub struct FeedHandle {
    shutdown: CancellationToken,
    outbound: mpsc::Sender<Outbound>,
    connected: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connection_changes(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Send a message to `address` on the live session. Dropped while
    /// disconnected.
    pub fn publish(&self, address: &str, payload: Vec<u8>) {
        if !self.is_connected() {
            debug!("Feed disconnected, dropping message for {}", address);
            return;
        }
        let msg = Outbound {
            address: address.to_string(),
            payload,
        };
        if let Err(e) = self.outbound.try_send(msg) {
            warn!("Dropping outbound feed message: {}", e);
        }
    }

    /// Tear the connection down and stop reconnecting. Events already
    /// delivered stay delivered.
    pub async fn disconnect(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Feed client task failed: {}", e);
            }
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
