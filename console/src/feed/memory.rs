//! In-process feed transport. The test side holds a [`MemoryBroker`] and
//! plays the backend: it decides when connection attempts succeed, pushes
//! frames, and drops sessions to simulate transport loss.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::FeedError;
use crate::feed::transport::{FeedConnector, FeedSession, Frame};

type Offer = Result<MemorySession, FeedError>;

pub fn memory_transport() -> (MemoryConnector, MemoryBroker) {
    let (offers_tx, offers_rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            offers: offers_rx,
            attempts: attempts.clone(),
        },
        MemoryBroker {
            offers: offers_tx,
            attempts,
        },
    )
}

pub struct MemoryConnector {
    offers: mpsc::UnboundedReceiver<Offer>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl FeedConnector for MemoryConnector {
    type Session = MemorySession;

    /// Waits until the broker accepts or refuses the attempt.
    async fn open(&mut self) -> Result<MemorySession, FeedError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.offers.recv().await {
            Some(offer) => offer,
            None => Err(FeedError::Transport("memory broker is gone".to_string())),
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    offers: mpsc::UnboundedSender<Offer>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryBroker {
    /// Queue a session for the next connection attempt.
    pub fn accept(&self) -> MemoryPeer {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        let (subs_tx, subs_rx) = mpsc::unbounded_channel();

        let session = MemorySession {
            frames: frames_rx,
            published: published_tx,
            subscriptions: subs_tx,
        };
        // The connector may already be gone; the peer then simply never
        // sees a subscriber.
        let _ = self.offers.send(Ok(session));

        MemoryPeer {
            frames: frames_tx,
            published: published_rx,
            subscriptions: subs_rx,
            seen: Vec::new(),
        }
    }

    /// Fail the next connection attempt with `err`.
    pub fn refuse(&self, err: FeedError) {
        let _ = self.offers.send(Err(err));
    }

    /// Connection attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Broker side of one accepted session.
pub struct MemoryPeer {
    frames: mpsc::UnboundedSender<Result<Frame, FeedError>>,
    published: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    subscriptions: mpsc::UnboundedReceiver<String>,
    seen: Vec<String>,
}

impl MemoryPeer {
    pub fn send_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.frames
            .send(Ok(Frame::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            }))
            .is_ok()
    }

    pub fn send_json<T: Serialize>(&self, topic: &str, body: &T) -> bool {
        match serde_json::to_vec(body) {
            Ok(payload) => self.send_raw(topic, payload),
            Err(_) => false,
        }
    }

    pub fn heartbeat(&self) -> bool {
        self.frames.send(Ok(Frame::Heartbeat)).is_ok()
    }

    /// Make the session's next read fail with `err`.
    pub fn fail(&self, err: FeedError) -> bool {
        self.frames.send(Err(err)).is_ok()
    }

    /// Next message the console published on this session.
    pub async fn next_published(&mut self) -> Option<(String, Vec<u8>)> {
        self.published.recv().await
    }

    /// Filters the console subscribed to so far.
    pub fn subscriptions(&mut self) -> Vec<String> {
        while let Ok(filter) = self.subscriptions.try_recv() {
            self.seen.push(filter);
        }
        self.seen.clone()
    }

    /// Simulate transport loss.
    pub fn drop_connection(self) {}
}

pub struct MemorySession {
    frames: mpsc::UnboundedReceiver<Result<Frame, FeedError>>,
    published: mpsc::UnboundedSender<(String, Vec<u8>)>,
    subscriptions: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FeedSession for MemorySession {
    async fn subscribe(&mut self, filter: &str) -> Result<(), FeedError> {
        self.subscriptions
            .send(filter.to_string())
            .map_err(|_| FeedError::Transport("connection dropped".to_string()))
    }

    async fn publish(&mut self, address: &str, payload: Vec<u8>) -> Result<(), FeedError> {
        self.published
            .send((address.to_string(), payload))
            .map_err(|_| FeedError::Transport("connection dropped".to_string()))
    }

    async fn next_frame(&mut self) -> Result<Frame, FeedError> {
        match self.frames.recv().await {
            Some(frame) => frame,
            None => Err(FeedError::Transport("connection dropped".to_string())),
        }
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}
