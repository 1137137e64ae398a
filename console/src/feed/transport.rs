use async_trait::async_trait;

use crate::error::FeedError;

/// One unit read from an open feed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { topic: String, payload: Vec<u8> },
    /// Liveness signal from the peer; carries no data.
    Heartbeat,
}

/// Opens sessions against the push channel. Called again after every loss.
#[async_trait]
pub trait FeedConnector: Send + 'static {
    type Session: FeedSession;

    async fn open(&mut self) -> Result<Self::Session, FeedError>;
}

#[async_trait]
pub trait FeedSession: Send + 'static {
    async fn subscribe(&mut self, filter: &str) -> Result<(), FeedError>;

    async fn publish(&mut self, address: &str, payload: Vec<u8>) -> Result<(), FeedError>;

    /// Next frame from the peer. Must be cancel safe: the client races it
    /// against shutdown and the heartbeat deadline.
    async fn next_frame(&mut self) -> Result<Frame, FeedError>;

    async fn close(&mut self);
}
