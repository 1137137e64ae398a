use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::transport::{FeedConnector, FeedSession, Frame};

const REQUEST_CAPACITY: usize = 32;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// MQTT-backed push channel. Each `open` builds a fresh client so a lost
/// session never leaks state into the next one.
pub struct MqttConnector {
    options: MqttOptions,
    broker: String,
}

impl MqttConnector {
    pub fn new(config: &FeedConfig) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", config.client_id, &suffix[..8]);

        let mut options = MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
        options.set_keep_alive(keep_alive_for(config.heartbeat_outgoing()));
        options.set_clean_session(true);

        Self {
            options,
            broker: format!("{}:{}", config.broker_host, config.broker_port),
        }
    }
}

/// MQTT keep-alive is expressed in whole seconds.
fn keep_alive_for(heartbeat: Duration) -> Duration {
    let secs = heartbeat.as_millis().div_ceil(1000).max(1);
    Duration::from_secs(secs as u64)
}

#[async_trait]
impl FeedConnector for MqttConnector {
    type Session = MqttSession;

    async fn open(&mut self) -> Result<MqttSession, FeedError> {
        debug!("Connecting to MQTT broker at {}", self.broker);
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }

        info!("Connected to MQTT broker at {}", self.broker);
        Ok(MqttSession { client, eventloop })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl FeedSession for MqttSession {
    async fn subscribe(&mut self, filter: &str) -> Result<(), FeedError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| FeedError::Transport(format!("subscribe {}: {}", filter, e)))
    }

    async fn publish(&mut self, address: &str, payload: Vec<u8>) -> Result<(), FeedError> {
        self.client
            .publish(address, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| FeedError::Transport(format!("publish {}: {}", address, e)))
    }

    async fn next_frame(&mut self) -> Result<Frame, FeedError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    return Ok(Frame::Message {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    })
                }
                Ok(Event::Incoming(Incoming::PingResp)) => return Ok(Frame::Heartbeat),
                Ok(Event::Incoming(Incoming::Disconnect)) => return Err(FeedError::Closed),
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    async fn close(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        // Flush the DISCONNECT packet; the broker may already be gone.
        let eventloop = &mut self.eventloop;
        let _ = tokio::time::timeout(CLOSE_GRACE, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

fn map_connection_error(err: ConnectionError) -> FeedError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            FeedError::Protocol(format!("broker refused connection: {:?}", code))
        }
        ConnectionError::NotConnAck(packet) => {
            FeedError::Protocol(format!("expected CONNACK, received {:?}", packet))
        }
        other => FeedError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_rounds_up_to_whole_seconds() {
        assert_eq!(keep_alive_for(Duration::from_millis(4_000)), Duration::from_secs(4));
        assert_eq!(keep_alive_for(Duration::from_millis(4_200)), Duration::from_secs(5));
        assert_eq!(keep_alive_for(Duration::ZERO), Duration::from_secs(1));
    }
}
