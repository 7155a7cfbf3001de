use async_trait::async_trait;
use log::{debug, info, trace};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::outbound::OutboundMessage;
use super::{BrokerError, BrokerOptions, InboundMessage};

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum LinkEvent {
    Message(InboundMessage),
    Disconnected { reason: String, retriable: bool },
}

pub type Link = (Arc<dyn LinkWriter>, Box<dyn LinkReader>);

/// Opens one broker connection, completing the handshake before returning.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &BrokerOptions) -> Result<Link, BrokerError>;
}

#[async_trait]
pub trait LinkWriter: Send + Sync {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError>;
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Inbound side of a connection. Once `Disconnected` is returned the link is dead.
#[async_trait]
pub trait LinkReader: Send {
    async fn next_event(&mut self) -> LinkEvent;
}

/// Connector backed by rumqttc. Every attempt builds a fresh client and
/// event loop so reconnection stays under our control.
pub struct RumqttConnector;

#[async_trait]
impl Connector for RumqttConnector {
    async fn connect(&self, options: &BrokerOptions) -> Result<Link, BrokerError> {
        let mut mqttoptions = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqttoptions.set_keep_alive(Duration::from_secs(options.keep_alive_secs.max(1)));
        if let Some(user) = &options.user {
            mqttoptions.set_credentials(user.clone(), options.pass.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(event) => trace!("MQTT event before ConnAck {:?}", event),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::ConnectRejected(format!("{:?}", code)));
                }
                Err(e) => return Err(BrokerError::Transport(e.to_string())),
            }
        }
        info!("Connected to MQTT broker {}:{}", options.host, options.port);

        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (done_tx, done) = watch::channel(false);
        let pump = tokio::spawn(async move {
            pump_events(eventloop, tx).await;
            done_tx.send_replace(true);
        });
        let writer: Arc<dyn LinkWriter> = Arc::new(RumqttWriter { client, done });
        let reader: Box<dyn LinkReader> = Box::new(RumqttReader { rx, pump });
        return Ok((writer, reader));
    }
}

/* The event loop must be polled for requests to go out, so it runs on its own task */
async fn pump_events(mut eventloop: EventLoop, tx: mpsc::Sender<LinkEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!("Received MQTT message on {}", p.topic);
                LinkEvent::Message(InboundMessage::new(&p.topic, p.payload.to_vec()))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => LinkEvent::Disconnected {
                reason: "broker sent DISCONNECT".to_string(),
                retriable: true,
            },
            /* Reported once the packet is flushed to the socket */
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping event loop");
                return;
            }
            Ok(event) => {
                trace!("MQTT event {:?}", event);
                continue;
            }
            Err(ConnectionError::ConnectionRefused(code)) => LinkEvent::Disconnected {
                reason: format!("{:?}", code),
                retriable: false,
            },
            Err(e) => LinkEvent::Disconnected { reason: e.to_string(), retriable: true },
        };

        let last = matches!(event, LinkEvent::Disconnected { .. });
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

struct RumqttWriter {
    client: AsyncClient,
    done: watch::Receiver<bool>,
}

fn transport(e: rumqttc::ClientError) -> BrokerError {
    BrokerError::Transport(e.to_string())
}

#[async_trait]
impl LinkWriter for RumqttWriter {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client.subscribe(pattern, qos).await.map_err(transport)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        self.client.unsubscribe(pattern).await.map_err(transport)
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.client
            .publish(message.topic.clone(), message.qos, message.retain, message.payload.clone())
            .await
            .map_err(transport)
    }

    /// Queues DISCONNECT and waits until the event loop has written it, so
    /// the broker sees a clean goodbye instead of a dropped socket.
    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client.disconnect().await.map_err(transport)?;
        let mut done = self.done.clone();
        let drained = tokio::time::timeout(DISCONNECT_DRAIN, done.wait_for(|stopped| *stopped)).await.is_ok();
        if !drained {
            return Err(BrokerError::Timeout);
        }
        Ok(())
    }
}

struct RumqttReader {
    rx: mpsc::Receiver<LinkEvent>,
    pump: JoinHandle<()>,
}

impl Drop for RumqttReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl LinkReader for RumqttReader {
    async fn next_event(&mut self) -> LinkEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => LinkEvent::Disconnected { reason: "event loop stopped".to_string(), retriable: true },
        }
    }
}
