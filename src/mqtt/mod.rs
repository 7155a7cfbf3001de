pub mod backoff;
pub mod link;
pub mod outbound;
pub mod payload;
pub mod topic_trie;

use log::{debug, error, info, warn};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use crate::ErrorKind;
use backoff::{Backoff, BackoffPolicy};
use link::{Connector, Link, LinkEvent, LinkReader, LinkWriter, RumqttConnector};
use outbound::{OutboundMessage, OutboundQueue};
use payload::{Coercion, Payload, PayloadValue};
use topic_trie::{validate_topic, TopicTrie};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker refused the connection: {0}")]
    ConnectRejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out waiting for the broker")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Outbound queue is full ({0} messages)")]
    BackpressureExceeded(usize),
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid topic '{0}': {1}")]
    InvalidTopic(String, &'static str),
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ConnectRejected(_) => ErrorKind::Rejected,
            BrokerError::Transport(_) => ErrorKind::Transport,
            BrokerError::Timeout => ErrorKind::Timeout,
            BrokerError::Protocol(_) => ErrorKind::Protocol,
            BrokerError::BackpressureExceeded(_) => ErrorKind::BackpressureExceeded,
            BrokerError::NotConnected(_) => ErrorKind::State,
            BrokerError::InvalidState(_) => ErrorKind::State,
            BrokerError::InvalidTopic(..) => ErrorKind::Protocol,
            BrokerError::Payload(_) => ErrorKind::Protocol,
        }
    }

    /// Errors the reconnect loop absorbs.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::Timeout)
    }
}

fn port_default() -> u16 { return 1883 }
fn client_id_default() -> String { return "energylink".to_string() }
fn keep_alive_default() -> u64 { return 5 }
fn connect_timeout_default() -> u64 { return 10000 }
fn outbound_cap_default() -> usize { return 100 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerOptions {
    pub host: String,
    #[serde(default="port_default")]
    pub port: u16,
    #[serde(default="client_id_default")]
    pub client_id: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default="keep_alive_default")]
    pub keep_alive_secs: u64,
    #[serde(default="connect_timeout_default")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default="outbound_cap_default")]
    pub outbound_cap: usize,
}

impl BrokerOptions {
    pub fn new(host: &str, port: u16) -> Self {
        return BrokerOptions {
            host: host.to_string(),
            port,
            client_id: client_id_default(),
            user: None,
            pass: None,
            keep_alive_secs: keep_alive_default(),
            connect_timeout_ms: connect_timeout_default(),
            backoff: BackoffPolicy::default(),
            outbound_cap: outbound_cap_default(),
        };
    }
}

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        return InboundMessage { topic: topic.to_string(), payload };
    }

    /// JSON body with ISO-8601 strings turned into date and time values.
    pub fn decode(&self) -> Result<PayloadValue, BrokerError> {
        payload::decode(&self.payload, Coercion::Datetimes)
    }

    pub fn decode_with(&self, coercion: Coercion) -> Result<PayloadValue, BrokerError> {
        payload::decode(&self.payload, coercion)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback for inbound messages. Runs on the dispatcher task and must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Local subscriptions, the source of truth for what the broker should know.
pub struct SubscriptionTable {
    trie: TopicTrie<Arc<dyn MessageHandler>>,
    records: Vec<(String, QoS)>,
    generation: u64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        return SubscriptionTable { trie: TopicTrie::new(), records: Vec::new(), generation: 0 };
    }

    pub fn add(&mut self, pattern: &str, qos: QoS, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        self.trie.insert(pattern, handler)?;
        match self.records.iter_mut().find(|(p, _)| p == pattern) {
            Some(record) => record.1 = qos,
            None => self.records.push((pattern.to_string(), qos)),
        }
        self.generation += 1;
        Ok(())
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|(p, _)| p != pattern);
        self.trie.remove(pattern);
        if self.records.len() == before {
            return false;
        }
        self.generation += 1;
        true
    }

    pub fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.trie.matches(topic)
    }

    pub fn records(&self) -> Vec<(String, QoS)> {
        self.records.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Session {
    state: ClientState,
    subscriptions: SubscriptionTable,
    queue: OutboundQueue,
    writer: Option<Arc<dyn LinkWriter>>,
    supervisor: Option<JoinHandle<()>>,
    reconnect: Option<AbortHandle>,
}

struct Shared {
    options: BrokerOptions,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    stop: watch::Sender<bool>,
}

type OnlineSender = Option<oneshot::Sender<Result<(), BrokerError>>>;

enum LinkEnd {
    Stopped,
    Lost { reason: String, retriable: bool },
}

enum SyncStep {
    Resubscribe(u64, Vec<(String, QoS)>),
    Flush(OutboundMessage),
}

impl Shared {
    async fn connect_once(&self) -> Result<Link, BrokerError> {
        let timeout = Duration::from_millis(self.options.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.connector.connect(&self.options)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

/// Publish/subscribe session with a broker. Subscriptions survive
/// reconnects, QoS 1 and 2 publishes are queued while the link is down.
pub struct BrokerClient {
    shared: Arc<Shared>,
}

impl BrokerClient {
    pub fn new(options: BrokerOptions) -> Self {
        return Self::with_connector(options, Arc::new(RumqttConnector));
    }

    pub fn with_connector(options: BrokerOptions, connector: Arc<dyn Connector>) -> Self {
        let (stop, _) = watch::channel(false);
        let session = Session {
            state: ClientState::Init,
            subscriptions: SubscriptionTable::new(),
            queue: OutboundQueue::new(options.outbound_cap),
            writer: None,
            supervisor: None,
            reconnect: None,
        };
        return BrokerClient {
            shared: Arc::new(Shared { options, connector, session: Mutex::new(session), stop }),
        };
    }

    /// Performs the handshake and resolves once the session is online,
    /// i.e. every recorded subscription has been sent.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        {
            let mut session = self.shared.session.lock().await;
            if session.state != ClientState::Init {
                return Err(BrokerError::InvalidState(format!("connect while {:?}", session.state)));
            }
            session.state = ClientState::Connecting;
        }
        info!("Connecting to MQTT broker {}:{}", self.shared.options.host, self.shared.options.port);

        let (writer, reader) = match self.shared.connect_once().await {
            Ok(link) => link,
            Err(e) => {
                let mut session = self.shared.session.lock().await;
                if session.state == ClientState::Connecting {
                    session.state = ClientState::Init;
                }
                return Err(e);
            }
        };

        let (online_tx, online_rx) = oneshot::channel();
        {
            let mut session = self.shared.session.lock().await;
            if session.state == ClientState::Closed {
                let _ = writer.disconnect().await;
                return Err(BrokerError::InvalidState("closed while connecting".to_string()));
            }
            let handle = tokio::spawn(supervise(self.shared.clone(), writer, reader, Some(online_tx)));
            session.supervisor = Some(handle);
        }

        match online_rx.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::InvalidState("closed while connecting".to_string())),
        }
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Payload>, qos: QoS, retain: bool) -> Result<(), BrokerError> {
        validate_topic(topic)?;
        let message = OutboundMessage { topic: topic.to_string(), payload: payload.into().into_bytes(), qos, retain };

        let writer = {
            let mut session = self.shared.session.lock().await;
            let state = session.state.clone();
            match state {
                ClientState::Connected => session.writer.clone(),
                ClientState::Connecting | ClientState::Disconnecting | ClientState::Reconnecting { .. } => {
                    if qos == QoS::AtMostOnce {
                        return Err(BrokerError::NotConnected(format!("QoS 0 publish to {} while {:?}", topic, state)));
                    }
                    session.queue.push(message)?;
                    debug!("Queued publish to {topic}, {} waiting", session.queue.len());
                    return Ok(());
                }
                _ => return Err(BrokerError::InvalidState(format!("publish while {:?}", state))),
            }
        };

        match writer {
            Some(writer) => writer.publish(&message).await,
            None => Err(BrokerError::NotConnected(format!("no link for publish to {topic}"))),
        }
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T, qos: QoS, retain: bool) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(value)?;
        self.publish(topic, Payload::Raw(bytes), qos, retain).await
    }

    /// Records `handler` for `pattern` and tells the broker when online.
    /// The record is kept even if the SUBSCRIBE cannot be sent; it is
    /// replayed on the next connect.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F, qos: QoS) -> Result<(), BrokerError>
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(pattern, Arc::new(handler), qos).await
    }

    pub async fn subscribe_handler(&self, pattern: &str, handler: Arc<dyn MessageHandler>, qos: QoS) -> Result<(), BrokerError> {
        let writer = {
            let mut session = self.shared.session.lock().await;
            if matches!(session.state, ClientState::Closed | ClientState::Failed) {
                return Err(BrokerError::InvalidState(format!("subscribe while {:?}", session.state)));
            }
            session.subscriptions.add(pattern, qos, handler)?;
            info!("Registered handler for {pattern}");
            match session.state {
                ClientState::Connected => session.writer.clone(),
                _ => None,
            }
        };

        if let Some(writer) = writer {
            writer.subscribe(pattern, qos).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let writer = {
            let mut session = self.shared.session.lock().await;
            if matches!(session.state, ClientState::Closed | ClientState::Failed) {
                return Err(BrokerError::InvalidState(format!("unsubscribe while {:?}", session.state)));
            }
            if !session.subscriptions.remove(pattern) {
                debug!("Unsubscribe for unknown pattern {pattern}");
                return Ok(());
            }
            match session.state {
                ClientState::Connected => session.writer.clone(),
                _ => None,
            }
        };

        if let Some(writer) = writer {
            writer.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    /// Disconnects and stops the dispatcher and any reconnect attempt.
    /// Queued messages are dropped. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let (writer, supervisor, reconnect) = {
            let mut session = self.shared.session.lock().await;
            if session.state == ClientState::Closed {
                return Ok(());
            }
            session.state = ClientState::Closed;
            if !session.queue.is_empty() {
                warn!("Dropping {} queued messages on close", session.queue.clear());
            }
            (session.writer.take(), session.supervisor.take(), session.reconnect.take())
        };

        if let Some(reconnect) = reconnect {
            reconnect.abort();
        }
        /* The link has to stay up until DISCONNECT is written */
        if let Some(writer) = writer {
            if let Err(e) = writer.disconnect().await {
                debug!("Disconnect failed: {e}");
            }
        }
        self.shared.stop.send_replace(true);
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        info!("MQTT session closed");
        Ok(())
    }

    pub async fn state(&self) -> ClientState {
        self.shared.session.lock().await.state.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let session = self.shared.session.lock().await;
        session.subscriptions.records().into_iter().map(|(pattern, _)| pattern).collect()
    }

    pub async fn queued(&self) -> usize {
        self.shared.session.lock().await.queue.len()
    }
}

async fn supervise(shared: Arc<Shared>, mut writer: Arc<dyn LinkWriter>, mut reader: Box<dyn LinkReader>, mut online: OnlineSender) {
    let mut stop = shared.stop.subscribe();
    /* Reset only when a link reaches Connected */
    let mut backoff = Backoff::new(shared.options.backoff.clone());
    loop {
        let end = run_connection(&shared, writer, &mut reader, &mut stop, &mut online, &mut backoff).await;
        let (reason, retriable) = match end {
            LinkEnd::Stopped => return,
            LinkEnd::Lost { reason, retriable } => (reason, retriable),
        };
        if *stop.borrow() {
            return;
        }

        {
            let mut session = shared.session.lock().await;
            if session.state == ClientState::Closed {
                return;
            }
            warn!("MQTT connection lost: {reason}");
            session.writer = None;
            session.state = ClientState::Disconnecting;
        }
        if !retriable {
            fail(&shared, &mut online, BrokerError::ConnectRejected(reason)).await;
            return;
        }

        let task = tokio::spawn(reconnect(shared.clone(), backoff));
        {
            let mut session = shared.session.lock().await;
            if session.state == ClientState::Closed {
                task.abort();
                return;
            }
            session.reconnect = Some(task.abort_handle());
        }
        let result = task.await;
        shared.session.lock().await.reconnect = None;

        match result {
            Ok((used, Ok(Some((w, r))))) => {
                backoff = used;
                writer = w;
                reader = r;
            }
            Ok((_, Ok(None))) => return,
            Ok((_, Err(e))) => {
                fail(&shared, &mut online, e).await;
                return;
            }
            Err(_) => return,
        }
    }
}

/* The attempt count outlives the task */
async fn reconnect(shared: Arc<Shared>, mut backoff: Backoff) -> (Backoff, Result<Option<Link>, BrokerError>) {
    let result = reconnect_attempts(&shared, &mut backoff).await;
    (backoff, result)
}

async fn reconnect_attempts(shared: &Shared, backoff: &mut Backoff) -> Result<Option<Link>, BrokerError> {
    let mut stop = shared.stop.subscribe();
    let mut last_error = String::from("connection lost");

    loop {
        let Some(delay) = backoff.next_delay() else {
            return Err(BrokerError::Transport(format!("gave up after {} attempts: {}", backoff.attempt(), last_error)));
        };
        {
            let mut session = shared.session.lock().await;
            if session.state == ClientState::Closed {
                return Ok(None);
            }
            session.state = ClientState::Reconnecting { attempt: backoff.attempt(), delay };
        }
        info!("Reconnecting to MQTT broker in {:?} (attempt {})", delay, backoff.attempt());

        if *stop.borrow() {
            return Ok(None);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = stop.changed() => return Ok(None),
        }

        match shared.connect_once().await {
            Ok(link) => return Ok(Some(link)),
            Err(e) if e.is_retriable() => {
                warn!("Reconnect attempt {} failed: {}", backoff.attempt(), e);
                last_error = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_connection(
    shared: &Arc<Shared>,
    writer: Arc<dyn LinkWriter>,
    reader: &mut Box<dyn LinkReader>,
    stop: &mut watch::Receiver<bool>,
    online: &mut OnlineSender,
    backoff: &mut Backoff,
) -> LinkEnd {
    {
        let mut session = shared.session.lock().await;
        if session.state == ClientState::Closed || *stop.borrow() {
            return LinkEnd::Stopped;
        }
        session.writer = Some(writer.clone());
    }

    let sync = bring_online(shared, writer);
    tokio::pin!(sync);
    let mut synced = false;

    loop {
        tokio::select! {
            event = reader.next_event() => match event {
                LinkEvent::Message(message) => dispatch(shared, &message).await,
                LinkEvent::Disconnected { reason, retriable } => return LinkEnd::Lost { reason, retriable },
            },
            result = &mut sync, if !synced => {
                synced = true;
                match result {
                    Ok(()) => {
                        backoff.reset();
                        if let Some(tx) = online.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(e) => return LinkEnd::Lost { reason: e.to_string(), retriable: true },
                }
            },
            _ = stop.changed() => return LinkEnd::Stopped,
        }
    }
}

/* Subscriptions go out before any queued publish; Connected is only set
 * once both are in sync with the local state. */
async fn bring_online(shared: &Shared, writer: Arc<dyn LinkWriter>) -> Result<(), BrokerError> {
    let mut synced_generation: Option<u64> = None;
    loop {
        let step = {
            let mut session = shared.session.lock().await;
            if session.state == ClientState::Closed {
                return Err(BrokerError::InvalidState("closed".to_string()));
            }
            let generation = session.subscriptions.generation();
            if synced_generation != Some(generation) {
                SyncStep::Resubscribe(generation, session.subscriptions.records())
            } else if let Some(message) = session.queue.pop() {
                SyncStep::Flush(message)
            } else {
                session.state = ClientState::Connected;
                info!("MQTT session online with {} subscriptions", session.subscriptions.records().len());
                return Ok(());
            }
        };

        match step {
            SyncStep::Resubscribe(generation, records) => {
                for (pattern, qos) in records {
                    debug!("Subscribing to {pattern}");
                    writer.subscribe(&pattern, qos).await?;
                }
                synced_generation = Some(generation);
            }
            SyncStep::Flush(message) => {
                if let Err(e) = writer.publish(&message).await {
                    shared.session.lock().await.queue.requeue(message);
                    return Err(e);
                }
            }
        }
    }
}

async fn dispatch(shared: &Shared, message: &InboundMessage) {
    let handlers = shared.session.lock().await.subscriptions.handlers_for(&message.topic);
    if handlers.is_empty() {
        debug!("No handler for topic {}", message.topic);
        return;
    }
    for handler in handlers {
        if let Err(e) = handler.handle(message) {
            error!("Handler for {} failed: {}", message.topic, e);
        }
    }
}

async fn fail(shared: &Shared, online: &mut OnlineSender, error: BrokerError) {
    let mut session = shared.session.lock().await;
    if session.state == ClientState::Closed {
        return;
    }
    let dropped = session.queue.clear();
    session.writer = None;
    session.state = ClientState::Failed;
    error!("MQTT session failed: {error}, dropped {dropped} queued messages");
    if let Some(tx) = online.take() {
        let _ = tx.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::link::mock::{Frame, MockBroker};
    use std::sync::Mutex as StdMutex;

    fn options() -> BrokerOptions {
        let mut options = BrokerOptions::new("mock", 1883);
        options.backoff = BackoffPolicy { base_ms: 5, multiplier: 2.0, cap_ms: 20, max_attempts: 0 };
        options.outbound_cap = 8;
        options
    }

    fn client(broker: &MockBroker, options: BrokerOptions) -> BrokerClient {
        BrokerClient::with_connector(options, Arc::new(broker.clone()))
    }

    async fn wait_for<F: Fn(&ClientState) -> bool>(client: &BrokerClient, check: F) -> ClientState {
        for _ in 0..400 {
            let state = client.state().await;
            if check(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state not reached, still {:?}", client.state().await);
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn recorder(log: &Arc<StdMutex<Vec<String>>>, name: &'static str) -> impl Fn(&InboundMessage) -> Result<(), HandlerError> {
        let log = log.clone();
        move |m: &InboundMessage| {
            log.lock().unwrap().push(format!("{name}:{}", m.topic));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connect_sends_recorded_subscriptions() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.subscribe("meters/#", |_: &InboundMessage| Ok(()), QoS::AtLeastOnce).await.unwrap();
        assert!(broker.frames().is_empty());

        client.connect().await.unwrap();
        assert_eq!(client.state().await, ClientState::Connected);
        assert_eq!(broker.frames(), vec![Frame::Connect, Frame::Subscribe("meters/#".to_string())]);
    }

    #[tokio::test]
    async fn test_rejected_connect_returns_to_init() {
        let broker = MockBroker::new();
        broker.reject_connects();
        let client = client(&broker, options());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectRejected(_)));
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(client.state().await, ClientState::Init);
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions_before_publish() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();
        client.subscribe("sensors/+/temp", |_: &InboundMessage| Ok(()), QoS::AtLeastOnce).await.unwrap();

        broker.fail_next_connects(3);
        broker.drop_connection(true);
        wait_for(&client, |s| matches!(s, ClientState::Reconnecting { .. })).await;
        client.publish("sensors/kitchen/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false).await.unwrap();

        wait_for(&client, |s| *s == ClientState::Connected).await;
        let frames = broker.frames();
        let second_connect = frames.iter().rposition(|f| *f == Frame::Connect).unwrap();
        assert_eq!(
            frames[second_connect..].to_vec(),
            vec![
                Frame::Connect,
                Frame::Subscribe("sensors/+/temp".to_string()),
                Frame::Publish("sensors/kitchen/temp".to_string(), b"21.5".to_vec()),
            ]
        );
        assert_eq!(client.queued().await, 0);
    }

    #[tokio::test]
    async fn test_backpressure_while_reconnecting() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connection(true);
        wait_for(&client, |s| matches!(s, ClientState::Reconnecting { .. })).await;

        for i in 0..8 {
            client.publish(&format!("q/{i}"), b"x".to_vec(), QoS::AtLeastOnce, false).await.unwrap();
        }
        let err = client.publish("q/8", b"x".to_vec(), QoS::AtLeastOnce, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::BackpressureExceeded(8)));
        assert_eq!(err.kind(), ErrorKind::BackpressureExceeded);
        assert_eq!(client.queued().await, 8);

        broker.set_available(true);
        wait_for(&client, |s| *s == ClientState::Connected).await;
        let published: Vec<String> = broker
            .frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Publish(topic, _) => Some(topic),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..8).map(|i| format!("q/{i}")).collect();
        assert_eq!(published, expected);
    }

    #[tokio::test]
    async fn test_qos0_fails_fast_while_disconnected() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connection(true);
        wait_for(&client, |s| matches!(s, ClientState::Reconnecting { .. })).await;

        let err = client.publish("a/b", b"1".to_vec(), QoS::AtMostOnce, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));
        assert_eq!(client.queued().await, 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_dispatch_in_registration_order() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        let log = Arc::new(StdMutex::new(Vec::new()));
        client.subscribe("a/+/c", recorder(&log, "X"), QoS::AtLeastOnce).await.unwrap();
        client.subscribe("a/b/#", recorder(&log, "Y"), QoS::AtLeastOnce).await.unwrap();
        client.subscribe("a/b/d", recorder(&log, "Z"), QoS::AtLeastOnce).await.unwrap();
        client.connect().await.unwrap();

        broker.deliver("a/b/c", b"{}");
        wait_until(|| log.lock().unwrap().len() >= 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec!["X:a/b/c".to_string(), "Y:a/b/c".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_dispatch() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        let log = Arc::new(StdMutex::new(Vec::new()));
        client
            .subscribe("s/#", |_: &InboundMessage| Err("broken handler".into()), QoS::AtLeastOnce)
            .await
            .unwrap();
        client.subscribe("s/+", recorder(&log, "ok"), QoS::AtLeastOnce).await.unwrap();
        client.connect().await.unwrap();

        broker.deliver("s/1", b"1");
        broker.deliver("s/2", b"2");
        wait_until(|| log.lock().unwrap().len() == 2).await;
        assert_eq!(client.state().await, ClientState::Connected);
    }

    #[tokio::test]
    async fn test_inbound_json_is_decoded_by_handler() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        let seen = Arc::new(StdMutex::new(None));
        let sink = seen.clone();
        client
            .subscribe(
                "m/ts",
                move |m: &InboundMessage| {
                    *sink.lock().unwrap() = Some(m.decode()?);
                    Ok(())
                },
                QoS::AtLeastOnce,
            )
            .await
            .unwrap();
        client.connect().await.unwrap();

        broker.deliver("m/ts", br#"{"at":"2024-03-01T12:00:00Z"}"#);
        wait_until(|| seen.lock().unwrap().is_some()).await;
        let value = seen.lock().unwrap().take().unwrap();
        assert!(matches!(value.get("at"), Some(PayloadValue::DateTime(_))));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_and_drop_queue() {
        let broker = MockBroker::new();
        let mut options = options();
        options.backoff.max_attempts = 2;
        let client = client(&broker, options);
        client.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connection(true);
        wait_for(&client, |s| matches!(s, ClientState::Reconnecting { .. } | ClientState::Failed)).await;
        let _ = client.publish("a/b", b"1".to_vec(), QoS::AtLeastOnce, false).await;

        wait_for(&client, |s| *s == ClientState::Failed).await;
        assert_eq!(client.queued().await, 0);
        let err = client.publish("a/b", b"1".to_vec(), QoS::AtLeastOnce, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_non_retriable_loss_fails() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();
        broker.drop_connection(false);
        wait_for(&client, |s| *s == ClientState::Failed).await;
        assert_eq!(broker.frames(), vec![Frame::Connect]);
    }

    #[tokio::test]
    async fn test_refused_resubscribe_uses_up_attempts() {
        let broker = MockBroker::new();
        let mut options = options();
        options.backoff.max_attempts = 3;
        let client = client(&broker, options);
        client.subscribe("meters/#", |_: &InboundMessage| Ok(()), QoS::AtLeastOnce).await.unwrap();
        client.connect().await.unwrap();

        broker.refuse_subscribes();
        broker.drop_connection(true);
        wait_for(&client, |s| *s == ClientState::Failed).await;

        let connects = broker.frames().iter().filter(|f| **f == Frame::Connect).count();
        assert_eq!(connects, 4);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_record() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();
        client.subscribe("a/b", |_: &InboundMessage| Ok(()), QoS::AtMostOnce).await.unwrap();
        client.subscribe("c/d", |_: &InboundMessage| Ok(()), QoS::AtMostOnce).await.unwrap();
        client.unsubscribe("a/b").await.unwrap();
        client.unsubscribe("a/b").await.unwrap();

        assert_eq!(client.subscriptions().await, vec!["c/d".to_string()]);
        assert_eq!(broker.frames().last(), Some(&Frame::Unsubscribe("a/b".to_string())));
    }

    #[tokio::test]
    async fn test_invalid_patterns_and_topics() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        let err = client.subscribe("a/#/b", |_: &InboundMessage| Ok(()), QoS::AtMostOnce).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        client.connect().await.unwrap();
        assert!(client.publish("a/+", b"1".to_vec(), QoS::AtMostOnce, false).await.is_err());
        assert!(client.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_json() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();

        let mut value = PayloadValue::object();
        value.insert("power", 12.5);
        client.publish("m/1", value, QoS::AtLeastOnce, false).await.unwrap();
        client.publish_json("m/2", &vec![1, 2], QoS::AtLeastOnce, true).await.unwrap();

        let frames = broker.frames();
        assert!(frames.contains(&Frame::Publish("m/1".to_string(), br#"{"power":12.5}"#.to_vec())));
        assert!(frames.contains(&Frame::Publish("m/2".to_string(), b"[1,2]".to_vec())));
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_invalid() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        let err = client.publish("a/b", b"1".to_vec(), QoS::AtLeastOnce, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client.state().await, ClientState::Closed);
        assert_eq!(broker.frames(), vec![Frame::Connect, Frame::Disconnect]);
        let err = client.publish("a/b", b"1".to_vec(), QoS::AtLeastOnce, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn test_close_cancels_reconnect() {
        let broker = MockBroker::new();
        let client = client(&broker, options());
        client.connect().await.unwrap();
        broker.set_available(false);
        broker.drop_connection(true);
        wait_for(&client, |s| matches!(s, ClientState::Reconnecting { .. })).await;

        client.close().await.unwrap();
        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(client.state().await, ClientState::Closed);
        assert_eq!(broker.frames(), vec![Frame::Connect]);
    }

    #[tokio::test]
    async fn test_close_sends_disconnect_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if received.is_empty() {
                    /* CONNACK, session accepted */
                    socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                }
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let client = BrokerClient::new(BrokerOptions::new("127.0.0.1", port));
        client.connect().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state().await, ClientState::Closed);

        let received = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(received[0], 0x10);
        assert!(received.ends_with(&[0xE0, 0x00]), "no DISCONNECT in {:02x?}", received);
    }

    #[test]
    fn test_options_defaults_from_yaml() {
        let options: BrokerOptions = serde_yml::from_str("host: broker.local\n").unwrap();
        assert_eq!(options.port, 1883);
        assert_eq!(options.client_id, "energylink");
        assert_eq!(options.user, None);
        assert_eq!(options.outbound_cap, 100);
        assert_eq!(options.backoff, BackoffPolicy::default());
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(7), QoS::AtMostOnce);
    }
}
