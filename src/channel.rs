use crate::config::{BrokerConfig, BrokerTransport, ReconnectPolicy, Topics};
use crate::error::{ClockError, Result};
use crate::protocol::CommandMessage;
use crate::subscription::{Dispatcher, NotificationReceiver};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, StateError,
    SubAck, SubscribeReasonCode, Transport,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    /// Session dropped by a network or protocol error; a reconnect is pending
    Error,
    /// Broker ended the session or closed the socket; a reconnect is pending
    Closed,
}

/// Subscribe bookkeeping between request, packet id and SubAck
#[derive(Default)]
struct PendingSubscribes {
    /// Requested but not yet written to the wire, in request order
    queued: VecDeque<String>,
    /// Written and waiting for SubAck, by packet id
    in_flight: HashMap<u16, String>,
}

/// State shared between the channel handle and its event loop task
struct Shared {
    state: watch::Sender<ChannelState>,
    subscriptions: Mutex<BTreeSet<String>>,
    pending: Mutex<PendingSubscribes>,
    dispatcher: Dispatcher,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            state,
            subscriptions: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(PendingSubscribes::default()),
            dispatcher: Dispatcher::new(),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("MQTT state {:?} -> {:?}", previous, state);
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingSubscribes> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a subscribe request
    ///
    /// The lock is held across the enqueue so `queued` stays in the same
    /// order the event loop will write the packets.
    fn request_subscribe(&self, client: &AsyncClient, topic: &str) -> Result<()> {
        let mut pending = self.pending();
        client.try_subscribe(topic, QoS::AtMostOnce)?;
        pending.queued.push_back(topic.to_string());
        Ok(())
    }

    /// A SUBSCRIBE packet went out with `pkid`
    fn track_subscribe(&self, pkid: u16) {
        let mut pending = self.pending();
        match pending.queued.pop_front() {
            Some(topic) => {
                pending.in_flight.insert(pkid, topic);
            }
            None => tracing::debug!("Untracked subscribe packet {}", pkid),
        }
    }

    /// Record the outcome of a SubAck
    fn confirm_subscribe(&self, ack: &SubAck) {
        let Some(topic) = self.pending().in_flight.remove(&ack.pkid) else {
            tracing::debug!("SubAck for unknown packet {}", ack.pkid);
            return;
        };

        let granted = ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        if granted {
            tracing::info!("Subscribed to: {}", topic);
            self.subscriptions().insert(topic);
        } else {
            tracing::warn!("Broker refused subscription to {}", topic);
        }
    }

    /// Subscribe again to everything in the set after a fresh session
    fn resubscribe(&self, client: &AsyncClient) {
        let topics: Vec<String> = self.subscriptions().iter().cloned().collect();
        for topic in topics {
            if let Err(e) = self.request_subscribe(client, &topic) {
                tracing::warn!("Failed to resubscribe to {}: {}", topic, e);
            }
        }
    }

    fn reset_session(&self) {
        self.subscriptions().clear();
        let mut pending = self.pending();
        pending.queued.clear();
        pending.in_flight.clear();
    }
}

/// A live broker session owned by the channel
struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Optional MQTT session for push-style status and command exchange
///
/// Lifecycle is explicit: construct, [`connect`](Self::connect), use, then
/// [`disconnect`](Self::disconnect) (or drop). While connected the session
/// reconnects on its own according to the configured [`ReconnectPolicy`].
pub struct NotificationChannel {
    config: BrokerConfig,
    topics: Topics,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl NotificationChannel {
    /// Create an idle channel; nothing touches the network until `connect`
    pub fn new(config: BrokerConfig, topics: Topics) -> Self {
        Self {
            config,
            topics,
            shared: Arc::new(Shared::new()),
            session: None,
        }
    }

    /// Establish a clean session with a freshly generated client id
    ///
    /// Resolves once the broker acknowledges the connection. Fails with
    /// `Connection` if the first attempt errors, or `Timeout` if no
    /// acknowledgement arrives within the configured connect timeout.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            self.disconnect().await;
        }

        let client_id = generate_client_id();
        tracing::info!("Connecting to MQTT broker {} as {}", self.config.url(), client_id);

        let mut options = MqttOptions::new(client_id, self.config.url(), self.config.port);
        options.set_clean_session(true);
        options.set_keep_alive(self.config.keep_alive());
        match self.config.transport {
            BrokerTransport::Tcp => {}
            BrokerTransport::Ws => {
                options.set_transport(Transport::Ws);
            }
            BrokerTransport::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        self.shared.reset_session();
        self.shared.set_state(ChannelState::Connecting);

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            self.shared.clone(),
            self.config.reconnect,
            ready_tx,
        ));

        let outcome = match timeout(self.config.connect_timeout(), ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClockError::Connection("event loop stopped".to_string())),
            Err(_) => Err(ClockError::Timeout),
        };

        match outcome {
            Ok(()) => {
                self.session = Some(Session { client, task });
                Ok(())
            }
            Err(e) => {
                tracing::error!("MQTT connection failed: {}", e);
                task.abort();
                self.shared.set_state(ChannelState::Idle);
                Err(e)
            }
        }
    }

    /// End the session and stop reconnecting
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        // Idle first so the event loop treats the coming error as a shutdown
        self.shared.set_state(ChannelState::Idle);

        if let Err(e) = session.client.disconnect().await {
            tracing::debug!("Disconnect request not delivered: {}", e);
        }

        let mut task = session.task;
        if timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            task.abort();
        }

        self.shared.reset_session();
        tracing::info!("MQTT disconnected");
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.state() == ChannelState::Connected
    }

    /// Topics the broker has acknowledged
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.shared.subscriptions().clone()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Subscribe to `topic`
    ///
    /// Returns `Ok(false)` without doing anything when not connected. The
    /// topic joins [`subscriptions`](Self::subscriptions) once acknowledged.
    pub async fn subscribe(&self, topic: &str) -> Result<bool> {
        let Some(client) = self.connected_client() else {
            return Ok(false);
        };
        self.shared.request_subscribe(client, topic)?;
        Ok(true)
    }

    /// Unsubscribe from `topic` without waiting for the broker
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let Some(client) = self.connected_client() else {
            return Ok(false);
        };
        client.unsubscribe(topic).await?;
        self.shared.subscriptions().remove(topic);
        Ok(true)
    }

    /// Publish `payload` as JSON text
    ///
    /// Returns `Ok(false)` without sending when not connected. No delivery
    /// confirmation is awaited.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<bool> {
        let Some(client) = self.connected_client() else {
            return Ok(false);
        };

        let json = serde_json::to_string(payload)?;
        client
            .publish(topic, QoS::AtMostOnce, false, json.as_bytes().to_vec())
            .await?;
        tracing::debug!("Published to {}: {}", topic, json);
        Ok(true)
    }

    /// Publish a [`CommandMessage`] to the command topic
    pub async fn send_command(&self, command: &str, data: Map<String, Value>) -> Result<bool> {
        let message = CommandMessage::new(command, data);
        self.publish(&self.topics.command, &message).await
    }

    /// Ask the clock to publish its current status
    pub async fn request_status(&self) -> Result<bool> {
        self.send_command("get_status", Map::new()).await
    }

    /// Every decoded inbound message
    pub fn notifications(&self) -> NotificationReceiver {
        self.shared.dispatcher.subscribe_all()
    }

    /// Decoded inbound messages whose topic matches the MQTT `filter`
    pub fn on_topic(&self, filter: &str) -> NotificationReceiver {
        self.shared.dispatcher.subscribe_filter(filter)
    }

    fn connected_client(&self) -> Option<&AsyncClient> {
        if self.state() != ChannelState::Connected {
            return None;
        }
        self.session.as_ref().map(|s| &s.client)
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("web_client_{}", &id[..8])
}

/// Drive the MQTT event loop until shut down
///
/// The first outcome (ConnAck or error) is reported through `ready`. After
/// that, errors trigger a reconnect after the policy's delay, forever.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                shared.set_state(ChannelState::Connected);
                match ready.take() {
                    Some(tx) => {
                        tracing::info!("MQTT connected");
                        let _ = tx.send(Ok(()));
                    }
                    None => {
                        tracing::info!("MQTT reconnected");
                        shared.resubscribe(&client);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.dispatcher.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                shared.confirm_subscribe(&ack);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT connection closed by broker");
                shared.set_state(ChannelState::Closed);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.track_subscribe(pkid);
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(ClockError::Connection(e.to_string())));
                    return;
                }
                if shared.state() == ChannelState::Idle {
                    tracing::debug!("MQTT event loop stopped");
                    return;
                }

                if closed_by_broker(&e) {
                    tracing::info!("MQTT connection closed by broker");
                    shared.set_state(ChannelState::Closed);
                } else if shared.state() != ChannelState::Closed {
                    tracing::warn!("MQTT error: {}", e);
                    shared.set_state(ChannelState::Error);
                }
                shared.pending().in_flight.clear();

                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::info!("Reconnecting to MQTT broker in {:?}", delay);
                sleep(delay).await;

                if shared.state() == ChannelState::Idle {
                    return;
                }
                shared.set_state(ChannelState::Connecting);
            }
        }
    }
}

/// Whether `error` is the broker ending the connection rather than a failure
///
/// MQTT 3.1.1 brokers never send DISCONNECT; they just close the socket.
fn closed_by_broker(error: &ConnectionError) -> bool {
    let io_error = match error {
        ConnectionError::Io(e) | ConnectionError::MqttState(StateError::Io(e)) => e,
        _ => return false,
    };
    matches!(
        io_error.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}
