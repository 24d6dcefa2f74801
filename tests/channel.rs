//! Notification channel tests against an in-process MQTT 3.1.1 broker

use serde_json::{json, Value};
use smartclock_control::{
    topic_matches, BrokerConfig, BrokerTransport, ChannelState, ClockError, NotificationChannel,
    ReconnectPolicy, Topics,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum BrokerEvent {
    Connect { conn: usize, client_id: String },
    Subscribe { conn: usize, topic: String },
    Unsubscribe { conn: usize, topic: String },
    Publish { conn: usize, topic: String, payload: Vec<u8> },
    Disconnect { conn: usize },
}

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    filters: Vec<String>,
}

type Peers = Arc<Mutex<HashMap<usize, Peer>>>;

/// Just enough of an MQTT 3.1.1 broker for QoS 0 traffic
struct Broker {
    port: u16,
    peers: Peers,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl Broker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peers: Peers = Arc::default();
        let (events_tx, events) = mpsc::unbounded_channel();

        let accept_peers = peers.clone();
        let task = tokio::spawn(async move {
            let mut next_conn = 0;
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(next_conn, stream, accept_peers.clone(), events_tx.clone()));
                next_conn += 1;
            }
        });

        Self {
            port,
            peers,
            events,
            task,
        }
    }

    /// Deliver a PUBLISH to every connection subscribed to `topic`
    fn publish(&self, topic: &str, payload: &[u8]) {
        let packet = publish_packet(topic, payload);
        for peer in self.peers.lock().unwrap().values() {
            if peer.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = peer.tx.send(packet.clone());
            }
        }
    }

    /// Close every client socket without sending anything
    fn drop_connections(&self) {
        self.peers.lock().unwrap().clear();
    }

    /// Wait for the next event matching `pred`, skipping the rest
    async fn expect(&mut self, pred: impl Fn(&BrokerEvent) -> bool) -> BrokerEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("broker stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("broker event not seen")
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    conn: usize,
    mut stream: TcpStream,
    peers: Peers,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    let (tx, mut outbound) = mpsc::unbounded_channel();
    peers.lock().unwrap().insert(
        conn,
        Peer {
            tx,
            filters: Vec::new(),
        },
    );

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    'conn: loop {
        while let Some((header, body)) = take_frame(&mut buf) {
            let reply = match header >> 4 {
                1 => {
                    let client_id = read_str(&body, 10).0;
                    let _ = events.send(BrokerEvent::Connect { conn, client_id });
                    Some(frame(0x20, &[0x00, 0x00]))
                }
                3 => {
                    let (topic, mut pos) = read_str(&body, 0);
                    if (header >> 1) & 0x03 > 0 {
                        pos += 2;
                    }
                    let payload = body[pos..].to_vec();
                    let _ = events.send(BrokerEvent::Publish {
                        conn,
                        topic,
                        payload,
                    });
                    None
                }
                8 => {
                    let mut ack = body[..2].to_vec();
                    let mut pos = 2;
                    while pos < body.len() {
                        let (topic, next) = read_str(&body, pos);
                        pos = next + 1;
                        if let Some(peer) = peers.lock().unwrap().get_mut(&conn) {
                            peer.filters.push(topic.clone());
                        }
                        let _ = events.send(BrokerEvent::Subscribe { conn, topic });
                        ack.push(0x00);
                    }
                    Some(frame(0x90, &ack))
                }
                10 => {
                    let mut pos = 2;
                    while pos < body.len() {
                        let (topic, next) = read_str(&body, pos);
                        pos = next;
                        if let Some(peer) = peers.lock().unwrap().get_mut(&conn) {
                            peer.filters.retain(|f| *f != topic);
                        }
                        let _ = events.send(BrokerEvent::Unsubscribe { conn, topic });
                    }
                    Some(frame(0xB0, &body[..2]))
                }
                12 => Some(frame(0xD0, &[])),
                14 => {
                    let _ = events.send(BrokerEvent::Disconnect { conn });
                    break 'conn;
                }
                _ => None,
            };

            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    break 'conn;
                }
            }
        }

        tokio::select! {
            read = stream.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            },
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if stream.write_all(&packet).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    peers.lock().unwrap().remove(&conn);
}

/// Split one complete packet off the front of `buf`
fn take_frame(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    let mut len = 0usize;
    let mut shift = 0;
    let mut pos = 1;
    loop {
        let byte = *buf.get(pos)?;
        len |= ((byte & 0x7f) as usize) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    if buf.len() < pos + len {
        return None;
    }

    let header = buf[0];
    let body = buf[pos..pos + len].to_vec();
    buf.drain(..pos + len);
    Some((header, body))
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend_from_slice(body);
    out
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = (topic.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    frame(0x30, &body)
}

/// Length-prefixed UTF-8 string at `pos`, with the offset just past it
fn read_str(body: &[u8], pos: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    let start = pos + 2;
    let text = String::from_utf8_lossy(&body[start..start + len]).into_owned();
    (text, start + len)
}

fn config(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        transport: BrokerTransport::Tcp,
        connect_timeout_ms: 2000,
        reconnect: ReconnectPolicy::Fixed { delay_ms: 200 },
        ..BrokerConfig::default()
    }
}

async fn connected(broker: &Broker) -> NotificationChannel {
    let mut channel = NotificationChannel::new(config(broker.port), Topics::default());
    channel.connect().await.unwrap();
    channel
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn wait_for_state(states: &mut watch::Receiver<ChannelState>, want: ChannelState) {
    timeout(WAIT, states.wait_for(|s| *s == want))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test]
async fn connect_reaches_connected_with_generated_id() {
    let mut broker = Broker::start().await;
    let channel = connected(&broker).await;

    assert_eq!(channel.state(), ChannelState::Connected);
    assert!(channel.is_connected());

    let BrokerEvent::Connect { client_id, .. } =
        broker.expect(|e| matches!(e, BrokerEvent::Connect { .. })).await
    else {
        unreachable!()
    };
    assert!(client_id.starts_with("web_client_"));
    assert_eq!(client_id.len(), "web_client_".len() + 8);
}

#[tokio::test]
async fn connect_times_out_without_connack() {
    // Accepts the socket and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut channel = NotificationChannel::new(
        BrokerConfig {
            connect_timeout_ms: 300,
            ..config(port)
        },
        Topics::default(),
    );
    let result = channel.connect().await;

    assert!(matches!(result, Err(ClockError::Timeout)));
    assert_eq!(channel.state(), ChannelState::Idle);
    silent.abort();
}

#[tokio::test]
async fn subscribing_twice_keeps_topic_once() {
    let mut broker = Broker::start().await;
    let channel = connected(&broker).await;

    assert!(channel.subscribe("clock/status").await.unwrap());
    assert!(channel.subscribe("clock/status").await.unwrap());

    broker
        .expect(|e| matches!(e, BrokerEvent::Subscribe { topic, .. } if topic == "clock/status"))
        .await;
    broker
        .expect(|e| matches!(e, BrokerEvent::Subscribe { topic, .. } if topic == "clock/status"))
        .await;

    wait_until(|| !channel.subscriptions().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        channel.subscriptions(),
        BTreeSet::from(["clock/status".to_string()])
    );
}

#[tokio::test]
async fn status_publish_fires_one_notification() {
    let broker = Broker::start().await;
    let channel = connected(&broker).await;
    let mut all = channel.notifications();
    let mut status = channel.on_topic("clock/+");
    let mut other = channel.on_topic("weather/#");

    channel.subscribe("clock/status").await.unwrap();
    wait_until(|| channel.subscriptions().contains("clock/status")).await;

    broker.publish("clock/status", b"temp=24");
    broker.publish("clock/status", br#"{"temp":24}"#);

    let notification = timeout(WAIT, all.recv()).await.unwrap().unwrap();
    assert_eq!(notification.topic, "clock/status");
    assert_eq!(notification.data, json!({ "temp": 24 }));

    let routed = timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert_eq!(routed, notification);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(all.try_recv().unwrap().is_none());
    assert!(status.try_recv().unwrap().is_none());
    assert!(other.try_recv().unwrap().is_none());
}

#[tokio::test]
async fn request_status_publishes_get_status_command() {
    let mut broker = Broker::start().await;
    let channel = connected(&broker).await;

    assert!(channel.request_status().await.unwrap());

    let BrokerEvent::Publish { topic, payload, .. } =
        broker.expect(|e| matches!(e, BrokerEvent::Publish { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(topic, "clock/cmd");

    let message: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(message["command"], "get_status");
    assert_eq!(message["source"], "web_client");
    assert_eq!(message["data"], json!({}));
    assert!(message["timestamp"].is_i64());
}

#[tokio::test]
async fn unsubscribe_leaves_set() {
    let mut broker = Broker::start().await;
    let channel = connected(&broker).await;

    channel.subscribe("clock/status").await.unwrap();
    wait_until(|| channel.subscriptions().contains("clock/status")).await;

    assert!(channel.unsubscribe("clock/status").await.unwrap());
    assert!(channel.subscriptions().is_empty());
    broker
        .expect(|e| matches!(e, BrokerEvent::Unsubscribe { topic, .. } if topic == "clock/status"))
        .await;
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resubscribes() {
    let mut broker = Broker::start().await;
    let channel = connected(&broker).await;

    channel.subscribe("clock/status").await.unwrap();
    wait_until(|| channel.subscriptions().contains("clock/status")).await;
    broker
        .expect(|e| matches!(e, BrokerEvent::Subscribe { conn: 0, .. }))
        .await;

    let mut states = channel.state_changes();
    broker.drop_connections();

    wait_for_state(&mut states, ChannelState::Closed).await;
    wait_for_state(&mut states, ChannelState::Connected).await;

    broker
        .expect(|e| matches!(e, BrokerEvent::Connect { conn: 1, .. }))
        .await;
    let resubscribed = broker
        .expect(|e| matches!(e, BrokerEvent::Subscribe { conn: 1, .. }))
        .await;
    assert_eq!(
        resubscribed,
        BrokerEvent::Subscribe {
            conn: 1,
            topic: "clock/status".to_string()
        }
    );

    // Notifications flow over the new session
    let mut all = channel.notifications();
    wait_until(|| {
        broker
            .peers
            .lock()
            .unwrap()
            .get(&1)
            .is_some_and(|p| !p.filters.is_empty())
    })
    .await;
    broker.publish("clock/status", br#"{"alarm":"on"}"#);
    let notification = timeout(WAIT, all.recv()).await.unwrap().unwrap();
    assert_eq!(notification.data, json!({ "alarm": "on" }));
    assert!(channel.subscriptions().contains("clock/status"));
}

#[tokio::test]
async fn disconnect_sends_disconnect_and_goes_idle() {
    let mut broker = Broker::start().await;
    let mut channel = connected(&broker).await;

    channel.subscribe("clock/status").await.unwrap();
    wait_until(|| channel.subscriptions().contains("clock/status")).await;

    channel.disconnect().await;

    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(!channel.is_connected());
    assert!(channel.subscriptions().is_empty());
    broker
        .expect(|e| matches!(e, BrokerEvent::Disconnect { conn: 0 }))
        .await;

    assert!(!channel.request_status().await.unwrap());
}
