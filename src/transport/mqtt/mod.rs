//! Reliable MQTT client transport
//!
//! Broker-based MCP transport built on `rumqttc`. MCP payloads travel
//! verbatim in publish payloads on per-client topics resolved from a
//! configurable prefix. The transport layers reliability on top of the
//! broker session:
//!
//! - QoS > 0 publishes are tracked in an in-flight window
//!   ([`inflight::InflightTracker`]) until the broker acknowledges them,
//!   with bounded retries on a configurable interval.
//! - Disconnects trigger automatic reconnection with jittered exponential
//!   backoff; subscriptions are restored and in-flight messages
//!   retransmitted after every reconnect.
//! - A ping monitor watches broker keep-alive traffic and counts missed
//!   pongs.
//! - Optionally, the session (subscriptions, allocator position,
//!   in-flight window) persists across process restarts through
//!   [`session::SessionStore`].
//!
//! Outbound messages go through a bounded queue; when it is full the
//! publish is rejected with a transport error rather than blocking.

pub mod inflight;
pub mod session;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{McpgateError, Result};
use crate::transport::{backoff_delay, Transport};

use inflight::{InflightMessage, InflightTracker};
use session::{unix_millis, PersistedInflight, SessionState, SessionStore};

/// Last-will message registered with the broker at connect time.
#[derive(Debug, Clone)]
pub struct LastWillConfig {
    /// Topic the broker publishes the will to.
    pub topic: String,
    /// Will payload.
    pub payload: String,
}

/// Configuration for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Broker host.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Client ID; generated when absent.
    pub client_id: Option<String>,
    /// Broker username.
    pub username: Option<String>,
    /// Broker password.
    pub password: Option<String>,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// QoS for MCP publishes (0, 1, or 2).
    pub qos: u8,
    /// Retain flag for MCP publishes.
    pub retain: bool,
    /// Ask the broker for a clean session.
    pub clean_start: bool,
    /// Topic prefix, e.g. `"mcp/"`.
    pub topic_prefix: String,
    /// Subscribe to every client's request topic (server side).
    pub server_mode: bool,
    /// Optional broker last-will.
    pub last_will: Option<LastWillConfig>,
    /// Base delay for reconnect backoff.
    pub reconnect_base_delay: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max_delay: Duration,
    /// Cadence of the ping monitor.
    pub ping_interval: Duration,
    /// Age after which an unacknowledged publish is retransmitted.
    pub message_retry_interval: Duration,
    /// Retransmissions before a publish is dropped.
    pub max_message_retries: u32,
    /// Cap on unacknowledged QoS > 0 publishes.
    pub max_inflight: usize,
    /// Bound of the outbound request queue.
    pub outbound_queue_size: usize,
    /// Directory for session files; `None` disables persistence.
    pub session_storage_dir: Option<std::path::PathBuf>,
    /// Session expiry used by the cleanup task.
    pub session_expiry: Duration,
}

impl MqttTransportConfig {
    /// Defaults for the given broker.
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            client_id: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            qos: 1,
            retain: false,
            clean_start: false,
            topic_prefix: "mcp/".to_string(),
            server_mode: false,
            last_will: None,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            message_retry_interval: Duration::from_secs(5),
            max_message_retries: 3,
            max_inflight: 64,
            outbound_queue_size: 256,
            session_storage_dir: None,
            session_expiry: Duration::from_secs(3600),
        }
    }
}

/// MCP topics resolved once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpTopics {
    /// Client publishes requests here.
    pub request: String,
    /// Server publishes responses here.
    pub response: String,
    /// Server publishes notifications here.
    pub notification: String,
    /// Wildcard over every client's request topic (server side).
    pub server_requests: String,
}

/// Expand the topic templates for one client.
pub fn resolve_topics(prefix: &str, client_id: &str) -> McpTopics {
    McpTopics {
        request: format!("{prefix}request/{client_id}"),
        response: format!("{prefix}response/{client_id}"),
        notification: format!("{prefix}notification/{client_id}"),
        server_requests: format!("{prefix}request/+"),
    }
}

/// One recorded broker subscription.
#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    qos: u8,
}

#[derive(Debug, Default)]
struct MqttCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    acks: AtomicU64,
    retries: AtomicU64,
    expired: AtomicU64,
    reconnects: AtomicU64,
    ping_failures: AtomicU64,
}

/// Point-in-time snapshot returned by [`MqttTransport::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub acks: u64,
    pub retries: u64,
    pub expired: u64,
    pub reconnects: u64,
    pub ping_failures: u64,
    pub pending_pings: u32,
    pub inflight: usize,
    pub connected: bool,
}

#[derive(Debug, Default)]
struct PingState {
    pending: u32,
    failures: u32,
}

/// Session-persistence context shared with worker tasks.
#[derive(Clone)]
struct SessionPersist {
    store: Arc<SessionStore>,
    client_id: String,
    created_ms: u64,
    expiry_secs: u32,
}

/// State shared between the transport facade and its worker tasks.
#[derive(Clone)]
struct WorkerShared {
    client: AsyncClient,
    inflight: Arc<Mutex<InflightTracker>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    ping: Arc<Mutex<PingState>>,
    counters: Arc<MqttCounters>,
    connected: Arc<AtomicBool>,
    message_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    session: Option<SessionPersist>,
}

impl WorkerShared {
    fn lock_inflight(&self) -> MutexGuard<'_, InflightTracker> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ping(&self) -> MutexGuard<'_, PingState> {
        self.ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot the session and save it on a detached task. Lock order:
    /// inflight, then subscriptions; the session file mutex is taken last
    /// inside the store.
    fn persist_session(&self) {
        let Some(persist) = &self.session else {
            return;
        };
        let state = {
            let tracker = self.lock_inflight();
            let subs = self.lock_subscriptions();
            snapshot_session(persist, &tracker, &subs)
        };
        let store = Arc::clone(&persist.store);
        tokio::spawn(async move {
            if let Err(e) = store.save(&state).await {
                tracing::debug!(error = %e, "session save skipped");
            }
        });
    }
}

fn snapshot_session(
    persist: &SessionPersist,
    tracker: &InflightTracker,
    subscriptions: &[Subscription],
) -> SessionState {
    SessionState {
        client_id: persist.client_id.clone(),
        created_ms: persist.created_ms,
        last_access_ms: unix_millis(),
        expiry_secs: persist.expiry_secs,
        subscriptions: subscriptions
            .iter()
            .map(|s| (s.topic.clone(), i32::from(s.qos)))
            .collect(),
        last_packet_id: tracker.last_packet_id(),
        inflight: tracker
            .snapshot()
            .into_iter()
            .map(|m| PersistedInflight {
                packet_id: m.packet_id,
                topic: m.topic,
                payload: m.payload.to_vec(),
                qos: i32::from(m.qos),
                retain: m.retain,
                sent_ms: m.sent_unix_ms,
                retry: m.retry_count,
            })
            .collect(),
    }
}

/// Broker-based MCP transport.
///
/// # Examples
///
/// ```no_run
/// use mcpgate::transport::mqtt::{MqttTransport, MqttTransportConfig};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = MqttTransport::new(MqttTransportConfig::new("broker.local", 1883))?;
/// transport.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttTransport {
    config: MqttTransportConfig,
    client_id: String,
    topics: McpTopics,
    client: AsyncClient,
    /// Taken by [`start`](Self::start).
    event_loop: Mutex<Option<EventLoop>>,
    inflight: Arc<Mutex<InflightTracker>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    ping: Arc<Mutex<PingState>>,
    counters: Arc<MqttCounters>,
    connected: Arc<AtomicBool>,
    message_tx: mpsc::UnboundedSender<String>,
    message_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    session_store: Option<Arc<SessionStore>>,
    created_ms: u64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("client_id", &self.client_id)
            .field("broker", &self.config.broker_host)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MqttTransport {
    /// Build the broker client. No network I/O happens until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`McpgateError::InvalidParams`] for an out-of-range QoS.
    pub fn new(config: MqttTransportConfig) -> Result<Self> {
        if config.qos > 2 {
            return Err(
                McpgateError::InvalidParams(format!("QoS {} out of range", config.qos)).into(),
            );
        }

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mcpgate-{}", uuid::Uuid::new_v4().simple()));
        let topics = resolve_topics(&config.topic_prefix, &client_id);

        let mut options =
            MqttOptions::new(&client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_start);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                to_qos(config.qos),
                config.retain,
            ));
        }

        let (client, event_loop) = AsyncClient::new(options, config.outbound_queue_size);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let session_store = config
            .session_storage_dir
            .as_ref()
            .map(|dir| Arc::new(SessionStore::new(dir.clone())));

        Ok(Self {
            client_id,
            topics,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            inflight: Arc::new(Mutex::new(InflightTracker::new(config.max_inflight))),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            ping: Arc::new(Mutex::new(PingState::default())),
            counters: Arc::new(MqttCounters::default()),
            connected: Arc::new(AtomicBool::new(false)),
            message_tx,
            message_rx: Arc::new(tokio::sync::Mutex::new(message_rx)),
            session_store,
            created_ms: unix_millis(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// The effective client ID (configured or generated).
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The resolved MCP topics for this client.
    pub fn topics(&self) -> &McpTopics {
        &self.topics
    }

    /// True while a broker session is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Start the broker I/O, retry, ping-monitor, and session-cleanup
    /// tasks. Restores a persisted session first when persistence is on
    /// and clean-start is off.
    ///
    /// # Errors
    ///
    /// [`McpgateError::InvalidParams`] when called twice.
    pub async fn start(&self) -> Result<()> {
        let event_loop = self
            .lock_event_loop()
            .take()
            .ok_or_else(|| McpgateError::InvalidParams("transport already started".to_string()))?;

        if let Some(store) = &self.session_store {
            if !self.config.clean_start {
                self.restore_session(store).await?;
            }
        }

        // Default subscriptions for this side of the conversation; issued
        // against the broker on every ConnAck.
        {
            let defaults: Vec<&str> = if self.config.server_mode {
                vec![&self.topics.server_requests]
            } else {
                vec![&self.topics.response, &self.topics.notification]
            };
            let mut subs = self.lock_subscriptions();
            for topic in defaults {
                if !subs.iter().any(|s| s.topic == topic) {
                    subs.push(Subscription {
                        topic: topic.to_string(),
                        qos: self.config.qos,
                    });
                }
            }
        }

        let shared = self.worker_shared();
        let mut tasks = self.lock_tasks();
        tasks.push(tokio::spawn(event_worker(shared.clone(), event_loop)));
        tasks.push(tokio::spawn(retry_worker(
            shared.clone(),
            self.config.message_retry_interval,
            self.config.max_message_retries,
        )));
        tasks.push(tokio::spawn(ping_worker(
            shared,
            self.config.ping_interval,
        )));
        if let Some(store) = &self.session_store {
            tasks.push(store.spawn_cleanup_task(
                self.config.session_expiry.max(Duration::from_secs(60)),
                self.shutdown.clone(),
            ));
        }
        Ok(())
    }

    /// Publish an MCP payload to `topic` with the configured QoS/retain.
    ///
    /// QoS > 0 publishes enter the in-flight window first; the entry is
    /// rolled back when the bounded outbound queue rejects the message.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Shutdown`] after [`close`](Transport::close), and
    /// [`McpgateError::Transport`] when the in-flight window or the
    /// outbound queue is full.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(McpgateError::Shutdown("transport closed".to_string()).into());
        }

        let qos = self.config.qos;
        if qos > 0 {
            let packet_id = {
                let mut tracker = self.lock_inflight();
                let packet_id = tracker.allocate()?;
                tracker.insert(InflightMessage {
                    packet_id,
                    topic: topic.to_string(),
                    payload: Bytes::copy_from_slice(payload),
                    qos,
                    retain: self.config.retain,
                    sent_at: Instant::now(),
                    sent_unix_ms: unix_millis(),
                    retry_count: 0,
                });
                packet_id
            };

            if let Err(e) =
                self.client
                    .try_publish(topic, to_qos(qos), self.config.retain, payload.to_vec())
            {
                self.lock_inflight().remove(packet_id);
                return Err(McpgateError::Transport(format!(
                    "outbound queue rejected publish: {e}"
                ))
                .into());
            }
            self.worker_shared().persist_session();
        } else if let Err(e) =
            self.client
                .try_publish(topic, to_qos(qos), self.config.retain, payload.to_vec())
        {
            return Err(
                McpgateError::Transport(format!("outbound queue rejected publish: {e}")).into(),
            );
        }

        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Subscribe to `topic` and record it for restoration after
    /// reconnects.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Transport`] when the request queue rejects the
    /// subscription.
    pub async fn subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        self.client
            .subscribe(topic, to_qos(qos))
            .await
            .map_err(|e| McpgateError::Transport(format!("subscribe failed: {e}")))?;

        {
            let mut subs = self.lock_subscriptions();
            if let Some(existing) = subs.iter_mut().find(|s| s.topic == topic) {
                existing.qos = qos;
            } else {
                subs.push(Subscription {
                    topic: topic.to_string(),
                    qos,
                });
            }
        }
        self.worker_shared().persist_session();
        Ok(())
    }

    /// Unsubscribe from `topic`; it will not be restored on reconnect.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| McpgateError::Transport(format!("unsubscribe failed: {e}")))?;
        self.lock_subscriptions().retain(|s| s.topic != topic);
        self.worker_shared().persist_session();
        Ok(())
    }

    /// Counter and gauge snapshot.
    pub fn stats(&self) -> MqttStats {
        let ping = self.ping.lock().unwrap_or_else(PoisonError::into_inner);
        MqttStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            acks: self.counters.acks.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            ping_failures: self.counters.ping_failures.load(Ordering::Relaxed),
            pending_pings: ping.pending,
            inflight: self.lock_inflight().len(),
            connected: self.connected.load(Ordering::SeqCst),
        }
    }

    async fn restore_session(&self, store: &Arc<SessionStore>) -> Result<()> {
        let Some(state) = store.load(&self.client_id).await? else {
            return Ok(());
        };
        tracing::info!(
            client_id = %self.client_id,
            subscriptions = state.subscriptions.len(),
            inflight = state.inflight.len(),
            "restored persisted MQTT session"
        );
        {
            let mut tracker = self.lock_inflight();
            tracker.set_last_packet_id(state.last_packet_id);
            for message in state.inflight {
                tracker.insert(InflightMessage {
                    packet_id: message.packet_id,
                    topic: message.topic,
                    payload: Bytes::from(message.payload),
                    qos: message.qos.clamp(0, 2) as u8,
                    retain: message.retain,
                    sent_at: Instant::now(),
                    sent_unix_ms: message.sent_ms,
                    retry_count: message.retry,
                });
            }
        }
        {
            let mut subs = self.lock_subscriptions();
            for (topic, qos) in state.subscriptions {
                if !subs.iter().any(|s| s.topic == topic) {
                    subs.push(Subscription {
                        topic,
                        qos: qos.clamp(0, 2) as u8,
                    });
                }
            }
        }
        Ok(())
    }

    fn worker_shared(&self) -> WorkerShared {
        WorkerShared {
            client: self.client.clone(),
            inflight: Arc::clone(&self.inflight),
            subscriptions: Arc::clone(&self.subscriptions),
            ping: Arc::clone(&self.ping),
            counters: Arc::clone(&self.counters),
            connected: Arc::clone(&self.connected),
            message_tx: self.message_tx.clone(),
            shutdown: self.shutdown.clone(),
            reconnect_base_delay: self.config.reconnect_base_delay,
            reconnect_max_delay: self.config.reconnect_max_delay,
            session: self.session_store.as_ref().map(|store| SessionPersist {
                store: Arc::clone(store),
                client_id: self.client_id.clone(),
                created_ms: self.created_ms,
                expiry_secs: self.config.session_expiry.as_secs() as u32,
            }),
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, InflightTracker> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<tokio::task::JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_event_loop(&self) -> MutexGuard<'_, Option<EventLoop>> {
        self.event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    /// Publish one serialized JSON-RPC message on this side's outbound
    /// topic (requests for clients, responses for servers).
    async fn send(&self, message: String) -> Result<()> {
        let topic = if self.config.server_mode {
            self.topics.response.clone()
        } else {
            self.topics.request.clone()
        };
        self.publish(&topic, message.as_bytes())
    }

    /// Stream of broker-delivered payloads, in per-subscription order.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.message_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Save the session, stop every worker task, and disconnect.
    /// Idempotent.
    async fn close(&self) -> Result<()> {
        let shared = self.worker_shared();
        if !self.shutdown.is_cancelled() {
            // Final synchronous save before the store refuses I/O.
            if let Some(persist) = &shared.session {
                let state = {
                    let tracker = self.lock_inflight();
                    let subs = self.lock_subscriptions();
                    snapshot_session(persist, &tracker, &subs)
                };
                if let Err(e) = persist.store.save(&state).await {
                    tracing::debug!(error = %e, "final session save failed");
                }
            }
        }

        self.shutdown.cancel();
        if let Some(store) = &self.session_store {
            store.shutdown();
        }

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// QoS from the numeric config value.
fn to_qos(qos: u8) -> QoS {
    match qos {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

/// Drive the broker event loop: dispatch deliveries, retire acks, track
/// pings, and back off with jitter on connection errors. `rumqttc`
/// re-dials on the next poll, so backing off between polls is the
/// reconnect schedule.
async fn event_worker(shared: WorkerShared, mut event_loop: EventLoop) {
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = shared.client.try_disconnect();
                break;
            }
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    shared.connected.store(true, Ordering::SeqCst);
                    tracing::info!("broker session established");

                    // Restore subscriptions.
                    let subs: Vec<Subscription> = shared.lock_subscriptions().clone();
                    for sub in subs {
                        if let Err(e) = shared.client.try_subscribe(&sub.topic, to_qos(sub.qos)) {
                            tracing::warn!(topic = %sub.topic, error = %e, "re-subscribe failed");
                        }
                    }

                    // Retransmit the in-flight window.
                    let pending = shared.lock_inflight().snapshot();
                    for message in pending {
                        let _ = shared.client.try_publish(
                            &message.topic,
                            to_qos(message.qos),
                            message.retain,
                            message.payload.to_vec(),
                        );
                    }
                    shared.persist_session();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(text) => {
                            let _ = shared.message_tx.send(text);
                        }
                        Err(_) => {
                            tracing::warn!(topic = %publish.topic, "dropping non-UTF-8 payload");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(_)))
                | Ok(Event::Incoming(Packet::PubComp(_))) => {
                    shared.counters.acks.fetch_add(1, Ordering::Relaxed);
                    shared.lock_inflight().ack_oldest();
                    shared.persist_session();
                }
                Ok(Event::Incoming(Packet::PingResp)) => {
                    let mut ping = shared.lock_ping();
                    ping.pending = ping.pending.saturating_sub(1);
                    ping.failures = 0;
                }
                Ok(Event::Outgoing(Outgoing::PingReq)) => {
                    shared.lock_ping().pending += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.connected.store(false, Ordering::SeqCst);
                    shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(
                        shared.reconnect_base_delay,
                        failures,
                        shared.reconnect_max_delay,
                    );
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "broker connection error; backing off"
                    );
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
}

/// Retransmit overdue in-flight publishes; drop ones that exhausted
/// their retries.
async fn retry_worker(shared: WorkerShared, interval: Duration, max_retries: u32) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let (retryable, expired) = shared
            .lock_inflight()
            .take_due(interval, max_retries, unix_millis());
        let changed = !retryable.is_empty() || !expired.is_empty();

        for message in retryable {
            shared.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                packet_id = message.packet_id,
                retry = message.retry_count,
                "retransmitting unacknowledged publish"
            );
            let _ = shared.client.try_publish(
                &message.topic,
                to_qos(message.qos),
                message.retain,
                message.payload.to_vec(),
            );
        }
        for packet_id in expired {
            shared.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::error!(packet_id, "publish dropped after exhausting retries");
        }
        if changed {
            shared.persist_session();
        }
    }
}

/// Watch broker keep-alive traffic: more than one outstanding ping at a
/// monitor tick counts as a missed pong.
async fn ping_worker(shared: WorkerShared, interval: Duration) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let missed = {
            let mut ping = shared.lock_ping();
            if ping.pending > 1 {
                ping.failures += 1;
                Some((ping.pending, ping.failures))
            } else {
                None
            }
        };
        if let Some((pending, failures)) = missed {
            shared.counters.ping_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pending, failures, "broker pong overdue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_topics_expands_templates() {
        let topics = resolve_topics("mcp/", "client-9");
        assert_eq!(topics.request, "mcp/request/client-9");
        assert_eq!(topics.response, "mcp/response/client-9");
        assert_eq!(topics.notification, "mcp/notification/client-9");
        assert_eq!(topics.server_requests, "mcp/request/+");
    }

    #[test]
    fn test_to_qos_mapping() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_generated_client_ids_are_unique() {
        let config = MqttTransportConfig::new("127.0.0.1", 1883);
        let a = MqttTransport::new(config.clone()).unwrap();
        let b = MqttTransport::new(config).unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("mcpgate-"));
    }

    #[tokio::test]
    async fn test_qos_out_of_range_rejected() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1883);
        config.qos = 3;
        assert!(MqttTransport::new(config).is_err());
    }

    #[tokio::test]
    async fn test_publish_tracks_inflight_window() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1883);
        config.client_id = Some("window-test".to_string());
        // The event loop is never started, so nothing drains the queue,
        // but the first publishes fit the request channel.
        let transport = MqttTransport::new(config).unwrap();

        transport.publish("mcp/request/window-test", b"{}").unwrap();
        let stats = transport.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.inflight, 1);
    }

    #[tokio::test]
    async fn test_publish_rejected_when_outbound_queue_full() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1883);
        config.client_id = Some("overflow-test".to_string());
        config.outbound_queue_size = 1;
        let transport = MqttTransport::new(config).unwrap();

        // Nothing polls the event loop, so the single queue slot fills.
        transport.publish("t", b"first").unwrap();
        let err = transport.publish("t", b"second").unwrap_err();
        assert!(matches!(
            crate::error::as_mcpgate_error(&err),
            Some(McpgateError::Transport(_))
        ));
        // The rolled-back publish left no in-flight entry behind.
        assert_eq!(transport.stats().inflight, 1);
    }

    #[tokio::test]
    async fn test_inflight_cap_rejects_publish() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1883);
        config.client_id = Some("cap-test".to_string());
        config.max_inflight = 2;
        let transport = MqttTransport::new(config).unwrap();

        transport.publish("t", b"a").unwrap();
        transport.publish("t", b"b").unwrap();
        let err = transport.publish("t", b"c").unwrap_err();
        assert!(matches!(
            crate::error::as_mcpgate_error(&err),
            Some(McpgateError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_further_publishes() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1883);
        config.client_id = Some("close-test".to_string());
        let transport = MqttTransport::new(config).unwrap();
        transport.close().await.unwrap();

        let err = transport.publish("t", b"{}").unwrap_err();
        assert!(crate::error::as_mcpgate_error(&err).unwrap().is_shutdown());
        // close() is idempotent.
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_rejected_and_close_joins_tasks() {
        let mut config = MqttTransportConfig::new("127.0.0.1", 1);
        config.client_id = Some("lifecycle-test".to_string());
        // Keep the doomed connect loop quiet and fast.
        config.reconnect_base_delay = Duration::from_millis(10);
        config.reconnect_max_delay = Duration::from_millis(50);
        let transport = MqttTransport::new(config).unwrap();

        transport.start().await.unwrap();
        assert!(transport.start().await.is_err());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_session_restore_rebuilds_window_and_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store
            .save(&SessionState {
                client_id: "restore-test".to_string(),
                created_ms: 1,
                last_access_ms: 1,
                expiry_secs: 3600,
                subscriptions: vec![("custom/topic".to_string(), 1)],
                last_packet_id: 40,
                inflight: vec![PersistedInflight {
                    packet_id: 40,
                    topic: "mcp/request/restore-test".to_string(),
                    payload: b"{}".to_vec(),
                    qos: 1,
                    retain: false,
                    sent_ms: 1,
                    retry: 0,
                }],
            })
            .await
            .unwrap();

        let mut config = MqttTransportConfig::new("127.0.0.1", 1);
        config.client_id = Some("restore-test".to_string());
        config.session_storage_dir = Some(dir.path().to_path_buf());
        config.reconnect_base_delay = Duration::from_millis(10);
        let transport = MqttTransport::new(config).unwrap();

        transport.start().await.unwrap();
        assert_eq!(transport.stats().inflight, 1);
        // The next allocation continues after the persisted position.
        let next = transport.lock_inflight().allocate().unwrap();
        assert_eq!(next, 41);
        assert!(transport
            .lock_subscriptions()
            .iter()
            .any(|s| s.topic == "custom/topic"));

        transport.close().await.unwrap();
    }
}
