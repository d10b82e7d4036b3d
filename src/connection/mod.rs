use rand::Rng;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Packet, QoS, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// SSL first, then one plain-TCP fallback.
pub const MAX_CONNECT_ATTEMPTS: u32 = 2;
const REQUEST_CAPACITY: usize = 256;
const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker {host}:{port} is not reachable")]
    Unreachable { host: String, port: u16 },
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("timed out waiting for the broker to acknowledge the connection")]
    Timeout,
    #[error("transport error: {0}")]
    Client(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Lost { reason: String },
    Message { topic: String, payload: String },
}

/// The narrow publish/subscribe surface the rest of the bridge depends on.
pub trait MqttLink: Send + Sync {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError>;
    fn subscribe(&self, filter: &str) -> Result<(), PublishError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub client_id: String,
    pub will_topic: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
}

impl BrokerSettings {
    fn mqtt_options(&self, secure: bool) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(false);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_last_will(LastWill::new(
            &self.will_topic,
            "offline",
            QoS::AtMostOnce,
            true,
        ));
        if let Some(user) = self.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        if secure {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// The live client handle shared with publishers. Holds at most one client;
/// installing a new session replaces the previous one.
pub struct BrokerLink {
    client: RwLock<Option<AsyncClient>>,
    state: RwLock<ConnectionState>,
}

impl Default for BrokerLink {
    fn default() -> Self {
        Self {
            client: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }
}

impl BrokerLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if previous != next {
            tracing::info!("MQTT connection state: {:?} -> {:?}", previous, next);
            *state = next;
        }
        previous
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_client(&self, client: Option<AsyncClient>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    fn has_client(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl MqttLink for BrokerLink {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let client = self.client().ok_or(PublishError::NotConnected)?;
        client.try_publish(topic, QoS::AtMostOnce, retain, payload)?;
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), PublishError> {
        let client = self.client().ok_or(PublishError::NotConnected)?;
        client.try_subscribe(filter, QoS::AtMostOnce)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// An acknowledged broker session that has not been handed to a driver yet.
pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    secure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Bounded retry state for one `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    pub attempt_count: u32,
    pub ssl_allowed: bool,
}

impl RetryContext {
    pub fn new(ssl: bool) -> Self {
        Self {
            attempt_count: 0,
            ssl_allowed: ssl,
        }
    }

    /// A transport-level failure over TLS downgrades to plain TCP once.
    /// Unreachable brokers and explicit rejections are final.
    pub fn after_failure(&mut self, err: &ConnectError) -> RetryDecision {
        self.attempt_count += 1;
        if self.attempt_count >= MAX_CONNECT_ATTEMPTS || !self.ssl_allowed {
            return RetryDecision::GiveUp;
        }
        match err {
            ConnectError::Client(_) | ConnectError::Timeout => {
                self.ssl_allowed = false;
                RetryDecision::Retry
            }
            ConnectError::Unreachable { .. } | ConnectError::Rejected(_) => RetryDecision::GiveUp,
        }
    }
}

/// Exponential reconnect delay with up to 10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = delay.as_millis() as u64 / 10;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkChange {
    pub reachability: Option<bool>,
    pub connection: Option<bool>,
}

/// Remembers the last observed reachability and connection flags so only
/// transitions get logged.
#[derive(Debug, Clone, Copy)]
pub struct NetworkWatch {
    reachable: bool,
    connected: bool,
}

impl NetworkWatch {
    pub fn new(reachable: bool, connected: bool) -> Self {
        Self {
            reachable,
            connected,
        }
    }

    pub fn observe(&mut self, reachable: bool, connected: bool) -> NetworkChange {
        let change = NetworkChange {
            reachability: (reachable != self.reachable).then_some(reachable),
            connection: (connected != self.connected).then_some(connected),
        };
        self.reachable = reachable;
        self.connected = connected;
        change
    }
}

/// TCP probe used before any protocol-level connect.
pub async fn is_reachable(host: &str, port: u16, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(err)) => {
            tracing::debug!("Broker {}:{} is not reachable: {}", host, port, err);
            false
        }
        Err(_) => {
            tracing::debug!("Broker {}:{} probe timed out", host, port);
            false
        }
    }
}

pub struct ConnectionManager {
    settings: BrokerSettings,
    link: Arc<BrokerLink>,
    events: mpsc::Sender<LinkEvent>,
    reconnect: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connecting: AtomicBool,
    watch: Mutex<NetworkWatch>,
}

impl ConnectionManager {
    pub fn new(
        settings: BrokerSettings,
        link: Arc<BrokerLink>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            settings,
            link,
            events,
            reconnect: Arc::new(Notify::new()),
            driver: Mutex::new(None),
            connecting: AtomicBool::new(false),
            watch: Mutex::new(NetworkWatch::new(true, false)),
        }
    }

    pub fn has_session(&self) -> bool {
        self.link.has_client()
    }

    /// Probes the broker, then opens a session, downgrading from TLS to
    /// plain TCP at most once. Never opens a protocol session when the probe
    /// fails.
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        let mut retry = RetryContext::new(self.settings.ssl);
        self.link.transition(ConnectionState::Connecting);
        loop {
            match self.attempt(retry.ssl_allowed).await {
                Ok(session) => return Ok(session),
                Err(err) => match retry.after_failure(&err) {
                    RetryDecision::Retry => {
                        tracing::warn!("SSL connection failed: {}. Trying non-SSL connection...", err);
                    }
                    RetryDecision::GiveUp => {
                        self.link.transition(ConnectionState::Disconnected);
                        return Err(err);
                    }
                },
            }
        }
    }

    async fn attempt(&self, secure: bool) -> Result<Session, ConnectError> {
        let s = &self.settings;
        if !is_reachable(&s.host, s.port, s.probe_timeout).await {
            return Err(ConnectError::Unreachable {
                host: s.host.clone(),
                port: s.port,
            });
        }

        let scheme = if secure { "ssl" } else { "tcp" };
        tracing::info!("Connecting to MQTT broker: {}://{}:{}", scheme, s.host, s.port);
        let (client, mut eventloop) = AsyncClient::new(s.mqtt_options(secure), REQUEST_CAPACITY);
        timeout(s.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectError::Timeout)??;

        Ok(Session {
            client,
            eventloop,
            secure,
        })
    }

    /// Makes `session` the single live session and starts driving it.
    pub async fn install(&self, session: Session) {
        let Session {
            client,
            eventloop,
            secure,
        } = session;
        tracing::info!("MQTT session established (tls: {})", secure);
        self.link.set_client(Some(client));
        self.link.transition(ConnectionState::Connected);

        let handle = tokio::spawn(drive_session(
            eventloop,
            Arc::clone(&self.link),
            self.events.clone(),
            Arc::clone(&self.reconnect),
            Backoff::new(
                self.settings.reconnect_interval,
                self.settings.max_reconnect_interval,
            ),
        ));
        let previous = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        let _ = self.events.send(LinkEvent::Connected).await;
    }

    /// Connects and installs a session unless a connect is already running.
    pub async fn establish(&self) -> Result<(), ConnectError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Connect already in progress");
            return Ok(());
        }
        let outcome = self.connect().await;
        let result = match outcome {
            Ok(session) => {
                self.install(session).await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    pub fn mark_offline(&self) {
        self.watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(false, false);
    }

    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Periodic reachability poll. Logs transitions; when the broker is
    /// reachable but no session is connected it either nudges the driver or,
    /// with no session at all, runs a full connect.
    pub async fn check_network(&self) {
        let s = &self.settings;
        let reachable = is_reachable(&s.host, s.port, s.probe_timeout).await;
        let connected = self.link.is_connected();
        let change = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(reachable, connected);

        match change.reachability {
            Some(true) => tracing::info!("Network connectivity restored - MQTT broker is now reachable"),
            Some(false) => tracing::warn!("Network connectivity lost - MQTT broker {}:{} is no longer reachable", s.host, s.port),
            None => {}
        }
        match change.connection {
            Some(true) => tracing::info!("MQTT connection restored"),
            Some(false) => tracing::warn!("MQTT connection lost"),
            None => {}
        }

        if !reachable || connected {
            return;
        }
        if !self.has_session() {
            tracing::info!("Attempting to connect to MQTT broker...");
            if let Err(err) = self.establish().await {
                tracing::warn!("Connection attempt failed: {}", err);
            }
        } else if change.reachability == Some(true) {
            tracing::info!("Attempting to reconnect to MQTT broker...");
            self.request_reconnect();
        }
    }

    /// Publishes the offline marker, disconnects and stops the driver.
    pub async fn shutdown(&self) {
        if let Err(err) = self
            .link
            .publish(&self.settings.will_topic, "offline".to_string(), true)
        {
            tracing::debug!("Could not publish offline status: {}", err);
        }
        if let Some(client) = self.link.client() {
            self.link.transition(ConnectionState::Disconnected);
            let _ = client.try_disconnect();
            // let the driver flush the offline marker and the disconnect
            sleep(Duration::from_millis(250)).await;
        }
        if let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.link.set_client(None);
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ConnectError::Rejected(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Rejected(format!("{code:?}")));
            }
            Err(err) => return Err(ConnectError::Client(err.to_string())),
        }
    }
}

/// Polls the event loop for the lifetime of the session. rumqttc reconnects
/// on the next poll after an error, so the loop only has to pace retries.
async fn drive_session(
    mut eventloop: EventLoop,
    link: Arc<BrokerLink>,
    events: mpsc::Sender<LinkEvent>,
    reconnect: Arc<Notify>,
    mut backoff: Backoff,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                let previous = link.transition(ConnectionState::Connected);
                (previous != ConnectionState::Connected).then_some(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(LinkEvent::Message {
                topic: publish.topic,
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            }),
            Ok(_) => None,
            Err(err) => {
                let previous = link.state();
                if previous == ConnectionState::Disconnected {
                    // shutting down
                    return;
                }
                if previous == ConnectionState::Connected {
                    link.transition(ConnectionState::Reconnecting);
                    if events
                        .send(LinkEvent::Lost {
                            reason: err.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let delay = backoff.next_delay();
                tracing::debug!("Reconnecting in {:?} after: {}", delay, err);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = reconnect.notified() => {
                        tracing::info!("Immediate reconnect requested");
                    }
                }
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}
