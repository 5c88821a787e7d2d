use crate::config::{BrokerConfig, TransportKind};
use crate::subscription_registry::SubscriptionRegistry;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnAck, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use thiserror::Error;
use tokio::time::{sleep, Duration};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
}

/// The operations the rest of the service needs from an MQTT client.
pub trait BrokerClient: Send + Sync + 'static {
    /// Queues a subscribe request without waiting for the broker.
    fn request_subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'_, Result<(), BrokerError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;
}

impl BrokerClient for AsyncClient {
    fn request_subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            AsyncClient::publish(self, topic, QoS::AtMostOnce, false, payload).await?;
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            AsyncClient::disconnect(self).await?;
            Ok(())
        }
        .boxed()
    }
}

/// Receives every incoming publish as `(topic, payload)`.
pub type MessageListener = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Subscribe requests waiting for their packet id, then for their SubAck.
#[derive(Debug, Default)]
struct PendingAcks {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnect delays for the event loop: doubling from the configured interval,
/// capped at 60 s, reset by any successful poll.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    current: Duration,
    failures: i32,
    max_retries: i32,
}

impl Backoff {
    /// `max_retries <= 0` retries forever.
    fn new(initial: Duration, max_retries: i32) -> Self {
        Self {
            initial,
            current: initial,
            failures: 0,
            max_retries,
        }
    }

    fn on_success(&mut self) {
        self.failures = 0;
        self.current = self.initial;
    }

    /// The delay before the next attempt, or `None` once the retries are used up.
    fn on_error(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.max_retries > 0 && self.failures >= self.max_retries {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_RETRY_INTERVAL);
        Some(delay)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single broker connection of the process.
///
/// The network connection is opened on the first call to [`MqttService::client`],
/// not at construction. Connection errors are logged by the event loop and never
/// reach callers.
pub struct MqttService {
    config: BrokerConfig,
    client: OnceLock<Arc<dyn BrokerClient>>,
    registry: Mutex<SubscriptionRegistry>,
    acks: Mutex<PendingAcks>,
    listeners: Mutex<Vec<(u64, MessageListener)>>,
    next_listener_id: AtomicU64,
    connected_once: AtomicBool,
    closed: AtomicBool,
}

impl MqttService {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: OnceLock::new(),
            registry: Mutex::new(SubscriptionRegistry::new()),
            acks: Mutex::new(PendingAcks::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            connected_once: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_client(config: BrokerConfig, client: Arc<dyn BrokerClient>) -> Arc<Self> {
        let service = Self::new(config);
        let _ = service.client.set(client);
        service
    }

    /// Returns the shared client, connecting on first use.
    pub fn client(self: &Arc<Self>) -> Arc<dyn BrokerClient> {
        self.client.get_or_init(|| self.connect()).clone()
    }

    #[cfg(test)]
    pub(crate) fn is_connected(&self) -> bool {
        self.client.get().is_some()
    }

    fn connect(self: &Arc<Self>) -> Arc<dyn BrokerClient> {
        let config = &self.config;
        debug!(
            "Configuring MQTT broker at {} (port {})...",
            config.broker_addr(),
            config.port
        );

        let mut mqtt_options = MqttOptions::new(&config.client_id, config.broker_addr(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);

        match config.transport {
            TransportKind::Tcp => {}
            TransportKind::Ws => {
                mqtt_options.set_transport(Transport::Ws);
            }
            TransportKind::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
        }

        if !config.username.is_empty() && !config.password.is_empty() {
            mqtt_options.set_credentials(&config.username, &config.password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        tokio::spawn(self.clone().run_event_loop(eventloop));

        Arc::new(client)
    }

    async fn run_event_loop(self: Arc<Self>, mut eventloop: EventLoop) {
        info!("Starting MQTT event loop...");

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.retry_interval_ms),
            self.config.max_retries,
        );

        loop {
            match eventloop.poll().await {
                Ok(event) => {
                    backoff.on_success();
                    self.handle_event(event);
                }
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        info!("MQTT event loop stopped after disconnect.");
                        break;
                    }

                    error!("Error in MQTT event loop: {:?}", e);
                    let Some(retry_interval) = backoff.on_error() else {
                        error!(
                            "Maximum number of retries ({}) reached. Stopping the event loop.",
                            self.config.max_retries
                        );
                        break;
                    };

                    warn!(
                        "Lost connection to MQTT broker. Retrying in {:?}...",
                        retry_interval
                    );
                    sleep(retry_interval).await;
                }
            }
        }
    }

    pub(crate) fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.dispatch(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::ConnAck(connack)) => {
                self.on_connack(&connack);
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                self.resolve_ack(suback.pkid, &suback.return_codes);
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut acks = lock(&self.acks);
                match acks.queued.pop_front() {
                    Some(topic) => {
                        acks.in_flight.insert(pkid, topic);
                    }
                    None => debug!("Outgoing subscribe {} has no tracked topic.", pkid),
                }
            }
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }

    fn on_connack(&self, connack: &ConnAck) {
        info!("Connected to MQTT broker.");

        let reconnected = self.connected_once.swap(true, Ordering::SeqCst);
        if reconnected && !connack.session_present {
            self.restore_subscriptions();
        }
    }

    /// Re-requests every known topic after the broker dropped our session.
    fn restore_subscriptions(&self) {
        let Some(client) = self.client.get() else {
            return;
        };

        let registry = lock(&self.registry);
        let mut acks = lock(&self.acks);
        acks.in_flight.clear();

        for topic in registry.topics() {
            if acks.queued.iter().any(|queued| queued == topic) {
                continue;
            }
            acks.queued.push_back(topic.to_string());
            match client.request_subscribe(topic) {
                Ok(()) => info!("Restoring subscription to '{}'.", topic),
                Err(e) => {
                    acks.queued.pop_back();
                    error!("Error restoring subscription to '{}': {}", topic, e);
                }
            }
        }
    }

    fn resolve_ack(&self, pkid: u16, return_codes: &[SubscribeReasonCode]) {
        let topic = lock(&self.acks).in_flight.remove(&pkid);
        let Some(topic) = topic else {
            debug!("SubAck {} does not match a tracked request.", pkid);
            return;
        };

        let accepted = !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        let mut registry = lock(&self.registry);
        if accepted {
            info!("Subscribed to {}", topic);
            registry.mark_subscribed(&topic);
        } else {
            error!("Error subscribing to {}: broker rejected the request", topic);
            registry.abandon(&topic);
        }
    }

    /// Requests a broker subscription for `topic` unless one exists or is in flight.
    ///
    /// Returns true when a new request was handed to the client. The request is
    /// fire-and-forget: the registry only marks the topic subscribed once the
    /// SubAck arrives.
    pub fn ensure_subscribed(self: &Arc<Self>, topic: &str) -> bool {
        let client = self.client();

        let mut registry = lock(&self.registry);
        if !registry.begin_request(topic) {
            if registry.has(topic) {
                debug!("Already subscribed to '{}'.", topic);
            } else {
                debug!("Subscription to '{}' is awaiting its acknowledgement.", topic);
            }
            return false;
        }

        let mut acks = lock(&self.acks);
        acks.queued.push_back(topic.to_string());
        match client.request_subscribe(topic) {
            Ok(()) => {
                debug!("Requested subscription to '{}'.", topic);
                true
            }
            Err(e) => {
                acks.queued.pop_back();
                registry.abandon(topic);
                error!("Error subscribing to {}: {}", topic, e);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_subscribed(&self, topic: &str) -> bool {
        lock(&self.registry).has(topic)
    }

    pub fn add_listener(self: &Arc<Self>, listener: MessageListener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, listener));
        ListenerHandle {
            id,
            service: Some(Arc::downgrade(self)),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    /// Hands a message to every listener. Listeners filter by topic themselves.
    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) {
        let listeners: Vec<MessageListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        if listeners.is_empty() {
            debug!("Message on '{}' arrived with no listeners attached.", topic);
        }
        for listener in listeners {
            listener(topic, payload);
        }
    }

    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.get() {
            match client.disconnect().await {
                Ok(()) => info!("Disconnected from MQTT broker."),
                Err(e) => error!("Failed to disconnect from MQTT broker: {}", e),
            }
        }
    }
}

/// Detaches one listener. Dropping the handle leaves the listener attached.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    service: Option<Weak<MqttService>>,
}

impl ListenerHandle {
    /// A handle that owns nothing, for callers that never attached a listener.
    pub fn noop() -> Self {
        Self { id: 0, service: None }
    }

    #[cfg(test)]
    pub(crate) fn is_noop(&self) -> bool {
        self.service.is_none()
    }

    /// Stops delivery to this listener. Never closes the connection or
    /// forgets the topic subscription.
    pub fn detach(self) {
        if let Some(service) = self.service.as_ref().and_then(Weak::upgrade) {
            service.remove_listener(self.id);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    fn rejected_request(topic: &str) -> rumqttc::Request {
        rumqttc::Request::Publish(rumqttc::Publish::new(topic, QoS::AtMostOnce, Vec::new()))
    }

    /// Records requests instead of talking to a broker.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub subscribes: Mutex<Vec<String>>,
        pub publishes: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail_publish: AtomicBool,
        pub fail_subscribe: AtomicBool,
        pub publish_delay_ms: AtomicU64,
    }

    impl FakeClient {
        pub fn subscribe_requests(&self) -> Vec<String> {
            lock(&self.subscribes).clone()
        }

        pub fn published(&self) -> Vec<(String, Vec<u8>)> {
            lock(&self.publishes).clone()
        }
    }

    impl BrokerClient for FakeClient {
        fn request_subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(BrokerError::Client(ClientError::TryRequest(rejected_request(topic))));
            }
            lock(&self.subscribes).push(topic.to_string());
            Ok(())
        }

        fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'_, Result<(), BrokerError>> {
            async move {
                let delay = self.publish_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    sleep(Duration::from_millis(delay)).await;
                }
                if self.fail_publish.load(Ordering::SeqCst) {
                    return Err(BrokerError::Client(ClientError::Request(rejected_request(&topic))));
                }
                lock(&self.publishes).push((topic, payload));
                Ok(())
            }
            .boxed()
        }

        fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
            async { Ok(()) }.boxed()
        }
    }

    pub(crate) fn fake_service() -> (Arc<MqttService>, Arc<FakeClient>) {
        let fake = Arc::new(FakeClient::default());
        let service = MqttService::with_client(crate::config::test_config().broker, fake.clone());
        (service, fake)
    }

    pub(crate) fn publish_event(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(rumqttc::Publish::new(
            topic,
            QoS::AtMostOnce,
            payload.as_bytes().to_vec(),
        )))
    }

    /// Walks a queued subscribe through its packet id and a SubAck.
    pub(crate) fn ack_next_subscribe(service: &MqttService, pkid: u16, accepted: bool) {
        service.handle_event(Event::Outgoing(Outgoing::Subscribe(pkid)));
        let code = if accepted {
            SubscribeReasonCode::Success(QoS::AtMostOnce)
        } else {
            SubscribeReasonCode::Failure
        };
        service.handle_event(Event::Incoming(Packet::SubAck(rumqttc::SubAck::new(
            pkid,
            vec![code],
        ))));
    }
}
