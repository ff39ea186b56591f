//! Broker connection manager.
//!
//! Owns the MQTT session for the simulated device. The `rumqttc` event loop is
//! confined to one background task which keeps the connection alive,
//! reconnects after failures and dispatches inbound messages to the injected
//! [`SessionListener`]. The main loop only holds the [`AsyncClient`] handle,
//! a cloneable request channel into that task, so no extra locking is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Qos, SimulatorConfig, generate_client_id};
use crate::error::{Result, SimulatorError};
use crate::listener::{ConnectOutcome, SessionListener};

/// Capacity of the client request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Pause between two reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for flushing the DISCONNECT packet on shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session operations the main loop depends on.
///
/// Implemented by [`ConnectionManager`]; tests substitute a recording double.
#[async_trait]
pub trait DeviceSession: Send {
    /// Prepare the session. Errors are reported, the caller may carry on.
    async fn connect(&mut self) -> Result<()>;

    /// Start servicing the network in the background.
    async fn start_background_service(&mut self) -> Result<()>;

    /// Hand one message to the transport.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;

    /// Stop the background service.
    async fn stop_background_service(&mut self) -> Result<()>;

    /// Close the session.
    async fn disconnect(&mut self) -> Result<()>;
}

struct BackgroundService {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<EventLoop>,
}

/// MQTT connection manager for one simulated device.
pub struct ConnectionManager {
    config: SimulatorConfig,
    client_id: String,
    listener: Arc<dyn SessionListener>,
    client: Option<AsyncClient>,
    /// Present between `connect` and `start_background_service`, and again
    /// after the service has been stopped.
    eventloop: Option<EventLoop>,
    service: Option<BackgroundService>,
    state: Arc<RwLock<SessionState>>,
}

impl ConnectionManager {
    /// Create a manager. Uses the configured client id or generates one.
    pub fn new(config: SimulatorConfig, listener: Arc<dyn SessionListener>) -> Self {
        let client_id = config
            .broker
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);

        Self {
            config,
            client_id,
            listener,
            client: None,
            eventloop: None,
            service: None,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Current session state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn is_service_running(&self) -> bool {
        self.service.is_some()
    }

    fn mqtt_options(&self) -> MqttOptions {
        let broker = &self.config.broker;
        let mut options = MqttOptions::new(&self.client_id, &broker.host, broker.port);
        options.set_keep_alive(broker.keep_alive());
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

#[async_trait]
impl DeviceSession for ConnectionManager {
    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        self.config.validate()?;
        if self.client_id.trim().is_empty() || self.client_id.trim() != self.client_id {
            return Err(SimulatorError::Configuration(format!(
                "invalid client id: {:?}",
                self.client_id
            )));
        }

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        *self.state.write().await = SessionState::Connecting;

        info!(
            category = "mqtt",
            client_id = %self.client_id,
            "Connecting to broker {}",
            self.config.broker.broker_addr()
        );
        Ok(())
    }

    async fn start_background_service(&mut self) -> Result<()> {
        if self.service.is_some() {
            return Ok(());
        }

        let client = self.client.clone().ok_or(SimulatorError::NotConnected)?;
        let eventloop = self.eventloop.take().ok_or(SimulatorError::NotConnected)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_service(
            eventloop,
            client,
            self.listener.clone(),
            self.state.clone(),
            self.config.command_topic(),
            self.config.qos,
            stop_rx,
        ));

        self.service = Some(BackgroundService { stop_tx, handle });
        debug!(category = "mqtt", "Background service started");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        let client = self.client.as_ref().ok_or(SimulatorError::NotConnected)?;
        // Non-blocking: a full request queue is reported as a failed publish
        // instead of stalling the publish cadence.
        client
            .try_publish(topic, qos.into(), false, payload)
            .map_err(|e| SimulatorError::Publish(e.to_string()))
    }

    async fn stop_background_service(&mut self) -> Result<()> {
        let Some(service) = self.service.take() else {
            return Ok(());
        };

        let _ = service.stop_tx.send(true);
        match service.handle.await {
            Ok(eventloop) => {
                self.eventloop = Some(eventloop);
                debug!(category = "mqtt", "Background service stopped");
                Ok(())
            }
            Err(e) => Err(SimulatorError::Connection(format!(
                "background service task failed: {}",
                e
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_background_service().await?;

        let Some(client) = self.client.take() else {
            return Ok(());
        };
        // Read through the Arc: `&self` must not be held across an await here.
        let was_connected = *self.state.read().await == SessionState::Connected;

        if let Err(e) = client.try_disconnect() {
            warn!(category = "mqtt", "Failed to queue disconnect: {}", e);
        }

        if let (true, Some(mut eventloop)) = (was_connected, self.eventloop.take()) {
            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(category = "mqtt", "Event loop closed during disconnect: {}", e);
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
                warn!(
                    category = "mqtt",
                    "Disconnect not flushed after {:?}",
                    DISCONNECT_TIMEOUT
                );
            }
        }

        self.eventloop = None;
        *self.state.write().await = SessionState::Disconnected;
        info!(
            category = "mqtt",
            "Disconnected from broker {}",
            self.config.broker.broker_addr()
        );
        Ok(())
    }
}

/// Background service: polls the event loop until told to stop and hands the
/// event loop back so the DISCONNECT packet can still be flushed.
async fn run_service(
    mut eventloop: EventLoop,
    client: AsyncClient,
    listener: Arc<dyn SessionListener>,
    state: Arc<RwLock<SessionState>>,
    command_topic: String,
    qos: Qos,
    mut stop_rx: watch::Receiver<bool>,
) -> EventLoop {
    // Set on every CONNACK, cleared once the SUBSCRIBE is queued. While the
    // broker was unreachable the request queue may have filled up with
    // readings, so the subscribe is retried after each event until the event
    // loop has drained enough of them.
    let mut pending_subscribe = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                *state.write().await = SessionState::Connected;
                listener.on_connect(&ConnectOutcome::Accepted {
                    session_present: ack.session_present,
                });
                pending_subscribe = true;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    category = "mqtt",
                    topic = %publish.topic,
                    "Received message, payload length: {}",
                    publish.payload.len()
                );
                listener.on_message(&publish.topic, &publish.payload[..]);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(category = "mqtt", "Subscription acknowledged: {:?}", ack.return_codes);
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!(category = "mqtt", "All client handles dropped, stopping service");
                break;
            }
            Err(e) => {
                pending_subscribe = false;
                let previous =
                    std::mem::replace(&mut *state.write().await, SessionState::Connecting);
                match (&e, previous) {
                    (ConnectionError::ConnectionRefused(code), _) => {
                        listener.on_connect(&ConnectOutcome::Refused(format!("{:?}", code)));
                    }
                    (_, SessionState::Connected) => {
                        warn!(category = "mqtt", "Connection lost, reconnecting: {}", e);
                    }
                    _ => listener.on_connect(&ConnectOutcome::Failed(e.to_string())),
                }

                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
                continue;
            }
        }

        if pending_subscribe {
            pending_subscribe = !queue_subscribe(&client, &command_topic, qos);
        }
    }

    eventloop
}

/// Queue the command topic subscription without waiting.
///
/// This runs on the task that consumes the request channel, so an awaiting
/// send could deadlock on a full queue. Returns false when the queue is full
/// and the caller should try again after the next event.
fn queue_subscribe(client: &AsyncClient, command_topic: &str, qos: Qos) -> bool {
    match client.try_subscribe(command_topic, qos.into()) {
        Ok(()) => {
            info!(category = "mqtt", "Subscribed to {}", command_topic);
            true
        }
        Err(e) => {
            debug!(
                category = "mqtt",
                "Subscribe to {} deferred, request queue busy: {}",
                command_topic,
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingListener {
        outcomes: Mutex<Vec<ConnectOutcome>>,
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl SessionListener for RecordingListener {
        fn on_connect(&self, outcome: &ConnectOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }

        fn on_message(&self, topic: &str, payload: &[u8]) {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
        }
    }

    fn local_config(port: u16) -> SimulatorConfig {
        let mut config = SimulatorConfig::default();
        config.broker.host = "127.0.0.1".to_string();
        config.broker.port = port;
        config
    }

    /// Minimal MQTT 3.1.1 broker for a single client.
    ///
    /// Accepts CONNECT, acknowledges SUBSCRIBE, QoS 1 PUBLISH and PINGREQ, and
    /// forwards every packet received after CONNECT to the test. Once the
    /// client subscribes, `command` is delivered to it as a QoS 0 PUBLISH.
    struct FakeBroker {
        port: u16,
        packets: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    }

    impl FakeBroker {
        async fn start(command: Option<(String, Vec<u8>)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, packets) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                if read_packet(&mut stream).await.is_err() {
                    return;
                }
                if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                    return;
                }

                while let Ok((header, body)) = read_packet(&mut stream).await {
                    let reply = match header >> 4 {
                        3 if header & 0x06 == 0x02 => {
                            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                            vec![0x40, 0x02, body[2 + topic_len], body[3 + topic_len]]
                        }
                        8 => {
                            let mut reply = vec![0x90, 0x03, body[0], body[1], 0x01];
                            if let Some((topic, payload)) = &command {
                                reply.extend(encode_publish(topic, payload));
                            }
                            reply
                        }
                        12 => vec![0xD0, 0x00],
                        _ => Vec::new(),
                    };
                    let _ = tx.send((header, body));
                    if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });

            Self { port, packets }
        }

        /// Wait for the first SUBSCRIBE. Returns its topic filter and the
        /// number of PUBLISH packets that arrived before it.
        async fn wait_for_subscribe(&mut self) -> Option<(String, usize)> {
            let mut publishes = 0;
            let wait = async {
                while let Some((header, body)) = self.packets.recv().await {
                    match header >> 4 {
                        3 => publishes += 1,
                        8 => {
                            let len = u16::from_be_bytes([body[2], body[3]]) as usize;
                            return Some(String::from_utf8_lossy(&body[4..4 + len]).into_owned());
                        }
                        _ => {}
                    }
                }
                None
            };
            let topic = tokio::time::timeout(Duration::from_secs(5), wait)
                .await
                .ok()
                .flatten()?;
            Some((topic, publishes))
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if len == 0 {
                break;
            }
        }
        packet.extend(body);
        packet
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_subscribes_and_dispatches_commands() {
        let command_topic = SimulatorConfig::default().command_topic();
        let command = br#"{"controlId":"c1","value":1}"#.to_vec();
        let mut broker = FakeBroker::start(Some((command_topic.clone(), command.clone()))).await;

        let listener = Arc::new(RecordingListener::default());
        let mut manager = ConnectionManager::new(local_config(broker.port), listener.clone());
        manager.connect().await.unwrap();
        manager.start_background_service().await.unwrap();

        let (topic, _) = broker.wait_for_subscribe().await.expect("no SUBSCRIBE received");
        assert_eq!(topic, "iot/control/command/69039687a167f6e832c82529");

        let delivered = wait_until(|| !listener.messages.lock().unwrap().is_empty()).await;
        assert!(delivered, "command was not dispatched to the listener");
        let messages = listener.messages.lock().unwrap().clone();
        assert_eq!(messages[0], (command_topic, command));

        assert_eq!(manager.state().await, SessionState::Connected);
        assert!(matches!(
            listener.outcomes.lock().unwrap()[0],
            ConnectOutcome::Accepted { .. }
        ));

        manager.stop_background_service().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_survives_full_request_queue() {
        let mut broker = FakeBroker::start(None).await;
        let listener = Arc::new(RecordingListener::default());
        let mut manager = ConnectionManager::new(local_config(broker.port), listener);
        manager.connect().await.unwrap();

        // Readings published while the network is not serviced fill the
        // request queue, as they do during an outage.
        let mut rejected = 0;
        for _ in 0..REQUEST_CHANNEL_CAPACITY + 2 {
            let payload = br#"{"sensorId":"s","value":21.5}"#.to_vec();
            if manager
                .publish("iot/sensor/data", payload, Qos::AtLeastOnce)
                .await
                .is_err()
            {
                rejected += 1;
            }
        }
        assert!(rejected > 0, "request queue never filled up");

        manager.start_background_service().await.unwrap();

        let (topic, publishes_before) = broker
            .wait_for_subscribe()
            .await
            .expect("SUBSCRIBE never sent after connecting with a full request queue");
        assert_eq!(topic, manager.config().command_topic());
        assert!(publishes_before > 0);

        manager.stop_background_service().await.unwrap();
        manager.disconnect().await.unwrap();
    }

    #[test]
    fn test_client_id() {
        let listener = Arc::new(RecordingListener::default());
        let manager = ConnectionManager::new(SimulatorConfig::default(), listener.clone());
        assert!(manager.client_id().starts_with("device-sim-"));

        let mut config = SimulatorConfig::default();
        config.broker.client_id = Some("fixed-id".to_string());
        let manager = ConnectionManager::new(config, listener);
        assert_eq!(manager.client_id(), "fixed-id");
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let listener = Arc::new(RecordingListener::default());
        let mut manager = ConnectionManager::new(SimulatorConfig::default(), listener);

        assert_eq!(manager.state().await, SessionState::Disconnected);
        assert!(matches!(
            manager.publish("iot/sensor/data", b"{}".to_vec(), Qos::AtLeastOnce).await,
            Err(SimulatorError::NotConnected)
        ));
        assert!(matches!(
            manager.start_background_service().await,
            Err(SimulatorError::NotConnected)
        ));

        // Shutdown steps are no-ops on a session that never connected.
        manager.stop_background_service().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let listener = Arc::new(RecordingListener::default());
        let mut config = SimulatorConfig::default();
        config.sensor_id = String::new();
        let mut manager = ConnectionManager::new(config, listener);

        assert!(matches!(
            manager.connect().await,
            Err(SimulatorError::Configuration(_))
        ));
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let listener = Arc::new(RecordingListener::default());
        let mut manager = ConnectionManager::new(local_config(1), listener);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Connecting);

        // Queued while the service is not running yet.
        manager
            .publish("iot/sensor/data", b"{}".to_vec(), Qos::AtLeastOnce)
            .await
            .unwrap();

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_reported() {
        let listener = Arc::new(RecordingListener::default());
        // Nothing listens on port 1 locally; the connect attempt is refused.
        let mut manager = ConnectionManager::new(local_config(1), listener.clone());

        manager.connect().await.unwrap();
        manager.start_background_service().await.unwrap();
        manager.start_background_service().await.unwrap();
        assert!(manager.is_service_running());

        let reported = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if !listener.outcomes.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reported.is_ok(), "connection failure was not reported");

        let outcomes = listener.outcomes.lock().unwrap().clone();
        assert!(matches!(outcomes[0], ConnectOutcome::Failed(_)));

        manager.stop_background_service().await.unwrap();
        assert!(!manager.is_service_running());
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    #[ignore] // Requires network access to the public broker
    async fn test_public_broker_roundtrip() {
        let listener = Arc::new(RecordingListener::default());
        let config = SimulatorConfig::default();
        let topic = config.command_topic();
        let mut manager = ConnectionManager::new(config, listener.clone());

        manager.connect().await.unwrap();
        manager.start_background_service().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.state().await, SessionState::Connected);

        manager
            .publish(&topic, br#"{"controlId":"c1","value":1}"#.to_vec(), Qos::AtLeastOnce)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!listener.messages.lock().unwrap().is_empty());

        manager.stop_background_service().await.unwrap();
        manager.disconnect().await.unwrap();
    }
}
