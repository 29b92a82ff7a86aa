//! Wire operators: [`FramePublisher`]/[`FrameSubscriber`] (pub/sub fan-out
//! to other processes) and [`Sender`]/[`Receiver`] (batched point-to-point
//! delivery).
//!
//! Envelopes are serialized onto the wire as plain `serde`-derived structs
//! carried as JSON — the same approach this crate already uses for on-disk
//! frame dumps in `crate::frame::json::frame_to_external_json`. Recorded as
//! a resolved Open Question in `DESIGN.md`.
//!
//! Specific wire formats are an out-of-scope concern, so [`TransportBackend`]
//! is the seam, exactly like [`crate::operators::ModelBackend`] /
//! [`crate::operators::DetectorBackend`]: a deterministic in-process mock
//! ships by default, real backends (ZeroMQ, MQTT, Kafka, websocket) are
//! feature-gated and selected by `make_backend` from whichever endpoint
//! parameter is present (`zmq_endpoint`, `mqtt_host`, `kafka_brokers`,
//! `ws_url`, checked in that order).

use crate::context::Runtime;
use crate::error::{RuntimeError, SafResult};
use crate::factory::OperatorFactory;
use crate::frame::{Frame, Rect};
use crate::operator::{Operator, OperatorIo, OperatorLogic, OperatorOnStopIo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One detected region as carried on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RectInfo {
    pub bbox: Rect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<Vec<f32>>,
}

/// The on-wire envelope for one frame. `image` is JPEG-or-raw bytes straight out of the
/// frame's image field; `rect_infos` carries whatever detections/tracks/
/// features ride alongside it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub stream_id: String,
    pub frame_id: u64,
    pub capture_time_micros: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub rect_infos: Vec<RectInfo>,
}

impl FrameEnvelope {
    /// Builds an envelope from `frame`'s reserved keys plus whatever of
    /// `fields_to_send` it carries.
    pub fn from_frame(stream_id: &str, frame: &Frame, fields_to_send: &HashSet<String>) -> Self {
        let image = if fields_to_send.is_empty() || fields_to_send.contains("image") {
            frame.get::<Vec<u8>>("original_bytes").ok()
        } else {
            None
        };
        let rect_infos = if fields_to_send.is_empty() || fields_to_send.contains("bounding_boxes") {
            frame
                .get::<Vec<Rect>>("bounding_boxes")
                .map(|boxes| {
                    boxes
                        .into_iter()
                        .map(|bbox| RectInfo {
                            bbox,
                            label: None,
                            id: None,
                            feature: None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Self {
            stream_id: stream_id.to_string(),
            frame_id: frame.frame_id().unwrap_or(0),
            capture_time_micros: frame.capture_time().map(|t| t.micros_since_epoch()).unwrap_or(0),
            image,
            rect_infos,
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::new();
        frame.set_frame_id(self.frame_id);
        frame.set_capture_time(crate::time::TimePoint::new(self.capture_time_micros));
        if let Some(bytes) = self.image {
            frame.set("original_bytes", bytes);
        }
        if !self.rect_infos.is_empty() {
            let boxes: Vec<Rect> = self.rect_infos.into_iter().map(|r| r.bbox).collect();
            frame.set("bounding_boxes", boxes);
        }
        frame
    }
}

/// The out-of-scope transport seam. `topic` is the publisher/sender
/// operator's configured channel name; `send`/`try_recv` operate on whole
/// already-serialized payloads, leaving endpoint/URI dispatch to the
/// concrete backend.
pub trait TransportBackend: Send {
    fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError>;
    fn try_recv(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError>;
}

/// Process-wide topic -> queue registry, the deterministic default backend.
/// Lets `FramePublisher`/`FrameSubscriber` and `Sender`/`Receiver` be
/// exercised in tests without a real broker, the way
/// `crate::operators::neural_net::MockModelBackend` stands in for a real
/// inference engine.
fn broker() -> &'static Mutex<HashMap<String, VecDeque<Vec<u8>>>> {
    static BROKER: OnceLock<Mutex<HashMap<String, VecDeque<Vec<u8>>>>> = OnceLock::new();
    BROKER.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Default)]
pub struct InProcessTransportBackend;

impl TransportBackend for InProcessTransportBackend {
    fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError> {
        broker().lock().entry(topic.to_string()).or_default().push_back(payload);
        Ok(())
    }

    fn try_recv(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = broker().lock().get_mut(topic).and_then(|q| q.pop_front()) {
                return Ok(Some(payload));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(feature = "zmq")]
mod zmq_backend {
    use super::*;

    /// PUB/SUB transport built on the `zmq` crate (`Context::new()`,
    /// `socket(PUB|SUB)`, `bind`/`connect`, `send`/`recv_bytes`).
    pub struct ZmqBackend {
        socket: zmq::Socket,
    }

    impl ZmqBackend {
        pub fn new_pub(endpoint: &str) -> Result<Self, RuntimeError> {
            let ctx = zmq::Context::new();
            let socket = ctx.socket(zmq::PUB).map_err(|e| RuntimeError::Transport(e.to_string()))?;
            socket.bind(endpoint).map_err(|e| RuntimeError::Transport(e.to_string()))?;
            Ok(Self { socket })
        }

        pub fn new_sub(endpoint: &str) -> Result<Self, RuntimeError> {
            let ctx = zmq::Context::new();
            let socket = ctx.socket(zmq::SUB).map_err(|e| RuntimeError::Transport(e.to_string()))?;
            socket.connect(endpoint).map_err(|e| RuntimeError::Transport(e.to_string()))?;
            socket
                .set_subscribe(b"")
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            Ok(Self { socket })
        }
    }

    impl TransportBackend for ZmqBackend {
        fn send(&mut self, _topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError> {
            self.socket
                .send(payload, 0)
                .map_err(|e| RuntimeError::Transport(e.to_string()))
        }

        fn try_recv(&mut self, _topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError> {
            self.socket
                .set_rcvtimeo(timeout.as_millis() as i32)
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            match self.socket.recv_bytes(0) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(zmq::Error::EAGAIN) => Ok(None),
                Err(e) => Err(RuntimeError::Transport(e.to_string())),
            }
        }
    }
}

#[cfg(feature = "mqtt")]
mod mqtt_backend {
    use super::*;
    use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

    /// Synchronous MQTT transport via `rumqttc::Client`, fitting the
    /// plain-OS-thread `Operator` worker model (no tokio runtime needed).
    pub struct MqttBackend {
        client: Client,
        connection: rumqttc::Connection,
    }

    impl MqttBackend {
        pub fn new(client_id: &str, host: &str, port: u16) -> Self {
            let options = MqttOptions::new(client_id, host, port);
            let (client, connection) = Client::new(options, 64);
            Self { client, connection }
        }
    }

    impl TransportBackend for MqttBackend {
        fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError> {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .map_err(|e| RuntimeError::Transport(e.to_string()))
        }

        fn try_recv(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError> {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            let deadline = std::time::Instant::now() + timeout;
            while std::time::Instant::now() < deadline {
                if let Some(Ok(Event::Incoming(Packet::Publish(p)))) = self.connection.iter().next() {
                    return Ok(Some(p.payload.to_vec()));
                }
            }
            Ok(None)
        }
    }
}

#[cfg(feature = "kafka")]
mod kafka_backend {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{BaseConsumer, Consumer};
    use rdkafka::message::Message;
    use rdkafka::producer::{BaseProducer, BaseRecord, Producer};

    /// Synchronous Kafka transport via `rdkafka`'s `BaseProducer`/
    /// `BaseConsumer`, fitting the plain-OS-thread `Operator` worker model
    /// the same way [`super::mqtt_backend::MqttBackend`] does.
    pub struct KafkaBackend {
        producer: BaseProducer,
        consumer: BaseConsumer,
        subscribed_topic: Option<String>,
    }

    impl KafkaBackend {
        pub fn new(brokers: &str, group_id: &str) -> Result<Self, RuntimeError> {
            let producer: BaseProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .create()
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            let consumer: BaseConsumer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("group.id", group_id)
                .set("enable.auto.commit", "true")
                .create()
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            Ok(Self {
                producer,
                consumer,
                subscribed_topic: None,
            })
        }
    }

    impl TransportBackend for KafkaBackend {
        fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError> {
            self.producer
                .send(BaseRecord::<(), _>::to(topic).payload(&payload))
                .map_err(|(e, _)| RuntimeError::Transport(e.to_string()))?;
            self.producer.poll(Duration::from_millis(0));
            Ok(())
        }

        fn try_recv(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError> {
            if self.subscribed_topic.as_deref() != Some(topic) {
                self.consumer
                    .subscribe(&[topic])
                    .map_err(|e| RuntimeError::Transport(e.to_string()))?;
                self.subscribed_topic = Some(topic.to_string());
            }
            match self.consumer.poll(timeout) {
                Some(Ok(msg)) => Ok(msg.payload().map(|p| p.to_vec())),
                Some(Err(e)) => Err(RuntimeError::Transport(e.to_string())),
                None => Ok(None),
            }
        }
    }
}

#[cfg(feature = "websocket")]
mod websocket_backend {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::runtime::Runtime as TokioRuntime;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    /// Websocket transport over `tokio-tungstenite`, bridged onto this
    /// crate's synchronous `Operator` worker threads by a dedicated
    /// multi-thread tokio runtime owned by the backend instance; every
    /// call blocks the worker thread on that runtime rather than the
    /// other way around.
    pub struct WebsocketBackend {
        runtime: TokioRuntime,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl WebsocketBackend {
        pub fn connect(url: &str) -> Result<Self, RuntimeError> {
            let runtime = TokioRuntime::new().map_err(|e| RuntimeError::Transport(e.to_string()))?;
            let (socket, _response) = runtime
                .block_on(connect_async(url))
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            Ok(Self { runtime, socket })
        }
    }

    impl TransportBackend for WebsocketBackend {
        fn send(&mut self, _topic: &str, payload: Vec<u8>) -> Result<(), RuntimeError> {
            let socket = &mut self.socket;
            self.runtime
                .block_on(socket.send(WsMessage::Binary(payload)))
                .map_err(|e| RuntimeError::Transport(e.to_string()))
        }

        fn try_recv(&mut self, _topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, RuntimeError> {
            let socket = &mut self.socket;
            self.runtime.block_on(async {
                match tokio::time::timeout(timeout, socket.next()).await {
                    Ok(Some(Ok(WsMessage::Binary(bytes)))) => Ok(Some(bytes)),
                    Ok(Some(Ok(_))) => Ok(None),
                    Ok(Some(Err(e))) => Err(RuntimeError::Transport(e.to_string())),
                    Ok(None) => Ok(None),
                    Err(_) => Ok(None),
                }
            })
        }
    }
}

/// Publishes a subset of a frame's fields to every subscriber.
/// No sink: this operator is a terminal.
pub struct FramePublisher {
    topic: String,
    fields_to_send: HashSet<String>,
    backend: Box<dyn TransportBackend>,
}

impl FramePublisher {
    pub fn new(topic: impl Into<String>, fields_to_send: HashSet<String>, backend: Box<dyn TransportBackend>) -> Self {
        Self {
            topic: topic.into(),
            fields_to_send,
            backend,
        }
    }
}

impl OperatorLogic for FramePublisher {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let Some(frame) = io.get_frame("input") else {
            return;
        };
        if frame.is_stop_frame() {
            return;
        }
        let envelope = FrameEnvelope::from_frame(&self.topic, &frame, &self.fields_to_send);
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.backend.send(&self.topic, payload) {
                    log::error!("FramePublisher failed to send: {e}");
                }
            }
            Err(e) => log::error!("FramePublisher failed to serialize frame: {e}"),
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Receives frames published by a [`FramePublisher`] on the same topic.
/// No source: this operator is a producer, polling the transport on its
/// own timing the way [`crate::operators::Camera`] polls a camera source.
pub struct FrameSubscriber {
    topic: String,
    backend: Box<dyn TransportBackend>,
}

impl FrameSubscriber {
    pub fn new(topic: impl Into<String>, backend: Box<dyn TransportBackend>) -> Self {
        Self {
            topic: topic.into(),
            backend,
        }
    }
}

impl OperatorLogic for FrameSubscriber {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        match self.backend.try_recv(&self.topic, Duration::from_millis(15)) {
            Ok(Some(payload)) => match serde_json::from_slice::<FrameEnvelope>(&payload) {
                Ok(envelope) => io.push_frame("output", envelope.into_frame()),
                Err(e) => log::error!("FrameSubscriber failed to deserialize payload: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::error!("FrameSubscriber transport error: {e}"),
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// What shape a [`Sender`]/[`Receiver`] pair serializes, mirroring the
/// original's `package_type` parameter ("thumbnails" vs "frame").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageType {
    Frame,
    Thumbnails,
}

impl PackageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frame" => Some(Self::Frame),
            "thumbnails" => Some(Self::Thumbnails),
            _ => None,
        }
    }
}

/// Batches `batch_size` sources (`input0`..`input{batch_size-1}`) into one
/// wire send per tick. No sinks.
pub struct Sender {
    topic: String,
    batch_size: usize,
    package_type: PackageType,
    backend: Box<dyn TransportBackend>,
}

impl Sender {
    pub fn new(
        topic: impl Into<String>,
        batch_size: usize,
        package_type: PackageType,
        backend: Box<dyn TransportBackend>,
    ) -> Self {
        Self {
            topic: topic.into(),
            batch_size,
            package_type,
            backend,
        }
    }

    pub fn source_name(index: usize) -> String {
        format!("input{index}")
    }
}

impl OperatorLogic for Sender {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        let fields_to_send: HashSet<String> = match self.package_type {
            PackageType::Thumbnails => ["image".to_string()].into_iter().collect(),
            PackageType::Frame => HashSet::new(),
        };
        for i in 0..self.batch_size {
            let source = Self::source_name(i);
            let Some(frame) = io.get_frame(&source) else {
                continue;
            };
            if frame.is_stop_frame() {
                continue;
            }
            let envelope = FrameEnvelope::from_frame(&self.topic, &frame, &fields_to_send);
            match serde_json::to_vec(&envelope) {
                Ok(payload) => {
                    if let Err(e) = self.backend.send(&self.topic, payload) {
                        log::error!("Sender failed to send batch item {i}: {e}");
                    }
                }
                Err(e) => log::error!("Sender failed to serialize batch item {i}: {e}"),
            }
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Receives frames sent by a [`Sender`] on the same topic, one per tick,
/// and forwards them on `output`. No sources.
pub struct Receiver {
    topic: String,
    backend: Box<dyn TransportBackend>,
}

impl Receiver {
    pub fn new(topic: impl Into<String>, backend: Box<dyn TransportBackend>) -> Self {
        Self {
            topic: topic.into(),
            backend,
        }
    }
}

impl OperatorLogic for Receiver {
    fn init(&mut self) -> bool {
        true
    }

    fn process(&mut self, io: &mut OperatorIo<'_>) {
        match self.backend.try_recv(&self.topic, Duration::from_millis(15)) {
            Ok(Some(payload)) => match serde_json::from_slice::<FrameEnvelope>(&payload) {
                Ok(envelope) => io.push_frame("output", envelope.into_frame()),
                Err(e) => log::error!("Receiver failed to deserialize payload: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::error!("Receiver transport error: {e}"),
        }
    }

    fn on_stop(&mut self, _io: &mut OperatorOnStopIo<'_>) -> bool {
        true
    }
}

/// Selects a real transport from whichever endpoint parameter is present,
/// checked in this order: `zmq_endpoint`, `mqtt_host`, `kafka_brokers`,
/// `ws_url`. Falls back to the deterministic in-process broker if none is
/// set, or if the matching feature wasn't compiled in, or if connecting
/// fails.
fn make_backend(_params: &HashMap<String, String>) -> Box<dyn TransportBackend> {
    #[cfg(feature = "zmq")]
    if let Some(endpoint) = _params.get("zmq_endpoint") {
        if _params.get("role").map(String::as_str) == Some("sub") {
            if let Ok(b) = zmq_backend::ZmqBackend::new_sub(endpoint) {
                return Box::new(b);
            }
        } else if let Ok(b) = zmq_backend::ZmqBackend::new_pub(endpoint) {
            return Box::new(b);
        }
    }
    #[cfg(feature = "mqtt")]
    if let Some(host) = _params.get("mqtt_host") {
        let port: u16 = _params.get("mqtt_port").and_then(|v| v.parse().ok()).unwrap_or(1883);
        let client_id = _params
            .get("mqtt_client_id")
            .cloned()
            .unwrap_or_else(|| format!("camflow-{}", std::process::id()));
        return Box::new(mqtt_backend::MqttBackend::new(&client_id, host, port));
    }
    #[cfg(feature = "kafka")]
    if let Some(brokers) = _params.get("kafka_brokers") {
        let group_id = _params.get("kafka_group_id").cloned().unwrap_or_else(|| "camflow".to_string());
        if let Ok(b) = kafka_backend::KafkaBackend::new(brokers, &group_id) {
            return Box::new(b);
        }
    }
    #[cfg(feature = "websocket")]
    if let Some(url) = _params.get("ws_url") {
        if let Ok(b) = websocket_backend::WebsocketBackend::connect(url) {
            return Box::new(b);
        }
    }
    Box::new(InProcessTransportBackend)
}

pub(crate) fn register(factory: &mut OperatorFactory) {
    factory.register(
        "FramePublisher",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let topic = params.get("topic").cloned().unwrap_or_else(|| name.to_string());
            let fields_to_send: HashSet<String> = params
                .get("fields_to_send")
                .map(|s| s.split(',').map(|f| f.trim().to_string()).collect())
                .unwrap_or_default();
            let backend = make_backend(params);
            Ok(Operator::new(
                name,
                "FramePublisher",
                &["input"],
                &[],
                Box::new(FramePublisher::new(topic, fields_to_send, backend)),
            ))
        }),
    );
    factory.register(
        "FrameSubscriber",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let mut sub_params = params.clone();
            sub_params.insert("role".to_string(), "sub".to_string());
            let topic = params.get("topic").cloned().unwrap_or_else(|| name.to_string());
            let backend = make_backend(&sub_params);
            Ok(Operator::new(
                name,
                "FrameSubscriber",
                &[],
                &["output"],
                Box::new(FrameSubscriber::new(topic, backend)),
            ))
        }),
    );
    factory.register(
        "Sender",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let topic = params.get("topic").cloned().unwrap_or_else(|| name.to_string());
            let batch_size: usize = params.get("batch_size").and_then(|v| v.parse().ok()).unwrap_or(1);
            let package_type = params
                .get("package_type")
                .and_then(|v| PackageType::parse(v))
                .unwrap_or(PackageType::Frame);
            let backend = make_backend(params);
            let source_names: Vec<String> = (0..batch_size).map(Sender::source_name).collect();
            let source_refs: Vec<&str> = source_names.iter().map(String::as_str).collect();
            Ok(Operator::new(
                name,
                "Sender",
                &source_refs,
                &[],
                Box::new(Sender::new(topic, batch_size, package_type, backend)),
            ))
        }),
    );
    factory.register(
        "Receiver",
        Box::new(|name, params, _runtime: &Runtime| -> SafResult<Arc<Operator>> {
            let mut sub_params = params.clone();
            sub_params.insert("role".to_string(), "sub".to_string());
            let topic = params.get("topic").cloned().unwrap_or_else(|| name.to_string());
            let backend = make_backend(&sub_params);
            Ok(Operator::new(
                name,
                "Receiver",
                &[],
                &["output"],
                Box::new(Receiver::new(topic, backend)),
            ))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use std::time::Duration;

    #[test]
    fn publisher_then_subscriber_round_trip_via_in_process_broker() {
        let topic = "publisher_then_subscriber_round_trip_via_in_process_broker";
        let mut publisher = FramePublisher::new(topic, HashSet::new(), Box::new(InProcessTransportBackend));
        let mut f = Frame::new();
        f.set_frame_id(5);
        f.set("original_bytes", vec![1u8, 2, 3]);
        let sinks = HashMap::new();
        let mut cache = HashMap::new();
        cache.insert("input".to_string(), f);
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, &sinks, false, &mut pushed_stop);
        publisher.process(&mut io);

        let mut subscriber = FrameSubscriber::new(topic, Box::new(InProcessTransportBackend));
        let output = Stream::new("output");
        let reader = output.subscribe(None);
        let mut sub_sinks = HashMap::new();
        sub_sinks.insert("output".to_string(), output);
        let mut empty_cache = HashMap::new();
        let mut sub_pushed_stop = false;
        let mut sub_io = OperatorIo::for_test(&mut empty_cache, &sub_sinks, false, &mut sub_pushed_stop);
        subscriber.process(&mut sub_io);

        let received = reader.pop(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(received.frame_id(), Some(5));
        assert_eq!(received.get::<Vec<u8>>("original_bytes").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn sender_batches_multiple_inputs_in_one_tick() {
        let topic = "sender_batches_multiple_inputs_in_one_tick";
        let mut sender = Sender::new(topic, 2, PackageType::Frame, Box::new(InProcessTransportBackend));
        let mut f0 = Frame::new();
        f0.set_frame_id(1);
        let mut f1 = Frame::new();
        f1.set_frame_id(2);
        let sinks = HashMap::new();
        let mut cache = HashMap::new();
        cache.insert(Sender::source_name(0), f0);
        cache.insert(Sender::source_name(1), f1);
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, &sinks, false, &mut pushed_stop);
        sender.process(&mut io);

        let mut receiver = Receiver::new(topic, Box::new(InProcessTransportBackend));
        let output = Stream::new("output");
        let reader = output.subscribe(None);
        let mut recv_sinks = HashMap::new();
        recv_sinks.insert("output".to_string(), output);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut empty_cache = HashMap::new();
            let mut recv_pushed_stop = false;
            let mut recv_io = OperatorIo::for_test(&mut empty_cache, &recv_sinks, false, &mut recv_pushed_stop);
            receiver.process(&mut recv_io);
            seen.push(reader.pop(Some(Duration::from_millis(50))).unwrap().frame_id());
        }
        seen.sort();
        assert_eq!(seen, vec![Some(1), Some(2)]);
    }

    #[test]
    fn subscriber_times_out_with_nothing_published() {
        let topic = "subscriber_times_out_with_nothing_published";
        let mut subscriber = FrameSubscriber::new(topic, Box::new(InProcessTransportBackend));
        let output = Stream::new("output");
        let reader = output.subscribe(None);
        let mut sinks = HashMap::new();
        sinks.insert("output".to_string(), output);
        let mut cache = HashMap::new();
        let mut pushed_stop = false;
        let mut io = OperatorIo::for_test(&mut cache, &sinks, false, &mut pushed_stop);
        subscriber.process(&mut io);
        assert!(reader.pop(Some(Duration::from_millis(5))).is_none());
    }
}
