//! Client for the device-control service (Intiface / Buttplug JSON protocol).
//!
//! Frames are JSON arrays of single-key objects, e.g.
//! `[{"StartScanning":{"Id":2}}]`. Every client message carries an `Id` and is
//! answered with `Ok`, `Error` or a typed reply carrying the same `Id`; device
//! events arrive unsolicited with `Id` 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use common::ActuatorError;

use crate::client::ActuatorClient;

const MESSAGE_VERSION: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

#[derive(Debug, Serialize)]
#[serde(rename_all_fields = "PascalCase")]
enum ClientMessage {
    RequestServerInfo { id: u32, client_name: String, message_version: u32 },
    RequestDeviceList { id: u32 },
    StartScanning { id: u32 },
    StopScanning { id: u32 },
    ScalarCmd { id: u32, device_index: u32, scalars: Vec<ScalarSubcommand> },
    StopDeviceCmd { id: u32, device_index: u32 },
    Ping { id: u32 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ScalarSubcommand {
    index: u32,
    scalar: f64,
    actuator_type: String,
}

#[derive(Debug, Deserialize)]
enum ServerMessage {
    Ok(IdBody),
    Error(ErrorBody),
    ServerInfo(ServerInfoBody),
    DeviceList(DeviceListBody),
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceRemovedBody),
    ScanningFinished(IdBody),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdBody {
    id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    id: u32,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    error_code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServerInfoBody {
    id: u32,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    max_ping_time: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceListBody {
    id: u32,
    #[serde(default)]
    devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceInfo {
    device_index: u32,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    device_messages: DeviceMessages,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DeviceMessages {
    #[serde(rename = "ScalarCmd", default)]
    scalar_cmd: Vec<ScalarFeature>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScalarFeature {
    actuator_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRemovedBody {
    device_index: u32,
}

impl DeviceInfo {
    /// Full-strength subcommands for every vibrator, or every scalar
    /// actuator when the device has no vibrators.
    fn engage_scalars(&self) -> Vec<ScalarSubcommand> {
        let features = &self.device_messages.scalar_cmd;
        let has_vibrator = features.iter().any(|f| f.actuator_type == "Vibrate");
        features
            .iter()
            .enumerate()
            .filter(|(_, f)| !has_vibrator || f.actuator_type == "Vibrate")
            .map(|(index, f)| ScalarSubcommand {
                index: index as u32,
                scalar: 1.0,
                actuator_type: f.actuator_type.clone(),
            })
            .collect()
    }
}

#[derive(Debug)]
enum Reply {
    Ok,
    Error { code: i64, message: String },
    ServerInfo { server_name: String, max_ping_time: u64 },
    DeviceList(Vec<DeviceInfo>),
}

/// State shared with the reader task. Never held across an await.
#[derive(Debug, Default)]
struct Shared {
    open: bool,
    device: Option<DeviceInfo>,
    pending: HashMap<u32, oneshot::Sender<Reply>>,
    discovery: Option<oneshot::Sender<()>>,
}

impl Shared {
    fn complete(&mut self, id: u32, reply: Reply) {
        match self.pending.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(id, "reply without a waiting request"),
        }
    }

    /// First discovered device wins; later ones are ignored while it stays attached.
    fn offer_device(&mut self, device: DeviceInfo) {
        if let Some(current) = &self.device {
            debug!(
                attached = %current.device_name,
                ignored = %device.device_name,
                "device already attached"
            );
            return;
        }
        info!(name = %device.device_name, index = device.device_index, "device attached");
        self.device = Some(device);
        if let Some(waiter) = self.discovery.take() {
            let _ = waiter.send(());
        }
    }

    fn reset(&mut self) {
        self.open = false;
        self.device = None;
        self.pending.clear();
        self.discovery = None;
    }
}

struct Connection {
    sink: WsSink,
    reader: JoinHandle<()>,
    pinger: Option<JoinHandle<()>>,
}

pub struct IntifaceClient {
    client_name: String,
    next_id: Arc<AtomicU32>,
    shared: Arc<Mutex<Shared>>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    open: Arc<watch::Sender<bool>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode(message: &ClientMessage) -> Result<String, ActuatorError> {
    serde_json::to_string(&[message]).map_err(|e| ActuatorError::Protocol(e.to_string()))
}

impl IntifaceClient {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            next_id: Arc::new(AtomicU32::new(1)),
            shared: Arc::new(Mutex::new(Shared::default())),
            connection: tokio::sync::Mutex::new(None),
            open: Arc::new(watch::Sender::new(false)),
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(
        &self,
        sink: &WsSink,
        build: impl FnOnce(u32) -> ClientMessage,
    ) -> Result<Reply, ActuatorError> {
        let id = self.next_id();
        let frame = encode(&build(id))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if !shared.open {
                return Err(ActuatorError::Closed);
            }
            shared.pending.insert(id, tx);
        }

        if let Err(e) = sink.lock().await.send(Message::Text(frame)).await {
            lock(&self.shared).pending.remove(&id);
            return Err(ActuatorError::Transport(e.to_string()));
        }

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(Reply::Error { code, message })) => Err(ActuatorError::Rejected { code, message }),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ActuatorError::Closed),
            Err(_) => {
                lock(&self.shared).pending.remove(&id);
                Err(ActuatorError::Transport(format!("no reply to message {id} within {REPLY_TIMEOUT:?}")))
            }
        }
    }

    async fn expect_ok(
        &self,
        sink: &WsSink,
        build: impl FnOnce(u32) -> ClientMessage,
    ) -> Result<(), ActuatorError> {
        match self.request(sink, build).await? {
            Reply::Ok => Ok(()),
            other => Err(ActuatorError::Protocol(format!("expected Ok, got {other:?}"))),
        }
    }

    async fn handshake(&self, sink: &WsSink, discovery: Duration) -> Result<(), ActuatorError> {
        let client_name = self.client_name.clone();
        let reply = self
            .request(sink, |id| ClientMessage::RequestServerInfo {
                id,
                client_name,
                message_version: MESSAGE_VERSION,
            })
            .await?;
        let Reply::ServerInfo { server_name, max_ping_time } = reply else {
            return Err(ActuatorError::Protocol(format!("expected ServerInfo, got {reply:?}")));
        };
        info!(server = %server_name, max_ping_time, "connected to actuator service");

        if max_ping_time > 0 {
            let pinger = spawn_pinger(sink.clone(), self.next_id.clone(), Duration::from_millis(max_ping_time / 2));
            if let Some(connection) = self.connection.lock().await.as_mut() {
                connection.pinger = Some(pinger);
            }
        }

        let reply = self.request(sink, |id| ClientMessage::RequestDeviceList { id }).await?;
        let Reply::DeviceList(devices) = reply else {
            return Err(ActuatorError::Protocol(format!("expected DeviceList, got {reply:?}")));
        };
        if let Some(first) = devices.into_iter().next() {
            lock(&self.shared).offer_device(first);
        }

        self.discover(sink, discovery).await
    }

    async fn discover(&self, sink: &WsSink, window: Duration) -> Result<(), ActuatorError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if shared.device.is_some() {
                return Ok(());
            }
            shared.discovery = Some(tx);
        }

        if let Err(e) = self.expect_ok(sink, |id| ClientMessage::StartScanning { id }).await {
            lock(&self.shared).discovery = None;
            return Err(e);
        }
        info!(?window, "scanning for devices");

        let outcome = tokio::time::timeout(window, rx).await;
        lock(&self.shared).discovery = None;
        if let Err(e) = self.expect_ok(sink, |id| ClientMessage::StopScanning { id }).await {
            debug!(error = %e, "failed to stop scanning");
        }

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ActuatorError::Closed),
            Err(_) => Err(ActuatorError::DiscoveryTimeout(window)),
        }
    }

    async fn attached(&self) -> Result<(WsSink, DeviceInfo), ActuatorError> {
        let sink = self
            .connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.sink.clone())
            .ok_or(ActuatorError::NotReady)?;
        let shared = lock(&self.shared);
        if !shared.open {
            return Err(ActuatorError::Closed);
        }
        let device = shared.device.clone().ok_or(ActuatorError::NoDevice)?;
        Ok((sink, device))
    }
}

#[async_trait]
impl ActuatorClient for IntifaceClient {
    async fn connect(&self, url: &str, discovery: Duration) -> Result<(), ActuatorError> {
        self.disconnect().await;

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| ActuatorError::Transport(format!("timed out connecting to {url}")))?
            .map_err(|e| ActuatorError::Transport(e.to_string()))?;
        let (sink, source) = ws.split();
        let sink: WsSink = Arc::new(tokio::sync::Mutex::new(sink));

        {
            let mut shared = lock(&self.shared);
            shared.reset();
            shared.open = true;
        }
        self.open.send_replace(true);
        let reader = tokio::spawn(read_loop(source, self.shared.clone(), self.open.clone()));
        *self.connection.lock().await = Some(Connection { sink: sink.clone(), reader, pinger: None });

        let result = self.handshake(&sink, discovery).await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    async fn engage(&self) -> Result<(), ActuatorError> {
        let (sink, device) = self.attached().await?;
        let scalars = device.engage_scalars();
        if scalars.is_empty() {
            return Err(ActuatorError::Protocol(format!(
                "device {} has no scalar actuators",
                device.device_name
            )));
        }
        self.expect_ok(&sink, |id| ClientMessage::ScalarCmd {
            id,
            device_index: device.device_index,
            scalars,
        })
        .await
    }

    async fn disengage(&self) -> Result<(), ActuatorError> {
        let (sink, device) = self.attached().await?;
        self.expect_ok(&sink, |id| ClientMessage::StopDeviceCmd { id, device_index: device.device_index })
            .await
    }

    fn is_ready(&self) -> bool {
        let shared = lock(&self.shared);
        shared.open && shared.device.is_some()
    }

    async fn closed(&self) {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| !*open).await;
    }

    async fn disconnect(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        if let Some(pinger) = connection.pinger {
            pinger.abort();
        }
        if let Err(e) = connection.sink.lock().await.close().await {
            debug!(error = %e, "error closing actuator service socket");
        }
        connection.reader.abort();
        lock(&self.shared).reset();
        self.open.send_replace(false);
        info!("disconnected from actuator service");
    }
}

async fn read_loop(mut source: SplitStream<WsStream>, shared: Arc<Mutex<Shared>>, open: Arc<watch::Sender<bool>>) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&shared, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "actuator service connection failed");
                break;
            }
        }
    }
    lock(&shared).reset();
    open.send_replace(false);
    info!("actuator service connection closed");
}

fn dispatch(shared: &Mutex<Shared>, text: &str) {
    let messages: Vec<Value> = match serde_json::from_str(text) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "dropping malformed actuator service frame");
            return;
        }
    };

    let mut shared = lock(shared);
    for value in messages {
        let message = match serde_json::from_value::<ServerMessage>(value) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognised actuator service message");
                continue;
            }
        };
        match message {
            ServerMessage::Ok(body) => shared.complete(body.id, Reply::Ok),
            ServerMessage::Error(body) if body.id == 0 => {
                warn!(code = body.error_code, message = %body.error_message, "actuator service error");
            }
            ServerMessage::Error(body) => shared.complete(
                body.id,
                Reply::Error { code: body.error_code, message: body.error_message },
            ),
            ServerMessage::ServerInfo(body) => shared.complete(
                body.id,
                Reply::ServerInfo { server_name: body.server_name, max_ping_time: body.max_ping_time },
            ),
            ServerMessage::DeviceList(body) => shared.complete(body.id, Reply::DeviceList(body.devices)),
            ServerMessage::DeviceAdded(device) => shared.offer_device(device),
            ServerMessage::DeviceRemoved(body) => {
                if shared.device.as_ref().map(|d| d.device_index) == Some(body.device_index) {
                    warn!(index = body.device_index, "attached device removed");
                    shared.device = None;
                }
            }
            ServerMessage::ScanningFinished(_) => debug!("scanning finished"),
        }
    }
}

fn spawn_pinger(sink: WsSink, next_id: Arc<AtomicU32>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let frame = match encode(&ClientMessage::Ping { id }) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode ping");
                    return;
                }
            };
            if sink.lock().await.send(Message::Text(frame)).await.is_err() {
                debug!("ping failed; stopping keepalive");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_pascal_case_fields() {
        let frame = encode(&ClientMessage::RequestServerInfo {
            id: 1,
            client_name: "bridge".into(),
            message_version: MESSAGE_VERSION,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!([{ "RequestServerInfo": { "Id": 1, "ClientName": "bridge", "MessageVersion": 3 } }])
        );
    }

    #[test]
    fn scalar_command_shape() {
        let frame = encode(&ClientMessage::ScalarCmd {
            id: 4,
            device_index: 2,
            scalars: vec![ScalarSubcommand { index: 0, scalar: 1.0, actuator_type: "Vibrate".into() }],
        })
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!([{ "ScalarCmd": {
                "Id": 4,
                "DeviceIndex": 2,
                "Scalars": [{ "Index": 0, "Scalar": 1.0, "ActuatorType": "Vibrate" }]
            } }])
        );
    }

    #[test]
    fn engage_targets_vibrators_only() {
        let device: DeviceInfo = serde_json::from_value(json!({
            "DeviceIndex": 0,
            "DeviceName": "Test Toy",
            "DeviceMessages": {
                "ScalarCmd": [
                    { "ActuatorType": "Oscillate", "StepCount": 10 },
                    { "ActuatorType": "Vibrate", "StepCount": 20 }
                ],
                "StopDeviceCmd": {}
            }
        }))
        .unwrap();
        let scalars = device.engage_scalars();
        assert_eq!(scalars.len(), 1);
        assert_eq!(scalars[0].index, 1);
    }

    #[test]
    fn first_device_wins() {
        let mut shared = Shared { open: true, ..Shared::default() };
        let first: DeviceInfo =
            serde_json::from_value(json!({ "DeviceIndex": 3, "DeviceName": "first" })).unwrap();
        let second: DeviceInfo =
            serde_json::from_value(json!({ "DeviceIndex": 4, "DeviceName": "second" })).unwrap();
        shared.offer_device(first);
        shared.offer_device(second);
        assert_eq!(shared.device.map(|d| d.device_index), Some(3));
    }

    #[test]
    fn dispatch_routes_replies_and_events() {
        let shared = Mutex::new(Shared { open: true, ..Shared::default() });
        let (tx, mut rx) = oneshot::channel();
        lock(&shared).pending.insert(7, tx);

        dispatch(
            &shared,
            r#"[{"Ok":{"Id":7}},{"DeviceAdded":{"Id":0,"DeviceIndex":1,"DeviceName":"toy"}},{"Mystery":{}}]"#,
        );

        assert!(matches!(rx.try_recv(), Ok(Reply::Ok)));
        assert_eq!(lock(&shared).device.as_ref().map(|d| d.device_index), Some(1));

        dispatch(&shared, r#"[{"DeviceRemoved":{"Id":0,"DeviceIndex":1}}]"#);
        assert!(lock(&shared).device.is_none());
    }
}
