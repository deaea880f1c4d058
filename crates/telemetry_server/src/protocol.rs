//! Wire types for the telemetry protocol.
//!
//! Every frame is a JSON object `{ "op": <u8>, "d": { ... } }`. Only the
//! opcodes needed to receive text-source updates are modelled.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const OBS_WEBSOCKET_VERSION: &str = "5.1.0";
pub const RPC_VERSION: u32 = 1;

/// Request type used by producers to push a new text value into an input.
pub const SET_INPUT_SETTINGS: &str = "SetInputSettings";

/// `requestStatus.code` for a successful request.
pub const STATUS_SUCCESS: u16 = 100;

pub mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const REIDENTIFY: u8 = 3;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyData {
    #[serde(default)]
    pub rpc_version: Option<u32>,
    #[serde(default)]
    pub event_subscriptions: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default, deserialize_with = "lenient_string")]
    pub request_type: String,
    #[serde(default)]
    pub request_id: Option<Value>,
    #[serde(default)]
    pub request_data: Option<Value>,
}

/// Missing or non-string request types read as empty so the id is still echoed.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

impl RequestData {
    /// `(inputName, inputSettings.text)` when the payload has that shape.
    pub fn input_text(&self) -> Option<(&str, Option<&str>)> {
        let data = self.request_data.as_ref()?;
        let name = data.get("inputName")?.as_str()?;
        let text = data
            .get("inputSettings")
            .and_then(|settings| settings.get("text"))
            .and_then(Value::as_str);
        Some((name, text))
    }

    /// The id to echo back, treating an explicit `null` as absent.
    pub fn echo_id(&self) -> Option<&Value> {
        self.request_id.as_ref().filter(|id| !id.is_null())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Identify(IdentifyData),
    Reidentify,
    Request(RequestData),
    Unsupported(u8),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let frame: RawFrame = serde_json::from_str(text)?;
        let message = match frame.op {
            op::IDENTIFY => {
                let data = if frame.d.is_null() {
                    IdentifyData::default()
                } else {
                    serde_json::from_value(frame.d)?
                };
                ClientMessage::Identify(data)
            }
            op::REIDENTIFY => ClientMessage::Reidentify,
            op::REQUEST => ClientMessage::Request(serde_json::from_value(frame.d)?),
            other => ClientMessage::Unsupported(other),
        };
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Hello,
    Identified { negotiated_rpc_version: u32 },
    RequestResponse { request_type: String, request_id: Value },
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelloData {
    obs_web_socket_version: &'static str,
    rpc_version: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentifiedData {
    negotiated_rpc_version: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponseData<'a> {
    request_type: &'a str,
    request_id: &'a Value,
    request_status: RequestStatus,
}

#[derive(Serialize)]
struct RequestStatus {
    result: bool,
    code: u16,
}

impl ServerMessage {
    pub fn op(&self) -> u8 {
        match self {
            ServerMessage::Hello => op::HELLO,
            ServerMessage::Identified { .. } => op::IDENTIFIED,
            ServerMessage::RequestResponse { .. } => op::REQUEST_RESPONSE,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let op = self.op();
        match self {
            ServerMessage::Hello => serde_json::to_string(&Frame {
                op,
                d: &HelloData {
                    obs_web_socket_version: OBS_WEBSOCKET_VERSION,
                    rpc_version: RPC_VERSION,
                },
            }),
            ServerMessage::Identified { negotiated_rpc_version } => serde_json::to_string(&Frame {
                op,
                d: &IdentifiedData { negotiated_rpc_version: *negotiated_rpc_version },
            }),
            ServerMessage::RequestResponse { request_type, request_id } => {
                serde_json::to_string(&Frame {
                    op,
                    d: &RequestResponseData {
                        request_type,
                        request_id,
                        request_status: RequestStatus { result: true, code: STATUS_SUCCESS },
                    },
                })
            }
        }
    }
}
