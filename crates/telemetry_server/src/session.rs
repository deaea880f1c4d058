use std::sync::Arc;

use common::HeartRateSample;

use crate::protocol::{ClientMessage, ServerMessage, RPC_VERSION, SET_INPUT_SETTINGS};

/// Result of a heart-rate field update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Accepted(HeartRateSample),
    /// Text that did not parse as a bpm value. Carries the raw text for logging.
    Ignored(String),
}

/// What the session wants done after one inbound message.
#[derive(Debug, Default, PartialEq)]
pub struct Handled {
    pub replies: Vec<ServerMessage>,
    pub update: Option<FieldUpdate>,
}

/// Per-connection protocol state. Lives as long as the socket.
#[derive(Debug)]
pub struct ProtocolSession {
    field: Arc<str>,
    negotiated: Option<u32>,
}

impl ProtocolSession {
    pub fn new(field: Arc<str>) -> Self {
        Self { field, negotiated: None }
    }

    pub fn greeting(&self) -> ServerMessage {
        ServerMessage::Hello
    }

    pub fn is_identified(&self) -> bool {
        self.negotiated.is_some()
    }

    pub fn handle(&mut self, message: ClientMessage) -> Handled {
        match message {
            ClientMessage::Identify(data) => {
                let version = data.rpc_version.map_or(RPC_VERSION, |v| v.min(RPC_VERSION));
                self.negotiated = Some(version);
                Handled {
                    replies: vec![ServerMessage::Identified { negotiated_rpc_version: version }],
                    update: None,
                }
            }
            ClientMessage::Reidentify => {
                let version = *self.negotiated.get_or_insert(RPC_VERSION);
                Handled {
                    replies: vec![ServerMessage::Identified { negotiated_rpc_version: version }],
                    update: None,
                }
            }
            ClientMessage::Request(request) => {
                // Requests for other inputs or request types still succeed.
                let update = if request.request_type == SET_INPUT_SETTINGS {
                    match request.input_text() {
                        Some((name, text)) if name == &*self.field => Some(
                            match text.and_then(parse_heart_rate) {
                                Some(bpm) => FieldUpdate::Accepted(bpm),
                                None => FieldUpdate::Ignored(text.unwrap_or_default().to_string()),
                            },
                        ),
                        _ => None,
                    }
                } else {
                    None
                };

                let replies = request
                    .echo_id()
                    .map(|id| ServerMessage::RequestResponse {
                        request_type: request.request_type.clone(),
                        request_id: id.clone(),
                    })
                    .into_iter()
                    .collect();

                Handled { replies, update }
            }
            ClientMessage::Unsupported(_) => Handled::default(),
        }
    }
}

/// Base-10 bpm from a text payload. Surrounding whitespace is allowed,
/// anything else (signs, units, decimals) is not.
pub fn parse_heart_rate(text: &str) -> Option<HeartRateSample> {
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IdentifyData;
    use serde_json::json;

    fn session() -> ProtocolSession {
        ProtocolSession::new(Arc::from("heartrate"))
    }

    fn request(value: serde_json::Value) -> ClientMessage {
        ClientMessage::parse(&json!({ "op": 6, "d": value }).to_string()).unwrap()
    }

    #[test]
    fn identify_yields_exactly_one_identified() {
        let mut s = session();
        let handled = s.handle(ClientMessage::Identify(IdentifyData {
            rpc_version: Some(1),
            event_subscriptions: None,
        }));
        assert_eq!(handled.replies, vec![ServerMessage::Identified { negotiated_rpc_version: 1 }]);
        assert!(s.is_identified());
    }

    #[test]
    fn newer_client_version_is_negotiated_down() {
        let mut s = session();
        let handled = s.handle(ClientMessage::Identify(IdentifyData {
            rpc_version: Some(4),
            event_subscriptions: None,
        }));
        assert_eq!(handled.replies, vec![ServerMessage::Identified { negotiated_rpc_version: 1 }]);
    }

    #[test]
    fn heart_rate_update_is_accepted_and_acknowledged() {
        let mut s = session();
        let handled = s.handle(request(json!({
            "requestType": "SetInputSettings",
            "requestId": "42",
            "requestData": { "inputName": "heartrate", "inputSettings": { "text": "97" } }
        })));

        assert_eq!(handled.update, Some(FieldUpdate::Accepted(97)));
        assert_eq!(
            handled.replies,
            vec![ServerMessage::RequestResponse {
                request_type: "SetInputSettings".into(),
                request_id: json!("42"),
            }]
        );
    }

    #[test]
    fn data_before_identify_is_tolerated() {
        let mut s = session();
        let handled = s.handle(request(json!({
            "requestType": "SetInputSettings",
            "requestData": { "inputName": "heartrate", "inputSettings": { "text": "70" } }
        })));
        assert!(!s.is_identified());
        assert_eq!(handled.update, Some(FieldUpdate::Accepted(70)));
        assert!(handled.replies.is_empty());
    }

    #[test]
    fn non_numeric_text_is_ignored_but_still_succeeds() {
        let mut s = session();
        let handled = s.handle(request(json!({
            "requestType": "SetInputSettings",
            "requestId": "x",
            "requestData": { "inputName": "heartrate", "inputSettings": { "text": "--" } }
        })));
        assert_eq!(handled.update, Some(FieldUpdate::Ignored("--".into())));
        assert_eq!(handled.replies.len(), 1);
    }

    #[test]
    fn other_inputs_are_acknowledged_without_update() {
        let mut s = session();
        let handled = s.handle(request(json!({
            "requestType": "SetInputSettings",
            "requestId": 5,
            "requestData": { "inputName": "spo2", "inputSettings": { "text": "98" } }
        })));
        assert_eq!(handled.update, None);
        assert_eq!(handled.replies.len(), 1);
    }

    #[test]
    fn request_missing_its_type_is_still_answered() {
        let mut s = session();
        let handled = s.handle(request(json!({ "requestId": "orphan" })));
        assert_eq!(handled.update, None);
        assert_eq!(
            handled.replies,
            vec![ServerMessage::RequestResponse { request_type: String::new(), request_id: json!("orphan") }]
        );
    }

    #[test]
    fn parse_heart_rate_rules() {
        assert_eq!(parse_heart_rate("120"), Some(120));
        assert_eq!(parse_heart_rate(" 64\n"), Some(64));
        assert_eq!(parse_heart_rate("0"), Some(0));
        assert_eq!(parse_heart_rate(""), None);
        assert_eq!(parse_heart_rate("-5"), None);
        assert_eq!(parse_heart_rate("+5"), None);
        assert_eq!(parse_heart_rate("72.5"), None);
        assert_eq!(parse_heart_rate("72 bpm"), None);
        assert_eq!(parse_heart_rate("99999999999"), None);
    }
}
