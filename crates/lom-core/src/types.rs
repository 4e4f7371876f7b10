//! Wire data model shared by the engine and its clients.
//!
//! Field names are camelCase on the wire. Numeric request kinds and result
//! codes are part of the interoperability contract and must not be reordered.

use serde::{Deserialize, Serialize};

/// Result code of a successful request.
pub const RESULT_SUCCESS: i32 = 0;

/// Request kind, encoded as an integer on the wire.
///
/// Values outside `1..=7` decode to [`RequestKind::Unknown`] so the dispatcher
/// can answer them with `UnknownReqType` instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RequestKind {
    RegisterClient,
    DeregisterClient,
    RegisterAction,
    DeregisterAction,
    RecvServerRequest,
    SendServerResponse,
    NotifyActionHeartbeat,
    Unknown(i32),
}

impl From<i32> for RequestKind {
    fn from(value: i32) -> Self {
        match value {
            1 => RequestKind::RegisterClient,
            2 => RequestKind::DeregisterClient,
            3 => RequestKind::RegisterAction,
            4 => RequestKind::DeregisterAction,
            5 => RequestKind::RecvServerRequest,
            6 => RequestKind::SendServerResponse,
            7 => RequestKind::NotifyActionHeartbeat,
            other => RequestKind::Unknown(other),
        }
    }
}

impl From<RequestKind> for i32 {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::RegisterClient => 1,
            RequestKind::DeregisterClient => 2,
            RequestKind::RegisterAction => 3,
            RequestKind::DeregisterAction => 4,
            RequestKind::RecvServerRequest => 5,
            RequestKind::SendServerResponse => 6,
            RequestKind::NotifyActionHeartbeat => 7,
            RequestKind::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::RegisterClient => write!(f, "RegisterClient"),
            RequestKind::DeregisterClient => write!(f, "DeregisterClient"),
            RequestKind::RegisterAction => write!(f, "RegisterAction"),
            RequestKind::DeregisterAction => write!(f, "DeregisterAction"),
            RequestKind::RecvServerRequest => write!(f, "RecvServerRequest"),
            RequestKind::SendServerResponse => write!(f, "SendServerResponse"),
            RequestKind::NotifyActionHeartbeat => write!(f, "NotifyActionHeartbeat"),
            RequestKind::Unknown(v) => write!(f, "Unknown({})", v),
        }
    }
}

/// Named failure codes. Starts well above any errno value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    UnknownError = 4096,
    UnknownReqType,
    IncorrectReqData,
    ReqFailed,
    ReqTimeout,
    FirstActionFailed,
    MissingSequence,
    ActionDeregistered,
    ActionNotRegistered,
    ActionActive,
    SequenceTimeout,
    SequenceIncorrect,
    SequenceEmpty,
    Shutdown,
    InternalError,
}

impl ErrorCode {
    const ALL: [ErrorCode; 15] = [
        ErrorCode::UnknownError,
        ErrorCode::UnknownReqType,
        ErrorCode::IncorrectReqData,
        ErrorCode::ReqFailed,
        ErrorCode::ReqTimeout,
        ErrorCode::FirstActionFailed,
        ErrorCode::MissingSequence,
        ErrorCode::ActionDeregistered,
        ErrorCode::ActionNotRegistered,
        ErrorCode::ActionActive,
        ErrorCode::SequenceTimeout,
        ErrorCode::SequenceIncorrect,
        ErrorCode::SequenceEmpty,
        ErrorCode::Shutdown,
        ErrorCode::InternalError,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownError => "unknown error",
            ErrorCode::UnknownReqType => "unknown request type",
            ErrorCode::IncorrectReqData => "incorrect request data",
            ErrorCode::ReqFailed => "request failed",
            ErrorCode::ReqTimeout => "request timed out",
            ErrorCode::FirstActionFailed => "first action failed",
            ErrorCode::MissingSequence => "missing sequence",
            ErrorCode::ActionDeregistered => "action deregistered",
            ErrorCode::ActionNotRegistered => "action not registered",
            ErrorCode::ActionActive => "action already active",
            ErrorCode::SequenceTimeout => "sequence timed out",
            ErrorCode::SequenceIncorrect => "sequence incorrect",
            ErrorCode::SequenceEmpty => "sequence empty",
            ErrorCode::Shutdown => "shutdown",
            ErrorCode::InternalError => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Payload naming a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionName {
    pub action: String,
}

/// Liveness signal from a running action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub action: String,
    /// Unix seconds as reported by the client.
    pub timestamp: i64,
}

/// Result of one action run, sent back by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub action: String,
    pub instance_id: String,
    pub anomaly_instance_id: String,
    pub anomaly_key: String,
    pub response: String,
    pub result_code: i32,
    pub result_str: String,
}

/// Work item asking a client to run one action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    pub instance_id: String,
    pub anomaly_instance_id: String,
    pub anomaly_key: String,
    pub timeout_secs: u64,
    /// Results of the earlier actions in the same sequence.
    #[serde(default)]
    pub context: Vec<ActionResponse>,
}

/// Kind-specific request payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RequestPayload {
    #[default]
    Empty,
    Action(ActionName),
    ActionResponse(ActionResponse),
    Heartbeat(Heartbeat),
}

/// Request sent by a client to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub kind: RequestKind,
    pub client_name: String,
    /// 0 = wait indefinitely.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub payload: RequestPayload,
}

impl ClientRequest {
    pub fn new(kind: RequestKind, client_name: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            kind,
            client_name: client_name.into(),
            timeout_secs: 0,
            payload,
        }
    }

    pub fn register_client(client_name: impl Into<String>) -> Self {
        Self::new(RequestKind::RegisterClient, client_name, RequestPayload::Empty)
    }

    pub fn deregister_client(client_name: impl Into<String>) -> Self {
        Self::new(RequestKind::DeregisterClient, client_name, RequestPayload::Empty)
    }

    /// `timeout_secs` of 0 asks for the configured default.
    pub fn register_action(
        client_name: impl Into<String>,
        action: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self::new(
            RequestKind::RegisterAction,
            client_name,
            RequestPayload::Action(ActionName {
                action: action.into(),
            }),
        )
        .with_timeout(timeout_secs)
    }

    pub fn deregister_action(client_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(
            RequestKind::DeregisterAction,
            client_name,
            RequestPayload::Action(ActionName {
                action: action.into(),
            }),
        )
    }

    pub fn recv_server_request(client_name: impl Into<String>, timeout_secs: u64) -> Self {
        Self::new(RequestKind::RecvServerRequest, client_name, RequestPayload::Empty)
            .with_timeout(timeout_secs)
    }

    pub fn send_server_response(client_name: impl Into<String>, response: ActionResponse) -> Self {
        Self::new(
            RequestKind::SendServerResponse,
            client_name,
            RequestPayload::ActionResponse(response),
        )
    }

    pub fn notify_heartbeat(
        client_name: impl Into<String>,
        action: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self::new(
            RequestKind::NotifyActionHeartbeat,
            client_name,
            RequestPayload::Heartbeat(Heartbeat {
                action: action.into(),
                timestamp,
            }),
        )
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Work item delivered to a client by a successful pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ServerRequest {
    Action(ActionRequest),
    Shutdown,
}

/// Response payload; only a successful pull carries data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ResponsePayload {
    #[default]
    None,
    ServerRequest(ServerRequest),
}

/// Response returned by the engine for every client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub result_code: i32,
    #[serde(default)]
    pub result_message: String,
    #[serde(default)]
    pub payload: ResponsePayload,
}

impl ClientResponse {
    pub fn success() -> Self {
        Self {
            result_code: RESULT_SUCCESS,
            result_message: String::new(),
            payload: ResponsePayload::None,
        }
    }

    pub fn server_request(request: ServerRequest) -> Self {
        Self {
            result_code: RESULT_SUCCESS,
            result_message: String::new(),
            payload: ResponsePayload::ServerRequest(request),
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            result_code: code.code(),
            result_message: message.into(),
            payload: ResponsePayload::None,
        }
    }

    pub fn from_error(err: &crate::EngineError) -> Self {
        Self::failure(err.result_code(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.result_code == RESULT_SUCCESS
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.result_code)
    }
}

/// Periodic batch of actions that reported liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBatch {
    pub actions: Vec<String>,
    pub timestamp: i64,
}

/// Record handed to the external event publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineEvent {
    Heartbeat(HeartbeatBatch),
    ActionResult(ActionResponse),
}
