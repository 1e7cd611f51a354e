//! Controller message types carried over the runner channel.
//!
//! Messages are JSON-RPC 2.0 shaped. The runner sends a `start_app` request
//! (whose id doubles as the completion-callback reference) and may send an
//! `exit_now` notification at any time. The worker answers `start_app`
//! exactly once, when the controller goes away.

use childlink_types::{AppResult, ServiceRequest};
use serde::{Deserialize, Serialize};

pub const START_APP: &str = "start_app";
pub const EXIT_NOW: &str = "exit_now";

const JSONRPC_VERSION: &str = "2.0";

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Request ids are echoed back verbatim, whatever JSON type the runner chose.
pub type RequestId = serde_json::Value;

/// Protocol-level rejections sent back to the runner as JSON-RPC errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("application already started")]
    AlreadyStarted,
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params for {method}: {detail}")]
    InvalidParams { method: String, detail: String },
}

impl ProtocolError {
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::AlreadyStarted => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartAppParams {
    pub request: ServiceRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExitNowParams {
    pub exit_code: i32,
}

/// Payload of the worker's reply to `start_app`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub code: u32,
    pub status: String,
}

impl From<AppResult> for Completion {
    fn from(result: AppResult) -> Self {
        Self {
            code: result.code(),
            status: result.as_str().to_string(),
        }
    }
}

/// A decoded frame from the runner.
#[derive(Debug)]
pub(crate) enum Incoming {
    StartApp {
        id: RequestId,
        request: ServiceRequest,
    },
    ExitNow {
        exit_code: i32,
    },
    /// A request the worker must answer with an error.
    Rejected {
        id: RequestId,
        error: ProtocolError,
    },
    /// A notification (or response) the worker has no use for.
    Ignored {
        reason: String,
    },
}

fn decode_params<T: for<'de> Deserialize<'de>>(
    method: &str,
    params: Option<&serde_json::Value>,
) -> Result<T, ProtocolError> {
    let params = params.cloned().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams {
        method: method.to_string(),
        detail: e.to_string(),
    })
}

/// Classify a raw frame.
///
/// Returns `None` for frames that are not JSON-RPC messages at all.
pub(crate) fn parse_incoming(frame: &serde_json::Value) -> Option<Incoming> {
    let object = frame.as_object()?;
    let id = object.get("id").cloned();
    let params = object.get("params");

    let Some(method) = object.get("method").and_then(serde_json::Value::as_str) else {
        return Some(Incoming::Ignored {
            reason: "frame without method".to_string(),
        });
    };

    let decoded = match method {
        START_APP => decode_params::<StartAppParams>(method, params).and_then(|p| match &id {
            Some(id) => Ok(Incoming::StartApp {
                id: id.clone(),
                request: p.request,
            }),
            None => Err(ProtocolError::InvalidParams {
                method: method.to_string(),
                detail: "start_app must be sent as a request".to_string(),
            }),
        }),
        EXIT_NOW => decode_params::<ExitNowParams>(method, params).map(|p| Incoming::ExitNow {
            exit_code: p.exit_code,
        }),
        other => Err(ProtocolError::MethodNotFound(other.to_string())),
    };

    Some(match (decoded, id) {
        (Ok(incoming), _) => incoming,
        (Err(error), Some(id)) => Incoming::Rejected { id, error },
        (Err(error), None) => Incoming::Ignored {
            reason: error.to_string(),
        },
    })
}

#[must_use]
pub fn start_app_request(id: u64, request: &ServiceRequest) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": START_APP,
        "params": { "request": request },
    })
}

#[must_use]
pub fn exit_now_notification(exit_code: i32) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": EXIT_NOW,
        "params": { "exit_code": exit_code },
    })
}

pub(crate) fn completion_response(id: RequestId, result: AppResult) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": Completion::from(result),
    })
}

pub(crate) fn error_response(id: RequestId, error: &ProtocolError) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": error.code(),
            "message": error.to_string(),
        },
    })
}

/// Extract the completion result from a worker reply, for runner-side code.
#[must_use]
pub fn parse_completion(frame: &serde_json::Value) -> Option<AppResult> {
    let completion: Completion = serde_json::from_value(frame.get("result")?.clone()).ok()?;
    AppResult::from_code(completion.code)
}
