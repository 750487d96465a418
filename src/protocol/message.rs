/// Host ↔ worker message envelopes.
/// Every frame is a single JSON object; notifications carry a `method`
/// and `args`, correlated exchanges carry a `requestId`.
use serde_json::{json, Map, Value};

use super::ProtocolError;

/// Method name of the worker's handshake notification.
pub const READY: &str = "__ready";
/// Method name of the host's "start the script" notification.
pub const RUN: &str = "__run";
/// Method name of the worker's result notification.
pub const RETURN: &str = "__return";
/// Method name of the host's "shut down" notification.
pub const KILL: &str = "__kys";

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Worker bootstrapped and is waiting for `Run`.
    Ready { id: String },
    /// Host asks the worker to run the script with these arguments.
    Run { args: Vec<Value> },
    /// Worker reports the script's return value.
    Return { id: String, value: Value },
    /// Host tells the worker to close the connection and exit.
    Kill,
    /// Fire-and-forget notification emitted by the script itself.
    Notify { method: String, args: Vec<Value> },
    /// Worker invokes a host binding.
    Request {
        request_id: u64,
        method: String,
        args: Vec<Value>,
    },
    /// Host answers a `Request`. `Err` carries the host-side error message.
    Response {
        request_id: u64,
        outcome: Result<Value, String>,
    },
}

impl Message {
    /// Returns true if `method` is reserved for protocol control messages.
    pub fn is_reserved(method: &str) -> bool {
        method.starts_with("__")
    }

    /// Builds the wire representation of this message.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Ready { id } => json!({ "method": READY, "args": [id] }),
            Message::Run { args } => json!({ "method": RUN, "args": args }),
            Message::Return { id, value } => json!({ "method": RETURN, "args": [id, value] }),
            Message::Kill => json!({ "method": KILL }),
            Message::Notify { method, args } => json!({ "method": method, "args": args }),
            Message::Request {
                request_id,
                method,
                args,
            } => json!({ "requestId": request_id, "method": method, "args": args }),
            Message::Response {
                request_id,
                outcome: Ok(value),
            } => json!({ "requestId": request_id, "response": value }),
            Message::Response {
                request_id,
                outcome: Err(message),
            } => json!({ "requestId": request_id, "error": message }),
        }
    }

    /// Encodes the message as one newline-terminated frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.to_value().to_string();
        frame.push('\n');
        frame.into_bytes()
    }

    /// Decodes a single frame (without its trailing delimiter).
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(frame)?;
        Self::from_value(value)
    }

    /// Interprets a JSON value as a protocol message.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if let Some(request_id) = fields.remove("requestId") {
            let request_id = request_id
                .as_u64()
                .ok_or(ProtocolError::InvalidField { field: "requestId" })?;
            return Self::correlated(request_id, fields);
        }

        let method = match fields.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(ProtocolError::InvalidField { field: "method" }),
            None => return Err(ProtocolError::MissingField("method")),
        };
        let mut args = take_args(&mut fields)?.into_iter();

        let message = match method.as_str() {
            READY => Message::Ready {
                id: take_id(args.next())?,
            },
            RUN => Message::Run {
                args: args.collect(),
            },
            RETURN => Message::Return {
                id: take_id(args.next())?,
                value: args.next().unwrap_or(Value::Null),
            },
            KILL => Message::Kill,
            _ => Message::Notify {
                method,
                args: args.collect(),
            },
        };
        Ok(message)
    }

    /// Decodes the `requestId`-carrying half of the protocol.
    fn correlated(request_id: u64, mut fields: Map<String, Value>) -> Result<Self, ProtocolError> {
        if let Some(method) = fields.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidField { field: "method" });
            };
            return Ok(Message::Request {
                request_id,
                method,
                args: take_args(&mut fields)?,
            });
        }

        if let Some(error) = fields.remove("error") {
            let message = match error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Ok(Message::Response {
                request_id,
                outcome: Err(message),
            });
        }

        // JSON.stringify drops `undefined`, so an absent response is a null one
        Ok(Message::Response {
            request_id,
            outcome: Ok(fields.remove("response").unwrap_or(Value::Null)),
        })
    }
}

fn take_args(fields: &mut Map<String, Value>) -> Result<Vec<Value>, ProtocolError> {
    match fields.remove("args") {
        Some(Value::Array(args)) => Ok(args),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(ProtocolError::InvalidField { field: "args" }),
    }
}

fn take_id(value: Option<Value>) -> Result<String, ProtocolError> {
    match value {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(ProtocolError::InvalidField { field: "id" }),
        None => Err(ProtocolError::MissingField("id")),
    }
}
