//! Wire codec for the Streamlabs remote control protocol.
//!
//! Outbound traffic is always a JSON-RPC 2.0 request. Inbound traffic shares
//! one line stream between responses and pushed events, so each line is
//! parsed into a loosely typed [`Document`] and classified once into an
//! [`InboundMessage`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const EVENT_MARKER: &str = "EVENT";
pub const HELPER_MARKER: &str = "HELPER";

const TYPE_PATH: &str = "result._type";
const RESOURCE_ID_PATH: &str = "result.resourceId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    pub resource: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    /// Request addressed to `method` on a remote service resource.
    pub fn call(id: u64, resource: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params: Some(RequestParams {
                resource: resource.into(),
                args: Vec::new(),
            }),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        if let Some(params) = self.params.as_mut() {
            params.args.push(value.into());
        }
        self
    }

    pub fn args(&self) -> &[Value] {
        self.params.as_ref().map(|p| p.args.as_slice()).unwrap_or(&[])
    }
}

pub fn encode_request(request: &Request) -> Result<String, serde_json::Error> {
    serde_json::to_string(request)
}

pub fn decode_request(text: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(text)
}

/// Parsed inbound line with field probing by dotted path.
///
/// Path segments address object keys, or array positions when the current
/// node is an array (`items.0.status`).
#[derive(Debug, Clone)]
pub struct Document {
    raw: String,
    value: Value,
}

impl Document {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value = serde_json::from_str(text)?;
        Ok(Self {
            raw: text.to_string(),
            value,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn into_raw(self) -> String {
        self.raw
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.value, path)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn u64_at(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    pub fn len_at(&self, path: &str) -> Option<usize> {
        self.get(path).and_then(Value::as_array).map(Vec::len)
    }

    /// Deserializes the node at `path`; `None` when the path is absent.
    pub fn decode_at<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Option<Result<T, serde_json::Error>> {
        self.get(path).map(|v| T::deserialize(v))
    }

    pub fn is_event(&self) -> bool {
        self.str_at(TYPE_PATH) == Some(EVENT_MARKER)
    }

    /// Companion payload that reuses a pending identifier but is not the
    /// response to it.
    pub fn is_helper(&self) -> bool {
        self.str_at(TYPE_PATH) == Some(HELPER_MARKER)
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(ResponseFrame),
    Event(EventFrame),
    Unrecognized,
}

#[derive(Debug, Clone)]
pub struct ResponseFrame {
    id: u64,
    error: bool,
    doc: Document,
}

impl ResponseFrame {
    /// Re-reads the raw text handed back by `Session::send_and_await`.
    pub fn from_raw(text: &str) -> Option<Self> {
        match classify(text) {
            InboundMessage::Response(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_helper(&self) -> bool {
        self.doc.is_helper()
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn raw(&self) -> &str {
        self.doc.raw()
    }

    pub fn into_raw(self) -> String {
        self.doc.into_raw()
    }

    pub fn result<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.doc.decode_at("result")
    }
}

#[derive(Debug, Clone)]
pub struct EventFrame {
    resource_id: String,
    doc: Document,
}

impl EventFrame {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }
}

/// Classifies one inbound line. Lines that are not JSON, or JSON of an
/// unknown shape, come back as `Unrecognized`.
pub fn classify(line: &str) -> InboundMessage {
    let doc = match Document::parse(line) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::debug!(error = %err, "dropping malformed inbound frame");
            return InboundMessage::Unrecognized;
        }
    };

    if doc.is_event() {
        return match doc.str_at(RESOURCE_ID_PATH).map(str::to_string) {
            Some(resource_id) => InboundMessage::Event(EventFrame { resource_id, doc }),
            None => InboundMessage::Unrecognized,
        };
    }

    match doc.u64_at("id") {
        Some(id) => {
            let error = match doc.get("error") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(flag)) => *flag,
                Some(_) => true,
            };
            InboundMessage::Response(ResponseFrame { id, error, doc })
        }
        None => InboundMessage::Unrecognized,
    }
}
