// Wire protocol between the control plane and remote runners.

use crate::{validate_subject_token, FnError, FnResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const RUN_SUBJECT_PREFIX: &str = "function.run";

pub const HEADER_TRACE_ID: &str = "trace_id";
pub const HEADER_USER: &str = "user";
pub const HEADER_RUNNER: &str = "runner";
pub const HEADER_VERSION: &str = "version";
pub const HEADER_METHOD: &str = "method";
pub const HEADER_ROUTER: &str = "router";
pub const HEADER_URL_QUERY: &str = "url_query";
pub const HEADER_CODE: &str = "code";
pub const HEADER_MSG: &str = "msg";

pub const REPLY_CODE_OK: &str = "0";

/// `function.run.<owner>.<runner>.<version>`
pub fn run_subject(owner: &str, runner: &str, version: &str) -> FnResult<String> {
    validate_subject_token(owner)?;
    validate_subject_token(runner)?;
    validate_subject_token(version)?;
    Ok(format!("{}.{}.{}.{}", RUN_SUBJECT_PREFIX, owner, runner, version))
}

static TRACE_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn new_trace_id() -> String {
    let seq = TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:x}-{:x}-{:x}",
        crate::unix_timestamp_millis(),
        std::process::id(),
        seq
    )
}

pub type Headers = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusReply {
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl BusReply {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        let mut headers = Headers::new();
        headers.insert(HEADER_CODE.to_string(), REPLY_CODE_OK.to_string());
        Self {
            headers,
            payload: payload.into(),
        }
    }

    pub fn error(code: impl Into<String>, msg: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert(HEADER_CODE.to_string(), code.into());
        headers.insert(HEADER_MSG.to_string(), msg.into());
        Self {
            headers,
            payload: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn code(&self) -> Option<&str> {
        self.header(HEADER_CODE)
    }
}

/// A resolved call, ready to be put on the bus.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvokeRequest {
    pub trace_id: String,
    pub owner: String,
    pub runner: String,
    pub version: String,
    pub method: String,
    pub sub_path: String,
    pub raw_query: String,
    pub body: Vec<u8>,
}

impl InvokeRequest {
    pub fn to_bus_message(&self) -> FnResult<BusMessage> {
        let subject = run_subject(&self.owner, &self.runner, &self.version)?;
        let trace_id = if self.trace_id.is_empty() {
            new_trace_id()
        } else {
            self.trace_id.clone()
        };

        let mut headers = Headers::new();
        headers.insert(HEADER_TRACE_ID.to_string(), trace_id);
        headers.insert(HEADER_USER.to_string(), self.owner.clone());
        headers.insert(HEADER_RUNNER.to_string(), self.runner.clone());
        headers.insert(HEADER_VERSION.to_string(), self.version.clone());
        headers.insert(HEADER_METHOD.to_string(), self.method.to_ascii_uppercase());
        headers.insert(HEADER_ROUTER.to_string(), self.sub_path.clone());
        headers.insert(HEADER_URL_QUERY.to_string(), self.raw_query.clone());

        Ok(BusMessage {
            subject,
            headers,
            payload: self.body.clone(),
        })
    }
}

/// Normalized reply body handed back to the HTTP layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub meta_data: Map<String, Value>,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parses a successful reply. An empty body yields an envelope with null
    /// data; a body that is not a JSON object is a decode error. Reply
    /// headers other than `code` are merged into `meta_data` and win over
    /// body keys.
    pub fn from_reply(reply: &BusReply) -> FnResult<Self> {
        let mut envelope = if reply.payload.iter().all(|b| b.is_ascii_whitespace()) {
            Envelope::default()
        } else {
            serde_json::from_slice::<Envelope>(&reply.payload)
                .map_err(|e| FnError::DecodeError(format!("invalid reply body: {}", e)))?
        };

        for (name, value) in reply.headers.iter() {
            if name == HEADER_CODE {
                continue;
            }
            envelope
                .meta_data
                .insert(name.clone(), Value::String(value.clone()));
        }

        if envelope.trace_id.is_empty() {
            if let Some(trace_id) = reply.header(HEADER_TRACE_ID) {
                envelope.trace_id = trace_id.to_string();
            }
        }
        Ok(envelope)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta_data.insert(key.to_string(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta_data.get(key).and_then(|v| v.as_str())
    }

    pub fn to_json_bytes(&self) -> FnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
