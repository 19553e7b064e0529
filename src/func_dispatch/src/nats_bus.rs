use async_nats::{Client, HeaderMap, Request, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use func_lib::{BusMessage, BusReply, FnError, FnResult, Headers};
use log::{debug, info, warn};
use std::time::Duration;

use crate::bus::MessageBus;

/// Request/reply over a NATS server. Runners subscribe to their versioned
/// subject; the reply arrives on the client's inbox.
pub struct NatsBus {
    server_url: String,
    client: Client,
}

impl NatsBus {
    pub async fn connect(server_url: &str) -> FnResult<Self> {
        let server_url = server_url.trim().to_string();
        if server_url.is_empty() {
            return Err(FnError::InvalidParam("nats url is empty".to_string()));
        }
        let client = async_nats::connect(server_url.as_str()).await.map_err(|e| {
            warn!("connect to nats {} failed: {}", server_url, e);
            FnError::TransportError(format!("connect to {} failed: {}", server_url, e))
        })?;
        info!("connected to nats {}", server_url);
        Ok(Self { server_url, client })
    }

    /// Wraps a client the caller already connected.
    pub fn from_client(server_url: impl Into<String>, client: Client) -> Self {
        Self {
            server_url: server_url.into(),
            client,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn check_header(name: &str, value: &str) -> FnResult<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(FnError::InvalidParam(format!("invalid header name {:?}", name)));
    }
    if value.contains('\r') || value.contains('\n') {
        return Err(FnError::InvalidParam(format!("invalid value for {}", name)));
    }
    Ok(())
}

fn to_nats_headers(headers: &Headers) -> FnResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        check_header(name, value)?;
        map.insert(name.as_str(), value.as_str());
    }
    Ok(map)
}

/// First value wins when a header repeats.
fn from_nats_headers(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    headers
}

fn map_request_err(kind: RequestErrorKind, subject: &str, timeout: Duration, detail: &str) -> FnError {
    match kind {
        RequestErrorKind::TimedOut => FnError::TimedOut(format!(
            "no reply on {} within {} ms",
            subject,
            timeout.as_millis()
        )),
        RequestErrorKind::NoResponders => {
            FnError::TransportError(format!("no responders for {}", subject))
        }
        _ => FnError::TransportError(format!("request on {} failed: {}", subject, detail)),
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn request(&self, msg: BusMessage, timeout: Duration) -> FnResult<BusReply> {
        let headers = to_nats_headers(&msg.headers)?;
        debug!(
            "nats request {} ({} bytes) via {}",
            msg.subject,
            msg.payload.len(),
            self.server_url
        );
        let request = Request::new()
            .headers(headers)
            .payload(Bytes::from(msg.payload))
            .timeout(Some(timeout));
        let reply = self
            .client
            .send_request(msg.subject.clone(), request)
            .await
            .map_err(|e| map_request_err(e.kind(), &msg.subject, timeout, &e.to_string()))?;

        Ok(BusReply {
            headers: from_nats_headers(reply.headers.as_ref()),
            payload: reply.payload.to_vec(),
        })
    }
}
