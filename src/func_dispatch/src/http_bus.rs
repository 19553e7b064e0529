use async_trait::async_trait;
use func_lib::{BusMessage, BusReply, FnError, FnResult, Headers};
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;

use crate::bus::MessageBus;

/// Bus gateway reached over HTTP: each request is `POST <bus_url>/<subject>`
/// carrying the wire headers and the raw payload; the response headers and
/// body are the runner's reply.
pub struct HttpBus {
    bus_url: String,
    client: Client,
}

impl HttpBus {
    pub fn new(bus_url: &str) -> FnResult<Self> {
        let bus_url = bus_url.trim().trim_end_matches('/').to_string();
        if bus_url.is_empty() {
            return Err(FnError::InvalidParam("bus url is empty".to_string()));
        }
        let lower = bus_url.to_ascii_lowercase();
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            return Err(FnError::InvalidParam(format!(
                "http bus needs an http(s) url, got {}",
                bus_url
            )));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| FnError::Internal(format!("failed to create http client: {}", e)))?;
        Ok(Self { bus_url, client })
    }

    pub fn subject_url(&self, subject: &str) -> String {
        format!("{}/{}", self.bus_url, subject)
    }
}

fn to_header_map(headers: &Headers) -> FnResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FnError::InvalidParam(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FnError::InvalidParam(format!("invalid value for {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    headers
}

fn map_send_err(url: &str, timeout: Duration, err: reqwest::Error) -> FnError {
    if err.is_timeout() {
        FnError::TimedOut(format!("no reply from {} within {} ms", url, timeout.as_millis()))
    } else {
        FnError::TransportError(format!("request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn request(&self, msg: BusMessage, timeout: Duration) -> FnResult<BusReply> {
        let url = self.subject_url(&msg.subject);
        let headers = to_header_map(&msg.headers)?;
        debug!("POST {} ({} bytes)", url, msg.payload.len());

        let res = self
            .client
            .post(&url)
            .headers(headers)
            .timeout(timeout)
            .body(msg.payload)
            .send()
            .await
            .map_err(|e| map_send_err(&url, timeout, e))?;

        if !res.status().is_success() {
            return Err(FnError::TransportError(format!(
                "HTTP error: {} for {}",
                res.status(),
                url
            )));
        }

        let headers = from_header_map(res.headers());
        let payload = res
            .bytes()
            .await
            .map_err(|e| map_send_err(&url, timeout, e))?;
        Ok(BusReply {
            headers,
            payload: payload.to_vec(),
        })
    }
}
