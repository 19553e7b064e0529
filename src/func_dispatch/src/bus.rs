use async_trait::async_trait;
use func_lib::{BusEndpoint, BusMessage, BusReply, FnResult};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::http_bus::HttpBus;
use crate::local_bus::LocalBus;
use crate::nats_bus::NatsBus;

/// Request/reply transport. One request yields at most one reply; no reply
/// within `timeout` is `FnError::TimedOut`, failing to deliver at all is
/// `FnError::TransportError`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn request(&self, msg: BusMessage, timeout: Duration) -> FnResult<BusReply>;
}

/// Opens the transport the configured endpoint names.
pub async fn connect_bus(endpoint: &BusEndpoint) -> FnResult<Arc<dyn MessageBus>> {
    match endpoint {
        BusEndpoint::Nats(url) => Ok(Arc::new(NatsBus::connect(url).await?)),
        BusEndpoint::Http(url) => Ok(Arc::new(HttpBus::new(url)?)),
        BusEndpoint::Local => {
            info!("using the in-process bus, only local subscribers answer");
            Ok(Arc::new(LocalBus::new()))
        }
    }
}
