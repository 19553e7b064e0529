// func_dispatch puts resolved calls on the message bus and waits for the
// runner's single reply. FunctionGateway is the entrypoint the HTTP layer
// calls; func_ctl drives the control plane from a shell.

mod bus;
mod dispatch_client;
mod gateway;
mod http_bus;
mod local_bus;
mod nats_bus;

pub use bus::{connect_bus, MessageBus};
pub use dispatch_client::{CallState, DispatchClient};
pub use gateway::{CallRequest, FunctionGateway};
pub use http_bus::HttpBus;
pub use local_bus::{BusRequest, BusSubscription, LocalBus};
pub use nats_bus::NatsBus;
