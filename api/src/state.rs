use crm_gateway_mcp_runtime::Dispatcher;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::push::PushChannels;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub channels: PushChannels,
    pub transport: TransportConfig,
    /// Cancelled on server shutdown; every push channel holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        dispatcher: Dispatcher,
        transport: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            channels: PushChannels::default(),
            transport,
            shutdown,
        }
    }
}
