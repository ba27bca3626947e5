//! Session-authenticated MCP tool dispatch in front of the CRM REST API.
//!
//! Transports hand raw JSON-RPC bodies plus a [`RequestContext`] to a
//! [`Dispatcher`]; everything below it (session resolution, upstream calls,
//! error mapping) lives in this crate.

mod args;
pub mod crm;
mod dispatch;
pub mod protocol;
pub mod session;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::sync::Arc;

use crm_gateway_core::clock::Clock;
use crm_gateway_core::session::InMemoryCredentialStore;

pub use args::ToolError;
pub use crm::{CrmClientFactory, CrmConfig, CrmError};
pub use dispatch::{Dispatcher, RequestContext};
pub use protocol::RpcError;
pub use session::{AuthError, SessionManager, SessionPolicy};
pub use tools::{RegistryError, ToolDescriptor, ToolKind, ToolRegistry};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "crm-gateway";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything needed to assemble a [`Dispatcher`] with the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub crm: CrmConfig,
    pub session: SessionPolicy,
}

impl RuntimeConfig {
    /// Wires store, client factory, session manager and the standard
    /// tool catalog together.
    pub fn build_dispatcher(&self, clock: Arc<dyn Clock>) -> Result<Dispatcher, BuildError> {
        let crm = CrmClientFactory::new(&self.crm)?;
        let store = InMemoryCredentialStore::shared(clock.clone(), self.session.ttl);
        let sessions = SessionManager::new(store, crm, clock, self.session.clone());
        Ok(Dispatcher::new(ToolRegistry::standard()?, sessions))
    }
}
