//! Session Manager: validates credentials against the CRM once, caches them
//! in the Credential Store, and resolves callers back to live credentials.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crm_gateway_core::auth::has_expected_prefix;
use crm_gateway_core::clock::Clock;
use crm_gateway_core::session::{Credentials, CredentialsError, SharedCredentialStore};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crm::{CrmClient, CrmClientFactory, CrmError};
use crate::protocol::RpcError;

/// Session id shared by every caller that sends no correlation header.
pub const DEFAULT_SESSION_ID: &str = "default-session";

/// Correlation headers, highest priority first.
pub const SESSION_HEADERS: [&str; 3] = ["x-thread-id", "x-conversation-id", "x-session-id"];

pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Picks the session id from transport metadata. `lookup` returns the raw
/// header value for a (lowercase) header name; blank values are skipped.
pub fn resolve_session_id<'a>(
    lookup: impl Fn(&str) -> Option<&'a str>,
    fallback: Option<&str>,
) -> Option<String> {
    SESSION_HEADERS
        .iter()
        .filter_map(|header| lookup(*header))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .or(fallback)
        .map(ToOwned::to_owned)
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub ttl: chrono::Duration,
    /// Drop an existing session for the id when a re-authentication probe fails.
    pub invalidate_on_failed_auth: bool,
    /// Required API key prefix; `None` or empty disables the check.
    pub api_key_prefix: Option<String>,
    /// Single-tenant fallback id; `None` requires a correlation header.
    pub fallback_session_id: Option<String>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            invalidate_on_failed_auth: false,
            api_key_prefix: None,
            fallback_session_id: Some(DEFAULT_SESSION_ID.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    BadCredentials(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] CrmError),
    #[error("authentication required for session '{session_id}'; call 'authenticate' first")]
    AuthenticationRequired { session_id: String },
}

impl From<CredentialsError> for AuthError {
    fn from(err: CredentialsError) -> Self {
        AuthError::BadCredentials(err.to_string())
    }
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::BadCredentials(_) => RpcError::bad_credentials(err.to_string()),
            AuthError::AuthenticationFailed(source) => {
                let mut rpc = RpcError::authentication_failed(err.to_string());
                if let Some(status) = source.status() {
                    rpc = rpc.with_data(serde_json::json!({ "status": status }));
                }
                rpc.with_data(serde_json::json!({ "upstream": source.code() }))
            }
            AuthError::AuthenticationRequired { session_id } => {
                let session_id = session_id.clone();
                RpcError::authentication_required(err.to_string())
                    .with_data(serde_json::json!({ "session_id": session_id }))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    pub success: bool,
    pub message: String,
    pub session_id: String,
    pub expires_in_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<String>,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
}

#[derive(Clone)]
pub struct SessionManager {
    store: SharedCredentialStore,
    crm: CrmClientFactory,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(
        store: SharedCredentialStore,
        crm: CrmClientFactory,
        clock: Arc<dyn Clock>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            crm,
            clock,
            policy,
        }
    }

    /// Session id for a request, applying the single-tenant fallback.
    pub fn effective_session_id(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or(self.policy.fallback_session_id.as_deref())
            .map(ToOwned::to_owned)
    }

    /// Probes the CRM once with the supplied credentials and caches them
    /// under the session id on success. Nothing is stored on failure.
    pub async fn authenticate(
        &self,
        session_id: Option<&str>,
        api_key: &str,
        account_id: &str,
    ) -> Result<AuthOutcome, AuthError> {
        let session_id = self.effective_session_id(session_id).ok_or_else(|| {
            AuthError::BadCredentials(
                "no session identifier supplied; send an x-session-id header".to_string(),
            )
        })?;
        let credentials = Credentials::new(api_key, account_id)?;
        if let Some(prefix) = self.policy.api_key_prefix.as_deref() {
            if !has_expected_prefix(credentials.api_key(), prefix) {
                return Err(AuthError::BadCredentials(format!(
                    "api_key must start with '{prefix}'"
                )));
            }
        }

        let client = self.crm.build(&credentials);
        if let Err(err) = client.get_location().await {
            let invalidated =
                self.policy.invalidate_on_failed_auth && self.store.remove(&session_id);
            warn!(
                event = "session_auth_failed",
                session_id = %session_id,
                key_fp = %credentials.key_fingerprint(),
                account_id = %credentials.account_id(),
                error = %err,
                invalidated,
                "CRM rejected authentication probe"
            );
            return Err(AuthError::AuthenticationFailed(err));
        }

        info!(
            event = "session_authenticated",
            session_id = %session_id,
            key_fp = %credentials.key_fingerprint(),
            account_id = %credentials.account_id(),
            "session credentials verified and cached"
        );
        self.store.put(&session_id, credentials);

        Ok(AuthOutcome {
            success: true,
            message: format!(
                "Authenticated. Session '{session_id}' can now call CRM tools."
            ),
            session_id,
            expires_in_secs: self.policy.ttl.num_seconds(),
        })
    }

    /// Live credentials for the session, refreshing its last use.
    pub fn resolve(&self, session_id: Option<&str>) -> Result<Credentials, AuthError> {
        let Some(session_id) = self.effective_session_id(session_id) else {
            return Err(AuthError::AuthenticationRequired {
                session_id: String::new(),
            });
        };
        self.store.get(&session_id).map_err(|err| {
            debug!(event = "session_resolve_miss", session_id = %session_id, error = %err);
            AuthError::AuthenticationRequired { session_id }
        })
    }

    pub fn client_for(&self, session_id: Option<&str>) -> Result<CrmClient, AuthError> {
        self.resolve(session_id)
            .map(|credentials| self.crm.build(&credentials))
    }

    /// Read-only view of the caller's session; never refreshes it.
    pub fn status(&self, session_id: Option<&str>) -> SessionStatus {
        let session_id = self.effective_session_id(session_id);
        let now = self.clock.now();
        let record = session_id.as_deref().and_then(|id| self.store.peek(id));
        match record {
            Some(record) => SessionStatus {
                session_id,
                authenticated: true,
                account_id: Some(record.credentials.account_id().to_string()),
                key_fingerprint: Some(record.credentials.key_fingerprint()),
                created_at: Some(record.created_at),
                last_used: Some(record.last_used),
                expires_in_secs: Some(record.expires_in(now, self.policy.ttl).num_seconds()),
            },
            None => SessionStatus {
                session_id,
                authenticated: false,
                account_id: None,
                key_fingerprint: None,
                created_at: None,
                last_used: None,
                expires_in_secs: None,
            },
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.store.len()
    }

    /// One sweep pass at the current clock time.
    pub fn sweep_expired(&self) -> usize {
        self.store.sweep(self.clock.now(), self.policy.ttl)
    }

    /// Background eviction, independent of request handling. Stops when
    /// `cancel` fires.
    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(event = "session_sweeper_stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = manager.sweep_expired();
                        if evicted > 0 {
                            info!(
                                event = "session_sweep",
                                evicted,
                                remaining = manager.active_sessions(),
                                "evicted expired sessions"
                            );
                        }
                    }
                }
            }
        })
    }
}
