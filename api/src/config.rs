use std::time::Duration;

use clap::Parser;
use crm_gateway_mcp_runtime::crm::{DEFAULT_CRM_API_VERSION, DEFAULT_CRM_BASE_URL};
use crm_gateway_mcp_runtime::session::DEFAULT_SESSION_ID;
use crm_gateway_mcp_runtime::{CrmConfig, RuntimeConfig, SessionPolicy};
use url::Url;

const MIN_BODY_BYTES: usize = 1024;
const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "crm-gateway",
    version,
    about = "Session-authenticated MCP gateway in front of the CRM REST API"
)]
pub struct GatewayConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Base URL of the upstream CRM REST API
    #[arg(long, env = "CRM_BASE_URL", default_value = DEFAULT_CRM_BASE_URL)]
    pub crm_base_url: String,

    /// Value sent in the upstream `Version` header
    #[arg(long, env = "CRM_API_VERSION", default_value = DEFAULT_CRM_API_VERSION)]
    pub crm_api_version: String,

    /// Timeout for every upstream call, in seconds
    #[arg(
        long,
        env = "CRM_UPSTREAM_TIMEOUT_SECS",
        default_value_t = 20,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub upstream_timeout_secs: u64,

    /// Idle lifetime of an authenticated session, in seconds
    #[arg(long, env = "CRM_GATEWAY_SESSION_TTL_SECS", default_value_t = 3600)]
    pub session_ttl_secs: u64,

    /// How often expired sessions are swept, in seconds
    #[arg(long, env = "CRM_GATEWAY_SWEEP_INTERVAL_SECS", default_value_t = 600)]
    pub sweep_interval_secs: u64,

    /// Refuse requests without a session correlation header instead of
    /// sharing one default session
    #[arg(long, env = "CRM_GATEWAY_REQUIRE_SESSION_HEADER")]
    pub require_session_header: bool,

    /// Drop an existing session when re-authentication fails
    #[arg(long, env = "CRM_GATEWAY_INVALIDATE_ON_FAILED_AUTH")]
    pub invalidate_on_failed_auth: bool,

    /// Required API key prefix; empty disables the check
    #[arg(long, env = "CRM_API_KEY_PREFIX", default_value = "pit-")]
    pub api_key_prefix: String,

    /// Maximum accepted request body size, in bytes
    #[arg(long, env = "CRM_GATEWAY_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Heartbeat interval on push channels, in seconds
    #[arg(long, env = "CRM_GATEWAY_PUSH_HEARTBEAT_SECS", default_value_t = 25)]
    pub push_heartbeat_secs: u64,

    /// Hard cap on a push channel's lifetime, in seconds
    #[arg(long, env = "CRM_GATEWAY_PUSH_MAX_LIFETIME_SECS", default_value_t = 55)]
    pub push_max_lifetime_secs: u64,

    /// Comma-separated allowed CORS origins, or `*`
    #[arg(long, env = "CRM_GATEWAY_CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Turn off per-IP rate limiting on the RPC endpoints
    #[arg(long, env = "CRM_GATEWAY_DISABLE_RATE_LIMIT")]
    pub disable_rate_limit: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "push heartbeat ({heartbeat_secs}s) must be shorter than the push max lifetime ({lifetime_secs}s)"
    )]
    HeartbeatNotShorterThanLifetime {
        heartbeat_secs: u64,
        lifetime_secs: u64,
    },
    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: u64 },
    #[error("max body bytes must be at least 1024")]
    BodyLimitTooSmall,
    #[error("invalid CRM base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Transport knobs the HTTP layer needs at request time.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_body_bytes: usize,
    pub push_heartbeat: Duration,
    pub push_max_lifetime: Duration,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("session_ttl_secs", self.session_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("push_heartbeat_secs", self.push_heartbeat_secs),
            ("push_max_lifetime_secs", self.push_max_lifetime_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value, max) in [
            ("session_ttl_secs", self.session_ttl_secs, MAX_SESSION_TTL_SECS),
            ("sweep_interval_secs", self.sweep_interval_secs, MAX_INTERVAL_SECS),
            ("push_heartbeat_secs", self.push_heartbeat_secs, MAX_INTERVAL_SECS),
            ("push_max_lifetime_secs", self.push_max_lifetime_secs, MAX_INTERVAL_SECS),
        ] {
            if value > max {
                return Err(ConfigError::TooLarge { name, max });
            }
        }
        if self.push_heartbeat_secs >= self.push_max_lifetime_secs {
            return Err(ConfigError::HeartbeatNotShorterThanLifetime {
                heartbeat_secs: self.push_heartbeat_secs,
                lifetime_secs: self.push_max_lifetime_secs,
            });
        }
        if self.max_body_bytes < MIN_BODY_BYTES {
            return Err(ConfigError::BodyLimitTooSmall);
        }
        let url = Url::parse(&self.crm_base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.crm_base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.crm_base_url.clone(),
                reason: "scheme must be http or https".to_string(),
            });
        }
        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let prefix = self.api_key_prefix.trim();
        let ttl = chrono::Duration::from_std(Duration::from_secs(
            self.session_ttl_secs.min(MAX_SESSION_TTL_SECS),
        ))
        .unwrap_or_else(|_| chrono::Duration::days(30));
        RuntimeConfig {
            crm: CrmConfig {
                base_url: self.crm_base_url.clone(),
                api_version: self.crm_api_version.clone(),
                timeout: Duration::from_secs(self.upstream_timeout_secs),
            },
            session: SessionPolicy {
                ttl,
                invalidate_on_failed_auth: self.invalidate_on_failed_auth,
                api_key_prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
                fallback_session_id: (!self.require_session_header)
                    .then(|| DEFAULT_SESSION_ID.to_string()),
            },
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_body_bytes: self.max_body_bytes,
            push_heartbeat: Duration::from_secs(self.push_heartbeat_secs),
            push_max_lifetime: Duration::from_secs(self.push_max_lifetime_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }
}
