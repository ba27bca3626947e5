//! Credential Store: verified upstream credentials keyed by session id.
//!
//! The store is the only shared mutable state in the gateway. Every
//! operation takes the store's lock exactly once, so a `get` that refreshes
//! `last_used` can never interleave with a `sweep` that evicts the same key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::auth::fingerprint;
use crate::clock::Clock;

/// Upstream credentials as accepted by the CRM probe.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    account_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

impl Credentials {
    /// Builds credentials, rejecting blank fields. Surrounding whitespace is trimmed.
    pub fn new(api_key: &str, account_id: &str) -> Result<Self, CredentialsError> {
        let api_key = api_key.trim();
        let account_id = account_id.trim();
        if api_key.is_empty() {
            return Err(CredentialsError::MissingField("api_key"));
        }
        if account_id.is_empty() {
            return Err(CredentialsError::MissingField("account_id"));
        }
        Ok(Self {
            api_key: api_key.to_string(),
            account_id: account_id.to_string(),
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn key_fingerprint(&self) -> String {
        fingerprint(&self.api_key)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = format!("<fp:{}>", self.key_fingerprint());
        f.debug_struct("Credentials")
            .field("api_key", &redacted)
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// One caller's cached, validated relationship with the upstream CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl SessionRecord {
    /// Expired once strictly more than `ttl` has passed since last use.
    /// A record exactly at the boundary is still live.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_used > ttl
    }

    /// Remaining lifetime, clamped at zero.
    pub fn expires_in(&self, now: DateTime<Utc>, ttl: Duration) -> Duration {
        let left = self.last_used + ttl - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session found for '{session_id}'")]
    NotFound { session_id: String },
}

/// Storage seam for sessions. Implementations must make each call atomic
/// with respect to concurrent calls on the same key.
pub trait CredentialStore: Send + Sync {
    /// Inserts or replaces the entry, stamping creation and last-used time.
    fn put(&self, session_id: &str, credentials: Credentials);

    /// Returns live credentials and refreshes `last_used`.
    fn get(&self, session_id: &str) -> Result<Credentials, SessionError>;

    /// Reads a live record without touching `last_used`.
    fn peek(&self, session_id: &str) -> Option<SessionRecord>;

    /// Drops an entry. Returns whether one existed.
    fn remove(&self, session_id: &str) -> bool;

    /// Removes every entry whose last use is more than `ttl` before `now`.
    /// Returns the number removed.
    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize;

    /// Number of stored entries, including any not yet swept.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedCredentialStore = Arc<dyn CredentialStore>;

/// Process-local store backed by a mutex-guarded map.
pub struct InMemoryCredentialStore {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(clock: Arc<dyn Clock>, ttl: Duration) -> SharedCredentialStore {
        Arc::new(Self::new(clock, ttl))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn put(&self, session_id: &str, credentials: Credentials) {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                credentials,
                created_at: now,
                last_used: now,
            },
        );
    }

    fn get(&self, session_id: &str) -> Result<Credentials, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let not_found = || SessionError::NotFound {
            session_id: session_id.to_string(),
        };

        match sessions.get_mut(session_id) {
            None => return Err(not_found()),
            Some(record) if !record.is_expired(now, self.ttl) => {
                // Concurrent refreshes may arrive out of order; never move backwards.
                record.last_used = record.last_used.max(now);
                return Ok(record.credentials.clone());
            }
            Some(_) => {}
        }
        sessions.remove(session_id);
        Err(not_found())
    }

    fn peek(&self, session_id: &str) -> Option<SessionRecord> {
        let now = self.clock.now();
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .filter(|record| !record.is_expired(now, self.ttl))
            .cloned()
    }

    fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id).is_some()
    }

    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired(now, ttl));
        before - sessions.len()
    }

    fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn creds(key: &str, account: &str) -> Credentials {
        Credentials::new(key, account).expect("credentials should be valid")
    }

    fn store_with_clock(ttl_secs: i64) -> (Arc<ManualClock>, InMemoryCredentialStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryCredentialStore::new(clock.clone(), Duration::seconds(ttl_secs));
        (clock, store)
    }

    #[test]
    fn credentials_reject_blank_fields() {
        assert_eq!(
            Credentials::new("  ", "loc-1").unwrap_err(),
            CredentialsError::MissingField("api_key")
        );
        assert_eq!(
            Credentials::new("pit-1", "").unwrap_err(),
            CredentialsError::MissingField("account_id")
        );
        let trimmed = creds(" pit-1 ", " loc-1 ");
        assert_eq!(trimmed.api_key(), "pit-1");
        assert_eq!(trimmed.account_id(), "loc-1");
    }

    #[test]
    fn credentials_debug_never_prints_the_key() {
        let rendered = format!("{:?}", creds("pit-super-secret", "loc-1"));
        assert!(!rendered.contains("pit-super-secret"));
        assert!(rendered.contains("loc-1"));
    }

    #[test]
    fn get_returns_stored_credentials_and_refreshes_last_used() {
        let (clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-a", "loc-1"));
        let created = store.peek("s1").expect("record").created_at;

        clock.advance(Duration::seconds(30));
        let got = store.get("s1").expect("session should resolve");
        assert_eq!(got, creds("pit-a", "loc-1"));

        let record = store.peek("s1").expect("record");
        assert_eq!(record.created_at, created);
        assert_eq!(record.last_used, created + Duration::seconds(30));
    }

    #[test]
    fn get_on_unknown_session_is_not_found() {
        let (_clock, store) = store_with_clock(3600);
        assert_eq!(
            store.get("missing").unwrap_err(),
            SessionError::NotFound {
                session_id: "missing".to_string()
            }
        );
    }

    #[test]
    fn put_replaces_existing_entry() {
        let (clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-old", "loc-1"));
        clock.advance(Duration::seconds(10));
        store.put("s1", creds("pit-new", "loc-2"));

        let record = store.peek("s1").expect("record");
        assert_eq!(record.credentials, creds("pit-new", "loc-2"));
        assert_eq!(record.created_at, clock.now());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ttl_boundary_is_inclusive_of_exactly_ttl() {
        let (clock, store) = store_with_clock(60);
        store.put("s1", creds("pit-a", "loc-1"));

        clock.advance(Duration::seconds(60));
        assert!(store.get("s1").is_ok(), "exactly at ttl is still live");

        clock.advance(Duration::seconds(60) + Duration::milliseconds(1));
        assert!(store.get("s1").is_err(), "past ttl is expired");
        assert!(store.is_empty(), "expired entry is evicted lazily");
    }

    #[test]
    fn sweep_removes_only_stale_entries_and_is_idempotent() {
        let (clock, store) = store_with_clock(3600);
        let ttl = Duration::seconds(3600);
        store.put("stale", creds("pit-a", "loc-1"));
        clock.advance(Duration::seconds(1800));
        store.put("fresh", creds("pit-b", "loc-2"));
        clock.advance(Duration::seconds(1801));

        let now = clock.now();
        assert_eq!(store.sweep(now, ttl), 1);
        assert_eq!(store.sweep(now, ttl), 0);
        assert!(store.peek("fresh").is_some());
        assert!(store.peek("stale").is_none());
    }

    #[test]
    fn sweep_keeps_entry_exactly_at_boundary() {
        let (clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-a", "loc-1"));
        let at_boundary = clock.now() + Duration::seconds(3600);
        assert_eq!(store.sweep(at_boundary, Duration::seconds(3600)), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn last_used_never_moves_backwards() {
        let (clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-a", "loc-1"));
        clock.advance(Duration::seconds(100));
        store.get("s1").expect("resolve");
        let later = store.peek("s1").expect("record").last_used;

        clock.advance(Duration::seconds(-50));
        store.get("s1").expect("resolve");
        assert_eq!(store.peek("s1").expect("record").last_used, later);
    }

    #[test]
    fn remove_reports_presence() {
        let (_clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-a", "loc-1"));
        assert!(store.remove("s1"));
        assert!(!store.remove("s1"));
    }

    #[test]
    fn peek_does_not_refresh() {
        let (clock, store) = store_with_clock(3600);
        store.put("s1", creds("pit-a", "loc-1"));
        let stamped = store.peek("s1").expect("record").last_used;
        clock.advance(Duration::seconds(5));
        assert_eq!(store.peek("s1").expect("record").last_used, stamped);
    }

    #[test]
    fn expires_in_clamps_at_zero() {
        let now = Utc::now();
        let record = SessionRecord {
            credentials: creds("pit-a", "loc-1"),
            created_at: now,
            last_used: now,
        };
        let ttl = Duration::seconds(60);
        assert_eq!(record.expires_in(now, ttl), ttl);
        assert_eq!(
            record.expires_in(now + Duration::seconds(120), ttl),
            Duration::zero()
        );
    }
}
