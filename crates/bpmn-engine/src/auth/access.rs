//! Auth Gateway (C10): API-key validation, IP/CIDR allow-lists, sliding-window
//! rate limiting, and an in-memory audit trail. Invoked once per external
//! call, before the request reaches any other component.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::api_key::hash_api_key;
use crate::error::AuthError;
use crate::model::RateCounter;
use crate::store::{StoreTransaction, TokenStore};

/// Permission taxonomy (§6 "Permissions"). Every external operation maps to
/// exactly one of these; a key missing the required permission is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Process,
    Bpmn,
    Job,
    Timer,
    Message,
    Expression,
    Incident,
    Storage,
    System,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Process => "process",
            Permission::Bpmn => "bpmn",
            Permission::Job => "job",
            Permission::Timer => "timer",
            Permission::Message => "message",
            Permission::Expression => "expression",
            Permission::Incident => "incident",
            Permission::Storage => "storage",
            Permission::System => "system",
        }
    }
}

/// A single IPv4 CIDR block, e.g. `10.0.0.0/8`. The engine's deployment
/// target is a single-node service behind IPv4 ingress; IPv6 callers are
/// matched only by exact address equality against the "ip/32"-style entries.
#[derive(Debug, Clone, Copy)]
pub struct CidrBlock {
    addr: Ipv4Addr,
    prefix_len: u32,
}

impl CidrBlock {
    pub fn parse(text: &str) -> Option<Self> {
        let (addr_part, prefix_part) = match text.split_once('/') {
            Some((a, p)) => (a, p),
            None => (text, "32"),
        };
        let addr: Ipv4Addr = addr_part.parse().ok()?;
        let prefix_len: u32 = prefix_part.parse().ok()?;
        if prefix_len > 32 {
            return None;
        }
        Some(Self { addr, prefix_len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let IpAddr::V4(candidate) = ip else { return false };
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix_len);
        u32::from(candidate) & mask == u32::from(self.addr) & mask
    }
}

/// One configured key's validation record. The engine never issues or
/// revokes keys through an HTTP surface itself — keys are part of process
/// configuration (§9 Config), loaded once at startup.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub label: String,
    pub permissions: Vec<Permission>,
    /// Empty means "no per-key restriction beyond the global allow-list".
    pub ip_allowlist: Vec<CidrBlock>,
    pub requests_per_minute: u32,
}

impl ApiKeyRecord {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Debug, Clone)]
pub enum AuditOutcome {
    Success,
    InvalidKey,
    IpBlocked,
    RateLimited,
    InsufficientPermissions,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub key_label: Option<String>,
    pub client_ip: IpAddr,
    pub permission: Permission,
    pub outcome: AuditOutcome,
}

const AUDIT_RING_CAPACITY: usize = 512;
const RATE_WINDOW: Duration = Duration::seconds(60);

pub struct AuthGateway {
    store: Arc<dyn TokenStore>,
    keys: Vec<ApiKeyRecord>,
    global_allowlist: Vec<CidrBlock>,
    audit: Mutex<VecDeque<AuditEntry>>,
}

impl AuthGateway {
    pub fn new(store: Arc<dyn TokenStore>, keys: Vec<ApiKeyRecord>, global_allowlist: Vec<CidrBlock>) -> Self {
        Self { store, keys, global_allowlist, audit: Mutex::new(VecDeque::with_capacity(AUDIT_RING_CAPACITY)) }
    }

    /// Validate `api_key` from `client_ip` against `permission`. On success,
    /// also books one request against the key's sliding-window rate budget.
    pub async fn authorize(&self, api_key: &str, client_ip: IpAddr, permission: Permission) -> Result<(), AuthError> {
        if !client_ip.is_loopback() && !self.global_allowlist.is_empty() {
            if !self.global_allowlist.iter().any(|c| c.contains(client_ip)) {
                self.record(None, client_ip, permission, AuditOutcome::IpBlocked);
                tracing::warn!(%client_ip, "auth: client ip blocked by global allow-list");
                return Err(AuthError::IpBlocked);
            }
        }

        let hash = hash_api_key(api_key);
        let Some(record) = self.keys.iter().find(|k| k.key_hash == hash) else {
            self.record(None, client_ip, permission, AuditOutcome::InvalidKey);
            tracing::warn!(%client_ip, "auth: invalid api key presented");
            return Err(AuthError::InvalidApiKey);
        };

        if !client_ip.is_loopback() && !record.ip_allowlist.is_empty() && !record.ip_allowlist.iter().any(|c| c.contains(client_ip)) {
            self.record(Some(record.label.clone()), client_ip, permission, AuditOutcome::IpBlocked);
            tracing::warn!(key = %record.label, %client_ip, "auth: client ip blocked by key allow-list");
            return Err(AuthError::IpBlocked);
        }

        if !record.has_permission(permission) {
            self.record(Some(record.label.clone()), client_ip, permission, AuditOutcome::InsufficientPermissions);
            tracing::warn!(key = %record.label, permission = permission.as_str(), "auth: key lacks required permission");
            return Err(AuthError::InsufficientPermissions(permission.as_str().to_string()));
        }

        if !self.admit_rate(&record.key_hash, record.requests_per_minute).await.map_err(|_| AuthError::RateLimited)? {
            self.record(Some(record.label.clone()), client_ip, permission, AuditOutcome::RateLimited);
            tracing::warn!(key = %record.label, "auth: rate limit exceeded");
            return Err(AuthError::RateLimited);
        }

        self.record(Some(record.label.clone()), client_ip, permission, AuditOutcome::Success);
        tracing::info!(key = %record.label, permission = permission.as_str(), "auth: request admitted");
        Ok(())
    }

    /// Returns `Ok(true)` if the request is within budget, `Ok(false)` if the
    /// window is exhausted. The counter is persisted so a restart doesn't
    /// hand callers a fresh budget mid-window.
    async fn admit_rate(&self, identifier: &str, limit: u32) -> Result<bool, crate::error::StoreError> {
        let now = Utc::now();
        let mut counter = self.store.load_rate_counter(identifier).await?.unwrap_or_else(|| RateCounter {
            identifier: identifier.to_string(),
            count: 0,
            reset_at: now + RATE_WINDOW,
        });

        if now >= counter.reset_at {
            counter.count = 0;
            counter.reset_at = now + RATE_WINDOW;
        }

        if counter.count >= limit {
            self.store.commit(StoreTransaction::new().put_rate_counter(counter)).await?;
            return Ok(false);
        }

        counter.count += 1;
        self.store.commit(StoreTransaction::new().put_rate_counter(counter)).await?;
        Ok(true)
    }

    fn record(&self, key_label: Option<String>, client_ip: IpAddr, permission: Permission, outcome: AuditOutcome) {
        let mut ring = self.audit.lock();
        if ring.len() == AUDIT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(AuditEntry { at: Utc::now(), key_label, client_ip, permission, outcome });
    }

    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        let ring = self.audit.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;

    fn gateway(keys: Vec<ApiKeyRecord>, allowlist: Vec<CidrBlock>) -> AuthGateway {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        AuthGateway::new(store, keys, allowlist)
    }

    fn sample_key(limit: u32) -> (String, ApiKeyRecord) {
        let generated = super::super::api_key::generate_api_key();
        let record = ApiKeyRecord {
            key_hash: generated.key_hash.clone(),
            label: "test-key".into(),
            permissions: vec![Permission::Process],
            ip_allowlist: Vec::new(),
            requests_per_minute: limit,
        };
        (generated.key, record)
    }

    #[tokio::test]
    async fn valid_key_with_permission_is_admitted() {
        let (key, record) = sample_key(10);
        let gw = gateway(vec![record], Vec::new());
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        assert!(gw.authorize(&key, ip, Permission::Process).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let gw = gateway(Vec::new(), Vec::new());
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let err = gw.authorize("evr_bogus", ip, Permission::Process).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidApiKey);
    }

    #[tokio::test]
    async fn missing_permission_is_rejected() {
        let (key, record) = sample_key(10);
        let gw = gateway(vec![record], Vec::new());
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let err = gw.authorize(&key, ip, Permission::Job).await.unwrap_err();
        assert!(matches!(err, AuthError::InsufficientPermissions(_)));
    }

    #[tokio::test]
    async fn global_allowlist_blocks_unlisted_ip() {
        let (key, record) = sample_key(10);
        let allowlist = vec![CidrBlock::parse("198.51.100.0/24").unwrap()];
        let gw = gateway(vec![record], allowlist);
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let err = gw.authorize(&key, ip, Permission::Process).await.unwrap_err();
        assert_eq!(err, AuthError::IpBlocked);
    }

    #[tokio::test]
    async fn loopback_always_bypasses_ip_allowlist() {
        let (key, record) = sample_key(10);
        let allowlist = vec![CidrBlock::parse("198.51.100.0/24").unwrap()];
        let gw = gateway(vec![record], allowlist);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(gw.authorize(&key, ip, Permission::Process).await.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_trips_after_budget_exhausted() {
        let (key, record) = sample_key(2);
        let gw = gateway(vec![record], Vec::new());
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        assert!(gw.authorize(&key, ip, Permission::Process).await.is_ok());
        assert!(gw.authorize(&key, ip, Permission::Process).await.is_ok());
        let err = gw.authorize(&key, ip, Permission::Process).await.unwrap_err();
        assert_eq!(err, AuthError::RateLimited);
    }

    #[test]
    fn cidr_block_matches_only_within_range() {
        let block = CidrBlock::parse("10.0.0.0/24").unwrap();
        assert!(block.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42))));
        assert!(!block.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 42))));
    }
}
