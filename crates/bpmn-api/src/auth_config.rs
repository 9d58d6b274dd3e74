//! Loads the initial API-key set and global IP allow-list the auth gateway
//! starts with. Keys are server configuration, not a managed resource this
//! surface issues or revokes — mirrors the teacher's `AuthConfig::from_env`.

use bpmn_engine::auth::{generate_api_key, hash_api_key, ApiKeyRecord, CidrBlock, Permission};

const ALL_PERMISSIONS: [Permission; 9] = [
    Permission::Process,
    Permission::Bpmn,
    Permission::Job,
    Permission::Timer,
    Permission::Message,
    Permission::Expression,
    Permission::Incident,
    Permission::Storage,
    Permission::System,
];

/// `BPMN_API_KEY` (full access) plus an optional `BPMN_IP_ALLOWLIST`
/// (comma-separated CIDRs). If no key is configured, one is generated and
/// logged once — convenient for local development, not for production use.
pub fn load_from_env() -> (Vec<ApiKeyRecord>, Vec<CidrBlock>) {
    let key_hash = match std::env::var("BPMN_API_KEY") {
        Ok(key) if !key.is_empty() => {
            tracing::info!("auth: using configured API key");
            hash_api_key(&key)
        }
        _ => {
            let generated = generate_api_key();
            tracing::warn!(key = %generated.key, "auth: no BPMN_API_KEY set, generated one for this run only");
            generated.key_hash
        }
    };

    let requests_per_minute: u32 = std::env::var("BPMN_API_KEY_RPM").ok().and_then(|v| v.parse().ok()).unwrap_or(600);

    let global_allowlist = std::env::var("BPMN_IP_ALLOWLIST")
        .ok()
        .map(|v| v.split(',').filter_map(|s| CidrBlock::parse(s.trim())).collect())
        .unwrap_or_default();

    let record = ApiKeyRecord {
        key_hash,
        label: "default".to_string(),
        permissions: ALL_PERMISSIONS.to_vec(),
        ip_allowlist: Vec::new(),
        requests_per_minute,
    };

    (vec![record], global_allowlist)
}
