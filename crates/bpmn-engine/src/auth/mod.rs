//! Auth Gateway (C10): API-key validation, IP allow-lists, rate limiting,
//! and audit logging for every externally-reachable operation.

pub mod access;
pub mod api_key;

pub use access::{ApiKeyRecord, AuditEntry, AuditOutcome, AuthGateway, CidrBlock, Permission};
pub use api_key::{generate_api_key, hash_api_key, is_valid_api_key_format, GeneratedApiKey, API_KEY_PREFIX};
