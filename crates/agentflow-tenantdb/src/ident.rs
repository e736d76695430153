// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier safety and deterministic tenant naming.
//!
//! Every database, table, and column name that reaches string-concatenated
//! SQL passes [`is_safe_identifier`] and is backtick-quoted; string
//! literals go through [`escape_literal`]. A failed check surfaces
//! `InvalidInput` before any SQL is issued.

use agentflow_core::CoreError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;

/// Longest identifier MySQL accepts for schema objects.
const MAX_DB_NAME_LEN: usize = 63;
/// Longest identifier MySQL accepts for user names.
const MAX_USER_NAME_LEN: usize = 32;

/// Whether a value is safe to splice into SQL as an identifier.
///
/// Accepts only non-empty ASCII alphanumerics and underscore.
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Backtick-quote an identifier after the safety check.
pub fn quote_ident(value: &str) -> Result<String, CoreError> {
    if !is_safe_identifier(value) {
        return Err(CoreError::invalid_input(
            "identifier",
            format!("'{}' contains characters outside [A-Za-z0-9_]", value),
        ));
    }
    Ok(format!("`{}`", value))
}

/// Escape a string literal for splicing into single quotes.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn hex_tail(workspace_id: &str, len: usize) -> String {
    workspace_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(len)
        .collect()
}

/// Deterministic tenant database name: `ws_<hex32>`, at most 63 chars.
pub fn tenant_db_name(workspace_id: &str) -> String {
    let name = format!("ws_{}", hex_tail(workspace_id, 32));
    name.chars().take(MAX_DB_NAME_LEN).collect()
}

/// Deterministic tenant database user: `wsu_<hex28>`, at most 32 chars.
pub fn tenant_db_user(workspace_id: &str) -> String {
    let name = format!("wsu_{}", hex_tail(workspace_id, 28));
    name.chars().take(MAX_USER_NAME_LEN).collect()
}

/// Sibling backup database name: `wsb_<hex32>_<yyyymmddhhmmss>`.
pub fn backup_db_name(workspace_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "wsb_{}_{}",
        hex_tail(workspace_id, 32),
        at.format("%Y%m%d%H%M%S")
    )
}

/// Generate a tenant database password: 18 random bytes, base64-url.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("ws_abc123"));
        assert!(is_safe_identifier("workspace_db_migrations"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("ws-abc"));
        assert!(!is_safe_identifier("ws abc"));
        assert!(!is_safe_identifier("ws`abc"));
        assert!(!is_safe_identifier("ws;drop"));
        assert!(!is_safe_identifier("wsé"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("ws_abc").unwrap(), "`ws_abc`");
        let err = quote_ident("ws`; DROP").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("plain"), "plain");
        assert_eq!(escape_literal("o'brien"), "o\\'brien");
        assert_eq!(escape_literal("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_tenant_names_deterministic_and_bounded() {
        let workspace_id = "0123456789abcdef0123456789abcdef";

        let db = tenant_db_name(workspace_id);
        assert_eq!(db, format!("ws_{}", workspace_id));
        assert!(db.len() <= 63);
        assert!(is_safe_identifier(&db));

        let user = tenant_db_user(workspace_id);
        assert_eq!(user, format!("wsu_{}", &workspace_id[..28]));
        assert!(user.len() <= 32);
        assert!(is_safe_identifier(&user));

        // Same input, same names.
        assert_eq!(db, tenant_db_name(workspace_id));
        assert_eq!(user, tenant_db_user(workspace_id));
    }

    #[test]
    fn test_backup_name_format() {
        let at = DateTime::parse_from_rfc3339("2025-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = backup_db_name("0123456789abcdef0123456789abcdef", at);
        assert_eq!(name, "wsb_0123456789abcdef0123456789abcdef_20250304050607");
        assert!(is_safe_identifier(&name));
    }

    #[test]
    fn test_generated_password_shape() {
        let password = generate_password();
        // 18 bytes -> 24 base64 chars, no padding.
        assert_eq!(password.len(), 24);
        assert!(!password.contains('='));
        assert_ne!(password, generate_password());
    }
}
