//! # Zerogate (Zero-Trust Access Gateway)
//!
//! `zerogate` sits in front of internal services and decides, per request,
//! how much the caller is trusted. Handlers are mounted in nested trust
//! scopes and every scope adds one filter to the chain of its parent:
//!
//! | Scope | Adds |
//! |---|---|
//! | base | request ids, tracing, rate limiting, request counting, panic recovery |
//! | db | a request-scoped store handle with a bounded timeout |
//! | session | session resolution from the cookie or bearer token |
//! | authenticated | requires a `fully_authenticated` session |
//! | csrf | requires the session's anti-forgery token |
//!
//! A request that fails a filter never reaches the handler, and an unmatched
//! path is answered with 404 before any scope filter runs.
//!
//! ## Secondary factors
//!
//! A password moves a session to `primary`. A challenge answered by a
//! registered factor moves it to `fully_authenticated`, exactly once per
//! challenge:
//!
//! - **Hardware keys** sign a U2F-style payload with a monotonic counter.
//! - **SSH keys** sign with `SSHSIG` and, once approved from a browser
//!   session, receive short-lived certificates from the gateway CA.
//! - **Linked accounts** are external identities holding an Ed25519 key,
//!   enrolled through a single-use association token.
//!
//! ## Storage
//!
//! State lives behind the [`store::Store`] trait: Postgres (`sql/schema.sql`)
//! in production, an in-memory store for development and tests. Single use of
//! challenges and tokens relies on compare-and-set updates in the store.

pub mod api;
pub mod cli;
pub mod error;
pub mod factor;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result, ensure};
    use std::{fs, path::PathBuf};

    // Normalize SQL to avoid brittle formatting checks in schema tests.
    fn canonicalize_sql(sql: &str) -> String {
        sql.chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_lowercase())
            .collect()
    }

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn schema_sql_defines_every_table() -> Result<()> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("sql/schema.sql");
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read SQL file at {}", path.display()))?;
        let canonical = canonicalize_sql(&sql);
        for table in [
            "users",
            "sessions",
            "factors",
            "challenges",
            "association_tokens",
        ] {
            ensure!(
                canonical.contains(&format!("createtableifnotexists{table}(")),
                "table {table} is missing in {}",
                path.display()
            );
        }
        Ok(())
    }
}
