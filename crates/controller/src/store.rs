//! Record-store capability used by the access-control loop.
//!
//! The loop only ever needs a handful of one-shot operations, so they are
//! exposed as a trait: [`crate::db::Db`] implements it over SQLite, tests use
//! an in-memory fake.

#![allow(async_fn_in_trait)]

use anyhow::Result;
use time::OffsetDateTime;

/// Settings key: `"1"` turns enrolment (scan) mode on.
pub const SCAN_MODE: &str = "scan_mode";
/// Settings key: fallback master token when neither env nor config set one.
pub const MASTER_TOKEN_ID: &str = "master_token_id";
/// Settings key: id of the last card captured in enrolment mode.
pub const LAST_SCANNED_TOKEN: &str = "last_scanned_token";
/// Settings key: RFC 3339 time of that capture.
pub const LAST_SCANNED_AT: &str = "last_scanned_at";

/// Usage-log category recorded for every authorised activation.
pub const USAGE_CATEGORY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token_id: String,
    pub name: String,
    pub active: bool,
    pub barred: bool,
}

impl TokenRecord {
    /// A token opens the machine only when active and not barred.
    pub fn is_usable(&self) -> bool {
        self.active && !self.barred
    }
}

pub trait TokenStore {
    async fn get_token(&self, token_id: &str) -> Result<Option<TokenRecord>>;

    async fn log_usage(&self, token_id: &str, category: &str, at: OffsetDateTime) -> Result<()>;

    /// Time of the newest usage-log row, if any.
    async fn last_usage_at(&self) -> Result<Option<OffsetDateTime>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Insert a disabled, barred placeholder. No-op when the id exists.
    async fn create_pending_token(&self, token_id: &str) -> Result<()>;
}
