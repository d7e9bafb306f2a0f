//! Per-scan decision list and the store-backed authorisation and enrolment
//! steps it leads to.

use anyhow::Result;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::store::{TokenRecord, TokenStore, LAST_SCANNED_AT, LAST_SCANNED_TOKEN};

/// Mode flags observed when a card is read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanContext {
    pub is_master: bool,
    pub locked: bool,
    pub master_mode: bool,
    pub engaged: bool,
    pub enrolment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ToggleMaster,
    IgnoreLocked,
    IgnoreMasterMode,
    IgnoreEngaged,
    Enrol,
    Evaluate,
}

/// Earlier rules pre-empt later ones.
pub fn decide(ctx: ScanContext) -> Decision {
    if ctx.is_master {
        Decision::ToggleMaster
    } else if ctx.locked {
        Decision::IgnoreLocked
    } else if ctx.master_mode {
        Decision::IgnoreMasterMode
    } else if ctx.engaged {
        Decision::IgnoreEngaged
    } else if ctx.enrolment {
        Decision::Enrol
    } else {
        Decision::Evaluate
    }
}

pub fn is_master_token(card_id: &str, master: Option<&str>) -> bool {
    master.is_some_and(|m| m.eq_ignore_ascii_case(card_id))
}

// ---------------------------------------------------------------------------
// Authorisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted(TokenRecord),
    Denied(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Unknown,
    Inactive,
    Barred,
    StoreError,
}

/// Fails closed: a lookup error is a denial.
pub async fn authorize<S: TokenStore>(store: &S, card_id: &str) -> Authorization {
    match store.get_token(card_id).await {
        Ok(Some(t)) if t.is_usable() => Authorization::Granted(t),
        Ok(Some(t)) if t.barred => Authorization::Denied(DenyReason::Barred),
        Ok(Some(_)) => Authorization::Denied(DenyReason::Inactive),
        Ok(None) => Authorization::Denied(DenyReason::Unknown),
        Err(e) => {
            warn!(card = %card_id, "policy: token lookup failed, denying: {e:#}");
            Authorization::Denied(DenyReason::StoreError)
        }
    }
}

// ---------------------------------------------------------------------------
// Enrolment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrolOutcome {
    Created,
    AlreadyKnown,
}

/// Capture an unseen card as a pending placeholder and publish it as the
/// last scanned card. Known cards are left untouched.
pub async fn enrol<S: TokenStore>(
    store: &S,
    card_id: &str,
    now: OffsetDateTime,
) -> Result<EnrolOutcome> {
    if store.get_token(card_id).await?.is_some() {
        info!(card = %card_id, "policy: enrolment scan of known card, left as is");
        return Ok(EnrolOutcome::AlreadyKnown);
    }

    store.create_pending_token(card_id).await?;
    info!(card = %card_id, "policy: pending token created");

    store.set_setting(LAST_SCANNED_TOKEN, card_id).await?;
    store
        .set_setting(LAST_SCANNED_AT, &now.format(&Rfc3339)?)
        .await?;
    Ok(EnrolOutcome::Created)
}

// ===========================================================================
// Tests
// ===========================================================================
