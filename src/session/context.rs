//! The per-attempt frozen snapshot (spec.md §3 `SessionContext`, §9 "Frozen
//! account identifier" design note).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::target::ConsoleTarget;

/// A counted freeze token: `freeze()` increments, `unfreeze()` decrements,
/// and a background refresher is expected to call [`FreezeToken::is_frozen`]
/// before rewriting the value it guards, skipping the refresh while the
/// count is above zero. Re-entrant by construction — nested freezes from
/// different callers compose without extra bookkeeping.
#[derive(Debug, Default)]
pub struct FreezeToken(AtomicU32);

impl FreezeToken {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn freeze(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unfreeze(&self) {
        self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
            Some(count.saturating_sub(1))
        })
        .ok();
    }

    pub fn is_frozen(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Per-attempt frozen snapshot of volatile inputs, notably the account id
/// (spec.md §3, §4.F step 2).
///
/// **Invariant:** while `session_active`, the account-id fields never
/// change regardless of any external refresher — enforced by
/// [`FreezeToken`], which the caller's background refresher is expected to
/// consult.
pub struct SessionContext {
    pub console_ip: String,
    pub regkey_hex8: String,
    pub discovered_port: Option<u16>,
    account_id_raw: [u8; 8],
    account_id_hex: String,
    account_id_b64: String,
    pub frozen_at: Instant,
    freeze_token: FreezeToken,
    session_active: std::sync::atomic::AtomicBool,
    pub target: ConsoleTarget,
}

impl SessionContext {
    /// Creates the context and immediately freezes the account id
    /// (spec.md §4.F step 2: "Freeze any background refresher").
    pub fn new(
        console_ip: impl Into<String>,
        regkey_hex8: impl Into<String>,
        account_id_raw: [u8; 8],
        account_id_b64: impl Into<String>,
        target: ConsoleTarget,
    ) -> Self {
        let freeze_token = FreezeToken::new();
        freeze_token.freeze();
        Self {
            console_ip: console_ip.into(),
            regkey_hex8: regkey_hex8.into(),
            discovered_port: None,
            account_id_raw,
            account_id_hex: hex::encode(account_id_raw),
            account_id_b64: account_id_b64.into(),
            frozen_at: Instant::now(),
            freeze_token,
            session_active: std::sync::atomic::AtomicBool::new(true),
            target,
        }
    }

    pub fn account_id_raw(&self) -> [u8; 8] {
        self.account_id_raw
    }

    pub fn account_id_hex(&self) -> &str {
        &self.account_id_hex
    }

    pub fn account_id_b64(&self) -> &str {
        &self.account_id_b64
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_token.is_frozen()
    }

    pub fn is_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    /// Destroys the context: releases the freeze and marks it inactive.
    /// Idempotent (spec.md §4.F: "destroyed on success/failure/cancel, at
    /// which point the frozen flag is released").
    pub fn destroy(&self) {
        if self
            .session_active
            .swap(false, Ordering::SeqCst)
        {
            self.freeze_token.unfreeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_token_n_freezes_then_n_unfreezes_restores_refreshable_state() {
        let token = FreezeToken::new();
        for _ in 0..5 {
            token.freeze();
        }
        assert!(token.is_frozen());
        for _ in 0..4 {
            token.unfreeze();
        }
        assert!(token.is_frozen());
        token.unfreeze();
        assert!(!token.is_frozen());
    }

    #[test]
    fn new_context_is_frozen_and_active() {
        let ctx = SessionContext::new(
            "192.168.1.100",
            "8830739c",
            [1, 2, 3, 4, 5, 6, 7, 8],
            "nD1Ho0mY7wY=",
            ConsoleTarget::Ps5V1,
        );
        assert!(ctx.is_frozen());
        assert!(ctx.is_active());
    }

    #[test]
    fn destroy_releases_freeze_and_is_idempotent() {
        let ctx = SessionContext::new(
            "192.168.1.100",
            "8830739c",
            [1, 2, 3, 4, 5, 6, 7, 8],
            "nD1Ho0mY7wY=",
            ConsoleTarget::Ps5V1,
        );
        ctx.destroy();
        assert!(!ctx.is_frozen());
        assert!(!ctx.is_active());
        ctx.destroy();
        assert!(!ctx.is_frozen());
    }

    #[test]
    fn account_id_hex_is_derived_from_raw() {
        let ctx = SessionContext::new(
            "192.168.1.100",
            "8830739c",
            [0x88, 0x30, 0x73, 0x9c, 0, 0, 0, 0],
            "nD1Ho0mY7wY=",
            ConsoleTarget::Ps5V1,
        );
        assert_eq!(ctx.account_id_hex(), "8830739c00000000");
    }
}
