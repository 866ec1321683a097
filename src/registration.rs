//! PIN-driven registration engine (spec.md §2 component D, §4.D).
//!
//! The console-side exchange itself (the actual PIN-authenticated key
//! agreement) is a black box here — this crate's job is the canonicalised
//! output shape and the bounded-attempt, event-callback contract around it.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::credentials::{canonicalize_regkey, ConsoleRegistration, MORNING_LEN};
use crate::error::Error;
use crate::target::ConsoleTarget;

/// Classification of a failed registration attempt (spec.md §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationFailure {
    PinIncorrect,
    NetworkRefused,
    ProtocolError,
}

/// Data delivered on a successful PIN exchange, before canonicalisation.
#[derive(Debug, Clone)]
pub struct RawRegistrationResult {
    pub server_nickname: String,
    /// Either 8 ASCII-hex bytes or 4 raw binary bytes; see
    /// [`canonicalize_regkey`].
    pub rp_regist_key: Vec<u8>,
    pub rp_key: [u8; MORNING_LEN],
    pub console_pin: String,
}

/// Events delivered to the registration callback (spec.md §4.D).
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    PinRequest,
    Success(ConsoleRegistration),
    Failed(RegistrationFailure),
    Cancelled,
}

/// The console-facing half of the PIN exchange. Implementations perform the
/// actual network conversation; this crate only canonicalises and bounds
/// the attempt.
#[async_trait]
pub trait RegistrationTransport: Send + Sync {
    async fn exchange(&self, console_ip: &str, pin: &str) -> Result<RawRegistrationResult, Error>;
}

/// Bounds registration attempts and canonicalises successful results
/// (spec.md §4.D, §5 "registration attempt cap").
pub struct RegistrationEngine<T: RegistrationTransport> {
    transport: T,
    attempt_cap: u32,
    attempts: AtomicU32,
    cancelled: std::sync::atomic::AtomicBool,
}

impl<T: RegistrationTransport> RegistrationEngine<T> {
    pub fn new(transport: T, attempt_cap: u32) -> Self {
        Self {
            transport,
            attempt_cap,
            attempts: AtomicU32::new(0),
            cancelled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Cooperative, bounded cancellation: sets a flag observed before the
    /// next attempt starts (an in-flight transport call is not interrupted;
    /// the engine simply declines to retry).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Runs the PIN exchange, retrying network/protocol failures up to the
    /// attempt cap. A `PinIncorrect` failure is not retried — it requires a
    /// fresh PIN from the user, so it is reported immediately.
    pub async fn register(
        &self,
        console_ip: &str,
        target: ConsoleTarget,
        rp_key_type: u8,
        pin: &str,
        account_id_b64: &str,
    ) -> RegistrationEvent {
        if self.cancelled.load(Ordering::SeqCst) {
            return RegistrationEvent::Cancelled;
        }

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return RegistrationEvent::Cancelled;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            match self.transport.exchange(console_ip, pin).await {
                Ok(raw) => {
                    return match self.canonicalise(console_ip, target, rp_key_type, raw, account_id_b64) {
                        Ok(record) => RegistrationEvent::Success(record),
                        Err(_) => RegistrationEvent::Failed(RegistrationFailure::ProtocolError),
                    };
                }
                Err(err) if err.kind == crate::error::ErrorKind::AuthFailed => {
                    return RegistrationEvent::Failed(RegistrationFailure::PinIncorrect);
                }
                Err(err) if err.kind == crate::error::ErrorKind::Network => {
                    if attempt >= self.attempt_cap {
                        return RegistrationEvent::Failed(RegistrationFailure::NetworkRefused);
                    }
                    continue;
                }
                Err(_) => {
                    if attempt >= self.attempt_cap {
                        return RegistrationEvent::Failed(RegistrationFailure::ProtocolError);
                    }
                    continue;
                }
            }
        }
    }

    fn canonicalise(
        &self,
        console_ip: &str,
        target: ConsoleTarget,
        rp_key_type: u8,
        raw: RawRegistrationResult,
        account_id_b64: &str,
    ) -> Result<ConsoleRegistration, Error> {
        let regkey_hex8 = canonicalize_regkey(&raw.rp_regist_key)?;
        ConsoleRegistration::new(
            console_ip,
            raw.server_nickname,
            target,
            rp_key_type,
            regkey_hex8,
            raw.rp_key,
            account_id_b64,
            true,
            true,
        )
    }
}
