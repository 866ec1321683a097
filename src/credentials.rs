//! Persistent registration records and the credential-store contract
//! (spec.md §3 `ConsoleRegistration`, §4.D canonicalisation rule, §6).
//!
//! Persistence itself is out of scope for this crate (spec.md §1); only the
//! record shape and the store's load/save contract are specified here.

use async_trait::async_trait;
use base64::Engine;

use crate::error::Error;
use crate::target::ConsoleTarget;

/// Length of the canonical hex regkey string (spec.md §3 `regkey_hex8`).
pub const REGKEY_HEX_LEN: usize = 8;
/// Length of the decoded regkey (spec.md §3 `regkey_raw4`).
pub const REGKEY_RAW_LEN: usize = 4;
/// Length of the morning key (spec.md §3 `morning`).
pub const MORNING_LEN: usize = 16;
/// Length of the base64-encoded account id string (spec.md §3 `account_id_b64`).
pub const ACCOUNT_ID_B64_LEN: usize = 14;
/// Length of the decoded account id (spec.md §3 `account_id_le8`).
pub const ACCOUNT_ID_RAW_LEN: usize = 8;

/// The persistent credential record produced by a successful registration.
///
/// **Invariant:** if `is_registered`, every hex/base64 field decodes cleanly
/// to its declared raw length, and `regkey_raw4`/`account_id_le8` are exactly
/// the decode of `regkey_hex8`/`account_id_b64` — construction goes through
/// [`ConsoleRegistration::new`], which enforces this, so a live value of this
/// type is never inconsistent.
#[derive(Debug, Clone)]
pub struct ConsoleRegistration {
    pub console_ip: String,
    pub console_name: String,
    pub target: ConsoleTarget,
    pub rp_key_type: u8,
    regkey_hex8: String,
    regkey_raw4: [u8; REGKEY_RAW_LEN],
    pub morning: [u8; MORNING_LEN],
    account_id_b64: String,
    account_id_le8: [u8; ACCOUNT_ID_RAW_LEN],
    pub is_valid: bool,
    pub is_registered: bool,
}

impl ConsoleRegistration {
    /// Builds a registration record, validating and decoding `regkey_hex8`
    /// and `account_id_b64` once up front so every other accessor is
    /// infallible.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        console_ip: impl Into<String>,
        console_name: impl Into<String>,
        target: ConsoleTarget,
        rp_key_type: u8,
        regkey_hex8: impl Into<String>,
        morning: [u8; MORNING_LEN],
        account_id_b64: impl Into<String>,
        is_valid: bool,
        is_registered: bool,
    ) -> Result<Self, Error> {
        let regkey_hex8 = regkey_hex8.into();
        let account_id_b64 = account_id_b64.into();

        if console_name.len() > 64 {
            return Err(Error::invalid_param("console_name must be <= 64 chars"));
        }
        if regkey_hex8.len() != REGKEY_HEX_LEN || !regkey_hex8.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::invalid_param(
                "regkey_hex8 must be 8 lowercase ascii hex chars",
            ));
        }
        let regkey_hex8 = regkey_hex8.to_ascii_lowercase();
        let mut regkey_raw4 = [0u8; REGKEY_RAW_LEN];
        hex::decode_to_slice(&regkey_hex8, &mut regkey_raw4)
            .map_err(|_| Error::invalid_param("regkey_hex8 did not decode to 4 bytes"))?;

        if account_id_b64.len() != ACCOUNT_ID_B64_LEN {
            return Err(Error::invalid_param(
                "account_id_b64 must be exactly 14 chars",
            ));
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&account_id_b64)
            .map_err(|_| Error::invalid_param("account_id_b64 is not valid base64"))?;
        let account_id_le8: [u8; ACCOUNT_ID_RAW_LEN] = decoded
            .try_into()
            .map_err(|_| Error::invalid_param("account_id_b64 must decode to 8 bytes"))?;

        Ok(Self {
            console_ip: console_ip.into(),
            console_name: console_name.into(),
            target,
            rp_key_type,
            regkey_hex8,
            regkey_raw4,
            morning,
            account_id_b64,
            account_id_le8,
            is_valid,
            is_registered,
        })
    }

    pub fn regkey_hex8(&self) -> &str {
        &self.regkey_hex8
    }

    pub fn regkey_raw4(&self) -> [u8; REGKEY_RAW_LEN] {
        self.regkey_raw4
    }

    pub fn account_id_b64(&self) -> &str {
        &self.account_id_b64
    }

    pub fn account_id_le8(&self) -> [u8; ACCOUNT_ID_RAW_LEN] {
        self.account_id_le8
    }

    /// The wake credential, equal to `regkey_hex8` (spec.md §3).
    pub fn wake_credential(&self) -> &str {
        &self.regkey_hex8
    }

    pub fn usable(&self) -> bool {
        self.is_valid && self.is_registered
    }
}

/// Canonicalises a raw `rp_regist_key` buffer into the 8-lower-hex wire form
/// (spec.md §4.D canonicalisation rule, tested against spec.md §8 scenario 3).
///
/// Some consoles return 8 ASCII hex digits in the first 8 bytes of the
/// buffer; others return 4 raw binary bytes. Only the first 8 (or 4) bytes
/// of `raw` are consulted — callers pass the full registration-payload
/// buffer, which may be longer.
pub fn canonicalize_regkey(raw: &[u8]) -> Result<String, Error> {
    if raw.len() >= REGKEY_HEX_LEN && raw[..REGKEY_HEX_LEN].iter().all(u8::is_ascii_hexdigit) {
        let ascii = std::str::from_utf8(&raw[..REGKEY_HEX_LEN])
            .map_err(|_| Error::protocol("regist key ascii-hex bytes are not valid utf-8"))?;
        return Ok(ascii.to_ascii_lowercase());
    }
    if raw.len() < REGKEY_RAW_LEN {
        return Err(Error::protocol(
            "regist key buffer shorter than 4 bytes; cannot canonicalise",
        ));
    }
    Ok(hex::encode(&raw[..REGKEY_RAW_LEN]))
}

/// Opaque key-value lookup by console IP (spec.md §2 component E, §6).
///
/// Persistence format is intentionally unspecified; implementations are
/// injected by the surrounding application (spec.md §9 capability-bundle
/// design note).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ConsoleRegistration>, Error>;
    async fn save(&self, record: ConsoleRegistration) -> Result<(), Error>;
    async fn find_by_ip(&self, ip: &str) -> Result<Option<ConsoleRegistration>, Error>;
    async fn delete(&self, ip: &str) -> Result<(), Error>;
    async fn is_initialised(&self) -> bool;
}
