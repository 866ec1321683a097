//! Session key derivation and per-direction AEAD (spec.md §4.B).
//!
//! The exact KDF is an Open Question in spec.md §9 (no test vectors were
//! supplied); see `DESIGN.md` for the resolution. This module is written so
//! swapping the KDF later only touches `derive_session_keys`.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Error;

pub const MORNING_KEY_LEN: usize = 16;
const DERIVED_KEY_LEN: usize = 32;
const BASE_IV_LEN: usize = 12;

/// Session keys derived from the morning key plus both nonces.
///
/// `Clone` is intentionally shallow (no zeroizing wrapper); callers that
/// persist key material longer than one session should wrap it themselves.
#[derive(Clone)]
pub struct SessionKeys {
    pub key_control: [u8; DERIVED_KEY_LEN],
    pub key_stream: [u8; DERIVED_KEY_LEN],
    pub iv_c: [u8; BASE_IV_LEN],
    pub iv_s: [u8; BASE_IV_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl PartialEq for SessionKeys {
    /// Constant-time key comparison (spec.md §4.B: "must be constant-time in
    /// key compare").
    fn eq(&self, other: &Self) -> bool {
        let control_eq: bool = self.key_control.ct_eq(&other.key_control).into();
        let stream_eq: bool = self.key_stream.ct_eq(&other.key_stream).into();
        control_eq & stream_eq
    }
}

/// Derives control/stream session keys from the 16-byte morning key and both
/// handshake nonces.
///
/// Resolution of spec.md §9's open KDF question: HKDF-SHA256 with
/// `salt = nonce_client || nonce_server`, `ikm = morning`, and distinct info
/// strings per derived value. See `DESIGN.md` for why.
pub fn derive_session_keys(
    morning: &[u8],
    nonce_client: &[u8],
    nonce_server: &[u8],
) -> Result<SessionKeys, Error> {
    if morning.len() != MORNING_KEY_LEN {
        return Err(Error::crypto(format!(
            "morning key must be {MORNING_KEY_LEN} bytes, got {}",
            morning.len()
        )));
    }

    let mut salt = Vec::with_capacity(nonce_client.len() + nonce_server.len());
    salt.extend_from_slice(nonce_client);
    salt.extend_from_slice(nonce_server);

    let hk = Hkdf::<Sha256>::new(Some(&salt), morning);

    let mut key_control = [0u8; DERIVED_KEY_LEN];
    hk.expand(b"rpsession-control-v1", &mut key_control)
        .map_err(|_| Error::crypto("hkdf expand failed for control key"))?;

    let mut key_stream = [0u8; DERIVED_KEY_LEN];
    hk.expand(b"rpsession-stream-v1", &mut key_stream)
        .map_err(|_| Error::crypto("hkdf expand failed for stream key"))?;

    let mut iv_material = [0u8; BASE_IV_LEN * 2];
    hk.expand(b"rpsession-iv-v1", &mut iv_material)
        .map_err(|_| Error::crypto("hkdf expand failed for iv material"))?;
    let mut iv_c = [0u8; BASE_IV_LEN];
    let mut iv_s = [0u8; BASE_IV_LEN];
    iv_c.copy_from_slice(&iv_material[..BASE_IV_LEN]);
    iv_s.copy_from_slice(&iv_material[BASE_IV_LEN..]);

    Ok(SessionKeys {
        key_control,
        key_stream,
        iv_c,
        iv_s,
    })
}

/// Which derived key/IV pair a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Control,
    Stream,
}

/// Builds the per-message nonce from a base IV and a monotonically
/// increasing counter. The counter must never repeat for a given
/// `(key, direction)` pair (spec.md §4.B).
fn counter_nonce(base_iv: &[u8; BASE_IV_LEN], counter: u64) -> Nonce {
    let mut nonce_bytes = *base_iv;
    let counter_bytes = counter.to_be_bytes();
    for (b, c) in nonce_bytes[BASE_IV_LEN - 8..].iter_mut().zip(counter_bytes) {
        *b ^= c;
    }
    *Nonce::from_slice(&nonce_bytes)
}

fn select_key_and_iv<'a>(
    keys: &'a SessionKeys,
    stream_id: StreamId,
    direction_client_to_server: bool,
) -> (&'a [u8; DERIVED_KEY_LEN], &'a [u8; BASE_IV_LEN]) {
    let key = match stream_id {
        StreamId::Control => &keys.key_control,
        StreamId::Stream => &keys.key_stream,
    };
    let iv = if direction_client_to_server {
        &keys.iv_c
    } else {
        &keys.iv_s
    };
    (key, iv)
}

/// Encrypts `plaintext` for the given channel/direction/counter, returning
/// ciphertext with the AEAD tag appended.
pub fn encrypt(
    keys: &SessionKeys,
    stream_id: StreamId,
    direction_client_to_server: bool,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let (key, iv) = select_key_and_iv(keys, stream_id, direction_client_to_server);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(iv, counter);
    cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| Error::crypto("AEAD encryption failed"))
}

/// Inverse of [`encrypt`].
pub fn decrypt(
    keys: &SessionKeys,
    stream_id: StreamId,
    direction_client_to_server: bool,
    counter: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let (key, iv) = select_key_and_iv(keys, stream_id, direction_client_to_server);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(iv, counter);
    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::crypto("AEAD decryption/authentication failed"))
}
