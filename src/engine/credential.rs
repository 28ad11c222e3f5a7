//! Bearer credentials handed to callers at issue time.
//!
//! The plaintext is returned once; the store only ever sees its SHA-256 digest.

use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use secrecy::SecretString;
use sha2::{Digest, Sha256};

use super::{error::ElevationError, types::hex};

const PREFIX: &str = "elv_";

/// Create a new bearer credential and its storage digest.
///
/// # Errors
/// Returns `ElevationError::Storage` if the OS random source fails.
pub fn generate_credential() -> Result<(SecretString, String), ElevationError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| ElevationError::Storage(format!("failed to generate credential: {err}")))?;
    let credential = format!(
        "{PREFIX}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    );
    let digest = hash_credential(&credential);
    Ok((SecretString::from(credential), digest))
}

/// Hex digest used for lookups when a credential is presented.
#[must_use]
pub fn hash_credential(credential: &str) -> String {
    hex(&Sha256::digest(credential.trim().as_bytes()))
}

/// Cheap shape check before touching the store.
#[must_use]
pub fn looks_like_credential(value: &str) -> bool {
    value
        .trim()
        .strip_prefix(PREFIX)
        .is_some_and(|body| body.len() == 43 && !body.contains(['+', '/', '=']))
}
