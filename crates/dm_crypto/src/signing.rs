//! BIP-340 Schnorr signatures over 32-byte digests.
//!
//! Event IDs are already SHA-256 digests, so signing uses the raw (prehashed)
//! API rather than hashing a second time.

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::{KeyMaterial, PublicIdentity};

pub const SIGNATURE_LEN: usize = 64;

/// Sign a 32-byte digest with fresh auxiliary randomness.
pub fn sign_digest(keys: &KeyMaterial, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let signing = SigningKey::from_bytes(keys.secret_bytes())
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    let mut aux = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut aux[..]);

    let sig = signing
        .sign_raw(digest, &aux)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(sig.to_bytes())
}

/// Verify a signature produced by `sign_digest` (or any BIP-340 signer).
pub fn verify_digest(
    signer: &PublicIdentity,
    digest: &[u8; 32],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(signer.as_bytes())
        .map_err(|_| CryptoError::SignatureVerification)?;
    let sig = Signature::try_from(&signature[..]).map_err(|_| CryptoError::SignatureVerification)?;
    key.verify_raw(digest, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}
