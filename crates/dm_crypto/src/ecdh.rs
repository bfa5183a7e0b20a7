//! secp256k1 shared-secret derivation
//!
//! The peer's x-only identity is lifted to a full point with an even-y prefix
//! (`0x02 || x`). The shared secret is the raw x-coordinate of `secret·peer`,
//! unhashed; this is the AES-256 key for direct messages.
//!
//! Lifting with either parity yields the same x-coordinate after
//! multiplication, so the choice of prefix never changes the result.

use k256::{ecdh::diffie_hellman, PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::{KeyMaterial, PublicIdentity};

pub fn shared_secret(
    local: &KeyMaterial,
    peer: &PublicIdentity,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let secret = SecretKey::from_slice(local.secret_bytes())
        .map_err(|_| CryptoError::InvalidKey("local secret rejected by curve".into()))?;

    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(peer.as_bytes());
    let point = PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| CryptoError::InvalidKey("peer identity is not on the curve".into()))?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), point.as_affine());
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}
