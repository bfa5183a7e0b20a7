//! Direct-message envelopes (kind-4 content)
//!
//! Wire form: `base64(ciphertext) + "?iv=" + base64(iv)`, standard alphabet
//! with padding. Cipher: AES-256-CBC, PKCS#7, fresh random 16-byte IV per
//! message, keyed by the raw ECDH x-coordinate (see `ecdh`).
//!
//! There is no authentication tag. A wrong key almost always shows up as a
//! padding failure, occasionally as garbage that is not UTF-8, and in rare
//! cases as valid-looking garbage. Callers treat all three failure shapes the
//! same way.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};

use crate::ecdh::shared_secret;
use crate::error::{CryptoError, DecryptFailure};
use crate::keys::{KeyMaterial, PublicIdentity};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const IV_SEPARATOR: &str = "?iv=";

/// Parsed kind-4 content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

impl Envelope {
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            STANDARD.encode(&self.ciphertext),
            IV_SEPARATOR,
            STANDARD.encode(self.iv)
        )
    }

    /// Parse the `ct?iv=iv` form. Any structural problem is a
    /// `MalformedEnvelope` decryption error.
    pub fn decode(content: &str) -> Result<Self, CryptoError> {
        let malformed = || CryptoError::Decryption(DecryptFailure::MalformedEnvelope);

        let (ct_b64, iv_b64) = content.trim().split_once(IV_SEPARATOR).ok_or_else(malformed)?;
        let ciphertext = STANDARD.decode(ct_b64).map_err(|_| malformed())?;
        let iv_bytes = STANDARD.decode(iv_b64).map_err(|_| malformed())?;

        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(malformed());
        }
        let iv: [u8; IV_LEN] = iv_bytes.try_into().map_err(|_| malformed())?;

        Ok(Self { ciphertext, iv })
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Envelope {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Encrypt `plaintext` for `peer` with a fresh IV.
pub fn encrypt(
    local: &KeyMaterial,
    peer: &PublicIdentity,
    plaintext: &str,
) -> Result<Envelope, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = shared_secret(local, peer)?;
    let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(Envelope { ciphertext, iv })
}

/// Open an envelope sent by `peer`.
pub fn decrypt(
    local: &KeyMaterial,
    peer: &PublicIdentity,
    envelope: &Envelope,
) -> Result<String, CryptoError> {
    let key = shared_secret(local, peer)?;
    let cipher = Aes256CbcDec::new_from_slices(&key[..], &envelope.iv)
        .map_err(|_| CryptoError::Decryption(DecryptFailure::MalformedEnvelope))?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
        .map_err(|_| CryptoError::Decryption(DecryptFailure::BadPadding))?;
    String::from_utf8(plain).map_err(|_| CryptoError::Decryption(DecryptFailure::InvalidUtf8))
}

/// Encrypt and render straight to event content.
pub fn encrypt_to_string(
    local: &KeyMaterial,
    peer: &PublicIdentity,
    plaintext: &str,
) -> Result<String, CryptoError> {
    encrypt(local, peer, plaintext).map(|env| env.encode())
}

/// Parse event content and decrypt it.
pub fn decrypt_str(
    local: &KeyMaterial,
    peer: &PublicIdentity,
    content: &str,
) -> Result<String, CryptoError> {
    let envelope = Envelope::decode(content)?;
    decrypt(local, peer, &envelope)
}
