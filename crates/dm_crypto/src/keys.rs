//! Key material resolution
//!
//! The bridge runs under one long-term secp256k1 identity. The operator hands
//! it a credential in one of two forms:
//!
//!   - `nsec1…` — bech32 (checksummed) encoding of the raw 32-byte secret
//!   - 64 hex characters — the same 32 bytes, unencoded
//!
//! Both resolve to the same `KeyMaterial`. The public identity is the BIP-340
//! x-only public key (x-coordinate of `secret·G`); it is the routing key
//! relays filter on, so it must be bit-exact for a given secret.
//!
//! Public identities travel as lowercase hex on the wire and as `npub1…`
//! bech32 for humans.

use bech32::{FromBase32, ToBase32, Variant};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Human-readable prefix for bech32-encoded secrets.
pub const NSEC_HRP: &str = "nsec";
/// Human-readable prefix for bech32-encoded public identities.
pub const NPUB_HRP: &str = "npub";

// ── Public identity ───────────────────────────────────────────────────────────

/// 32-byte x-only secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicIdentity([u8; 32]);

impl PublicIdentity {
    /// Wrap raw bytes, rejecting x-coordinates that are not on the curve.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| CryptoError::InvalidKey("not a valid x-only public key".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(decode_hex_32(s.trim())?)
    }

    pub fn from_npub(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(decode_bech32(NPUB_HRP, s.trim())?)
    }

    /// Accept either `npub1…` or 64-char hex.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim();
        if s.starts_with("npub1") {
            Self::from_npub(s)
        } else {
            Self::from_hex(s)
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_npub(&self) -> Result<String, CryptoError> {
        encode_bech32(NPUB_HRP, &self.0)
    }

    /// First 8 hex characters, enough to tell senders apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({})", self.to_hex())
    }
}

impl std::str::FromStr for PublicIdentity {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Key material ──────────────────────────────────────────────────────────────

/// The bridge's secret plus its derived public identity. Drop clears memory
/// via ZeroizeOnDrop. Deliberately not `Clone`; share it behind an `Arc`.
#[derive(ZeroizeOnDrop)]
pub struct KeyMaterial {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: PublicIdentity,
}

impl KeyMaterial {
    /// Resolve an operator-supplied credential (`nsec1…` or hex).
    pub fn resolve(credential: &str) -> Result<Self, CryptoError> {
        let credential = credential.trim();
        let secret = if credential.starts_with("nsec1") {
            decode_bech32(NSEC_HRP, credential)?
        } else if credential.starts_with("npub1") {
            return Err(CryptoError::InvalidEncoding(
                "expected an nsec secret, got an npub public key".into(),
            ));
        } else {
            decode_hex_32(credential)?
        };
        let secret = Zeroizing::new(secret);
        Self::from_secret_bytes(&secret)
    }

    /// Build from raw secret bytes. Zero and out-of-range scalars are rejected.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing = SigningKey::from_bytes(secret)
            .map_err(|_| CryptoError::InvalidKey("secret is not a valid secp256k1 scalar".into()))?;
        let public = PublicIdentity(signing.verifying_key().to_bytes().into());
        Ok(Self {
            secret: *secret,
            public,
        })
    }

    /// Fresh random identity from the OS RNG.
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut OsRng);
        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(secret.to_bytes().into());
        // A freshly sampled SecretKey is always a valid non-zero scalar.
        match Self::from_secret_bytes(&bytes) {
            Ok(keys) => keys,
            Err(_) => unreachable!("k256 produced an invalid scalar"),
        }
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret))
    }

    pub fn to_nsec(&self) -> Result<Zeroizing<String>, CryptoError> {
        encode_bech32(NSEC_HRP, &self.secret).map(Zeroizing::new)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── Encoding helpers ─────────────────────────────────────────────────────────

fn decode_hex_32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::InvalidHex(format!("expected 32 bytes, got {}", b.len()))
    })
}

fn decode_bech32(expected_hrp: &str, s: &str) -> Result<[u8; 32], CryptoError> {
    let (hrp, data, variant) =
        bech32::decode(s).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if hrp != expected_hrp {
        return Err(CryptoError::InvalidEncoding(format!(
            "expected prefix '{expected_hrp}', got '{hrp}'"
        )));
    }
    if variant != Variant::Bech32 {
        return Err(CryptoError::InvalidEncoding("bech32m is not accepted".into()));
    }
    let bytes = Zeroizing::new(
        Vec::<u8>::from_base32(&data).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?,
    );
    let len = bytes.len();
    let mut out = [0u8; 32];
    if len != out.len() {
        return Err(CryptoError::InvalidEncoding(format!(
            "expected 32-byte payload, got {len}"
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn encode_bech32(hrp: &str, bytes: &[u8; 32]) -> Result<String, CryptoError> {
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
