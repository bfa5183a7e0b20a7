use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid encoded key: {0}")]
    InvalidEncoding(String),

    #[error("Invalid hex key: {0}")]
    InvalidHex(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Decryption failed: {0}")]
    Decryption(DecryptFailure),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Why a direct message could not be opened.
///
/// Every variant surfaces as the same `CryptoError::Decryption` kind; the
/// reason only exists so logs can tell a garbled envelope from a wrong key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    MalformedEnvelope,
    BadPadding,
    InvalidUtf8,
}

impl std::fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedEnvelope => f.write_str("malformed envelope"),
            Self::BadPadding => f.write_str("bad padding (wrong key?)"),
            Self::InvalidUtf8 => f.write_str("plaintext is not UTF-8"),
        }
    }
}

impl CryptoError {
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}
